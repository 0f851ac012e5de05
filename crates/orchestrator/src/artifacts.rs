//! Renders the fixed set of files a Nitro+DA deployment ships to the
//! caller: a chain-info document, the DA-layer config, the resolved
//! contract addresses, a fresh JWT, a docker-compose stack, an env file,
//! four operator scripts, and a README.

use crate::nitro::NitroConfig;
use popsigner_core::{Artifact, Deployment};
use rand::RngCore;
use std::collections::BTreeMap;

/// Generates 32 cryptographically random bytes and hex-encodes them, per
/// the Nitro+DA `jwt.txt` artifact contract (64 hex characters).
pub fn generate_jwt_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Renders every Nitro+DA artifact for `deployment`, given its resolved
/// contract addresses and a freshly generated JWT.
pub fn render_all(deployment: &Deployment, config: &NitroConfig, contracts: &BTreeMap<String, String>, jwt_hex: &str) -> Vec<Artifact> {
    let now = chrono::Utc::now();
    let mk = |artifact_type: &str, body: Vec<u8>| Artifact {
        deployment_id: deployment.id,
        artifact_type: artifact_type.to_string(),
        body,
        created_at: now,
    };

    let addresses_json = serde_json::to_vec_pretty(&serde_json::json!({
        "chainId": deployment.chain_id,
        "contracts": contracts,
    }))
    .unwrap_or_default();

    let chain_info_json = serde_json::to_vec_pretty(&serde_json::json!({
        "chainId": deployment.chain_id,
        "chainName": format!("nitro-{}", deployment.id),
        "l1RpcUrl": config.l1_rpc_url,
        "l1ChainId": config.l1_chain_id,
        "rollupCreator": contracts.get("rollup_creator"),
    }))
    .unwrap_or_default();

    vec![
        mk("chain-info.json", chain_info_json),
        mk("celestia-config.toml", celestia_config_toml(config).into_bytes()),
        mk("addresses.json", addresses_json),
        mk("jwt.txt", jwt_hex.as_bytes().to_vec()),
        mk("docker-compose.yml", docker_compose_yml(deployment, config).into_bytes()),
        mk(".env", env_file(deployment, config).into_bytes()),
        mk("scripts/start.sh", start_script().into_bytes()),
        mk("scripts/stop.sh", stop_script().into_bytes()),
        mk("scripts/reset.sh", reset_script().into_bytes()),
        mk("scripts/test.sh", test_script().into_bytes()),
        mk("README.md", readme(deployment).into_bytes()),
    ]
}

fn celestia_config_toml(config: &NitroConfig) -> String {
    format!(
        "[da]\nlayer = \"celestia\"\nnamespace = \"{}\"\nrpc_endpoint = \"{}\"\nauth_token_file = \"jwt.txt\"\n",
        config.celestia_namespace, config.celestia_rpc_endpoint
    )
}

fn docker_compose_yml(deployment: &Deployment, config: &NitroConfig) -> String {
    format!(
        "version: \"3.9\"\nservices:\n  nitro-node:\n    image: offchainlabs/nitro-node:latest\n    env_file: .env\n    volumes:\n      - ./chain-info.json:/config/chain-info.json:ro\n      - ./jwt.txt:/config/jwt.txt:ro\n    ports:\n      - \"8547:8547\"\n  celestia-da:\n    image: ghcr.io/celestiaorg/celestia-node:latest\n    environment:\n      - CELESTIA_NAMESPACE={}\n    volumes:\n      - ./celestia-config.toml:/config/celestia-config.toml:ro\n# deployment {}\n# l1_rpc_url {}\n",
        config.celestia_namespace, deployment.id, config.l1_rpc_url
    )
}

fn env_file(deployment: &Deployment, config: &NitroConfig) -> String {
    format!(
        "CHAIN_ID={}\nDEPLOYMENT_ID={}\nL1_RPC_URL={}\nL1_CHAIN_ID={}\nCELESTIA_NAMESPACE={}\n",
        deployment.chain_id, deployment.id, config.l1_rpc_url, config.l1_chain_id, config.celestia_namespace
    )
}

fn start_script() -> String {
    "#!/usr/bin/env bash\nset -euo pipefail\ndocker compose up -d\n".to_string()
}

fn stop_script() -> String {
    "#!/usr/bin/env bash\nset -euo pipefail\ndocker compose down\n".to_string()
}

fn reset_script() -> String {
    "#!/usr/bin/env bash\nset -euo pipefail\ndocker compose down -v\n".to_string()
}

fn test_script() -> String {
    "#!/usr/bin/env bash\nset -euo pipefail\ncurl -sf http://localhost:8547 -X POST -H 'content-type: application/json' -d '{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"eth_blockNumber\",\"params\":[]}'\n"
        .to_string()
}

fn readme(deployment: &Deployment) -> String {
    format!(
        "# Nitro+DA deployment {}\n\nRun `scripts/start.sh` to bring the stack up, `scripts/test.sh` to probe it, and `scripts/stop.sh` (or `scripts/reset.sh` to also drop volumes) to tear it down.\n",
        deployment.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use popsigner_core::{DeploymentStatus, Stack};
    use uuid::Uuid;

    fn sample_deployment() -> Deployment {
        Deployment {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            stack: Stack::Nitro,
            chain_id: 42170,
            status: DeploymentStatus::Running,
            stage: "materialize_artifacts".to_string(),
            error: None,
            config: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn jwt_is_64_hex_characters() {
        let jwt = generate_jwt_hex();
        assert_eq!(jwt.len(), 64);
        assert!(jwt.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn renders_the_full_fixed_artifact_set() {
        let deployment = sample_deployment();
        let config = NitroConfig {
            l1_rpc_url: "http://localhost:8545".to_string(),
            l1_chain_id: 1,
            celestia_namespace: "popsigner".to_string(),
            celestia_rpc_endpoint: "http://localhost:26658".to_string(),
        };
        let mut contracts = BTreeMap::new();
        contracts.insert("rollup_creator".to_string(), "0xaaaa000000000000000000000000000000aaaa".to_string());

        let jwt = generate_jwt_hex();
        let artifacts = render_all(&deployment, &config, &contracts, &jwt);

        let expected: Vec<&str> = vec![
            "chain-info.json",
            "celestia-config.toml",
            "addresses.json",
            "jwt.txt",
            "docker-compose.yml",
            ".env",
            "scripts/start.sh",
            "scripts/stop.sh",
            "scripts/reset.sh",
            "scripts/test.sh",
            "README.md",
        ];
        let got: Vec<&str> = artifacts.iter().map(|a| a.artifact_type.as_str()).collect();
        assert_eq!(got, expected);
        assert!(artifacts.iter().all(|a| !a.body.is_empty()));
    }
}
