// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! Server configuration.
//!
//! One typed snapshot of the environment, read once at startup. Chain
//! endpoints and registry contract addresses default per chain id and
//! may be overridden individually.

use std::time::Duration;

use alloy_primitives::Address;

use crate::domain::error::ServerError;

pub const MAINNET_CHAIN_ID: u64 = 1480;
pub const TESTNET_CHAIN_ID: u64 = 14800;

const MAINNET_RPC_URL: &str = "https://rpc.vana.org";
const TESTNET_RPC_URL: &str = "https://rpc.moksha.vana.org";

// Registry deployments share addresses across both chains.
const DATA_PERMISSIONS_ADDRESS: &str = "0xD54523048AdD05b4d734aFaE7C68324Ebb7373eF";
const DATA_REGISTRY_ADDRESS: &str = "0x8C8788f98385F6ba1adD4234e551ABba0f82Cb7C";
const DATA_GRANTEES_ADDRESS: &str = "0x8325C0A0948483EdA023A1A2Fd895e62C5131234";

const DEFAULT_GATEWAYS: [&str; 3] = [
    "https://ipfs.io/ipfs/",
    "https://gateway.pinata.cloud/ipfs/",
    "https://cloudflare-ipfs.com/ipfs/",
];

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    pub permissions_address: Address,
    pub registry_address: Address,
    pub grantees_address: Address,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Ordered content gateway bases; a CID is appended to each.
    pub gateways: Vec<String>,
    pub timeout: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub max_file_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            gateways: DEFAULT_GATEWAYS.iter().map(|g| g.to_string()).collect(),
            timeout: Duration::from_secs(30),
            retry_base: Duration::from_millis(500),
            retry_cap: Duration::from_secs(8),
            max_file_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Container,
    Process,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub runtime: SandboxKind,
    pub image: String,
    pub memory_bytes: u64,
    pub cpus: f64,
    pub timeout: Duration,
    pub max_stdout_bytes: usize,
    pub max_concurrent: usize,
    pub allow_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: SandboxKind::Process,
            image: "agent-sandbox".to_string(),
            memory_bytes: 512 * 1024 * 1024,
            cpus: 1.0,
            timeout: Duration::from_secs(300),
            max_stdout_bytes: 2_000_000,
            max_concurrent: 1,
            allow_network: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_token: String,
    pub model: String,
    pub max_prompt_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct AgentCredentials {
    pub qwen_api_key: Option<String>,
    pub qwen_api_url: Option<String>,
    pub qwen_model: Option<String>,
    pub gemini_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ArtifactBackend {
    S3 {
        bucket: String,
        endpoint: String,
        access_key_id: String,
        secret_access_key: String,
    },
    Local {
        root: String,
    },
}

#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub backend: ArtifactBackend,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub chain: ChainConfig,
    pub wallet_mnemonic: String,
    pub mnemonic_language: String,
    pub fetch: FetchConfig,
    pub sandbox: SandboxConfig,
    pub llm: LlmConfig,
    pub agents: AgentCredentials,
    pub artifacts: ArtifactConfig,
    pub task_cleanup_ttl: Duration,
    /// Testing aid: skip signature recovery and act as a fixed address.
    pub mock_mode: bool,
    pub bind_addr: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ServerError> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ServerError::Validation(format!("invalid value for {name}: {raw}"))),
        None => Ok(default),
    }
}

fn env_address(name: &str, default: &str) -> Result<Address, ServerError> {
    let raw = env_var(name).unwrap_or_else(|| default.to_string());
    raw.parse()
        .map_err(|_| ServerError::Validation(format!("invalid address for {name}: {raw}")))
}

impl ServerConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ServerError> {
        let chain_id: u64 = env_parse("CHAIN_ID", TESTNET_CHAIN_ID)?;
        let default_rpc = match chain_id {
            MAINNET_CHAIN_ID => MAINNET_RPC_URL,
            TESTNET_CHAIN_ID => TESTNET_RPC_URL,
            other => {
                return Err(ServerError::Validation(format!(
                    "unsupported chain id: {other}"
                )))
            }
        };

        let chain = ChainConfig {
            chain_id,
            rpc_url: env_var("CHAIN_RPC_URL").unwrap_or_else(|| default_rpc.to_string()),
            permissions_address: env_address("DATA_PERMISSIONS_ADDRESS", DATA_PERMISSIONS_ADDRESS)?,
            registry_address: env_address("DATA_REGISTRY_ADDRESS", DATA_REGISTRY_ADDRESS)?,
            grantees_address: env_address("DATA_GRANTEES_ADDRESS", DATA_GRANTEES_ADDRESS)?,
        };

        let wallet_mnemonic = env_var("WALLET_MNEMONIC")
            .ok_or_else(|| ServerError::Validation("WALLET_MNEMONIC is not set".into()))?;

        let fetch_defaults = FetchConfig::default();
        let fetch = FetchConfig {
            gateways: env_var("IPFS_GATEWAYS")
                .map(|raw| {
                    raw.split(',')
                        .map(|g| g.trim().to_string())
                        .filter(|g| !g.is_empty())
                        .collect()
                })
                .unwrap_or(fetch_defaults.gateways),
            timeout: Duration::from_secs(env_parse(
                "FETCH_TIMEOUT_SECS",
                fetch_defaults.timeout.as_secs(),
            )?),
            retry_base: Duration::from_millis(env_parse(
                "FETCH_RETRY_BASE_MS",
                fetch_defaults.retry_base.as_millis() as u64,
            )?),
            retry_cap: Duration::from_millis(env_parse(
                "FETCH_RETRY_CAP_MS",
                fetch_defaults.retry_cap.as_millis() as u64,
            )?),
            max_file_bytes: env_parse("FETCH_MAX_FILE_BYTES", fetch_defaults.max_file_bytes)?,
        };

        let sandbox_defaults = SandboxConfig::default();
        let sandbox = SandboxConfig {
            runtime: match env_var("SANDBOX_RUNTIME").as_deref() {
                Some("container") => SandboxKind::Container,
                Some("process") | None => SandboxKind::Process,
                Some(other) => {
                    return Err(ServerError::Validation(format!(
                        "unknown sandbox runtime: {other}"
                    )))
                }
            },
            image: env_var("SANDBOX_IMAGE").unwrap_or(sandbox_defaults.image),
            memory_bytes: env_parse("SANDBOX_MEMORY_MB", 512u64)? * 1024 * 1024,
            cpus: env_parse("SANDBOX_CPUS", sandbox_defaults.cpus)?,
            timeout: Duration::from_secs(env_parse(
                "SANDBOX_TIMEOUT_SECS",
                sandbox_defaults.timeout.as_secs(),
            )?),
            max_stdout_bytes: env_parse(
                "SANDBOX_MAX_STDOUT_BYTES",
                sandbox_defaults.max_stdout_bytes,
            )?,
            max_concurrent: env_parse("SANDBOX_MAX_CONCURRENT", sandbox_defaults.max_concurrent)?,
            allow_network: env_parse("SANDBOX_ALLOW_NETWORK", sandbox_defaults.allow_network)?,
        };

        let llm = LlmConfig {
            api_token: env_var("REPLICATE_API_TOKEN")
                .ok_or_else(|| ServerError::Validation("REPLICATE_API_TOKEN is not set".into()))?,
            model: env_var("REPLICATE_MODEL")
                .unwrap_or_else(|| "deepseek-ai/deepseek-v3".to_string()),
            max_prompt_bytes: env_parse("LLM_MAX_PROMPT_BYTES", 200_000usize)?,
        };

        let agents = AgentCredentials {
            qwen_api_key: env_var("QWEN_API_KEY"),
            qwen_api_url: env_var("QWEN_API_URL"),
            qwen_model: env_var("QWEN_MODEL"),
            gemini_api_key: env_var("GEMINI_API_KEY"),
        };

        let backend = match (env_var("ARTIFACTS_BUCKET"), env_var("ARTIFACTS_ENDPOINT")) {
            (Some(bucket), Some(endpoint)) => ArtifactBackend::S3 {
                bucket,
                endpoint,
                access_key_id: env_var("ARTIFACTS_ACCESS_KEY_ID").unwrap_or_default(),
                secret_access_key: env_var("ARTIFACTS_SECRET_ACCESS_KEY").unwrap_or_default(),
            },
            _ => ArtifactBackend::Local {
                root: env_var("ARTIFACTS_LOCAL_PATH")
                    .unwrap_or_else(|| "/var/lib/personal-server/artifacts".to_string()),
            },
        };

        let artifacts = ArtifactConfig {
            backend,
            ttl: Duration::from_secs(env_parse("ARTIFACT_TTL_DAYS", 7u64)? * 24 * 3600),
        };

        Ok(Self {
            chain,
            wallet_mnemonic,
            mnemonic_language: env_var("MNEMONIC_LANGUAGE").unwrap_or_else(|| "english".into()),
            fetch,
            sandbox,
            llm,
            agents,
            artifacts,
            task_cleanup_ttl: Duration::from_secs(env_parse("TASK_CLEANUP_TTL_SECS", 3600u64)?),
            mock_mode: env_parse("MOCK_MODE", false)?,
            bind_addr: env_var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_defaults_are_sane() {
        let fetch = FetchConfig::default();
        assert_eq!(fetch.gateways.len(), 3);
        assert_eq!(fetch.max_file_bytes, 5 * 1024 * 1024);
        assert!(fetch.retry_base < fetch.retry_cap);
    }

    #[test]
    fn registry_addresses_parse() {
        for raw in [
            DATA_PERMISSIONS_ADDRESS,
            DATA_REGISTRY_ADDRESS,
            DATA_GRANTEES_ADDRESS,
        ] {
            assert!(raw.parse::<Address>().is_ok());
        }
    }
}
