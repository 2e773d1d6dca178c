use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Rpc,
    Mock,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub mode: ChainMode,
    pub rpc_url: String,
    pub chain_id: Option<u64>,
    pub private_key: [u8; 32],
    pub oracle_registry: Option<Address>,
    pub proposal_manager: Option<Address>,
    pub staking_manager: Option<Address>,
    pub liveness_window_secs: i64,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub event_manager_url: String,
    pub proposal_service_url: String,
    pub dispute_service_url: String,
    pub reward_service_url: String,
    pub notification_service_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub settlement_delay: Duration,
    pub liveness_attempts: u32,
    pub liveness_backoff: Duration,
    pub settlement_attempts: u32,
    pub settlement_backoff: Duration,
    pub scheduler_tick: Duration,
    pub queue_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub poll_interval: Duration,
    pub replay_blocks: u64,
}

/// Cache transport target. The key/value semantics live in `cache.rs`; the
/// Redis endpoint is the deployment's backing store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,
    pub event_ttl: Duration,
}

/// Persistence target owned by the event-manager deployment; validated here
/// because startup must fail fast on an incomplete environment.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub node_env: String,
    pub chain: ChainConfig,
    pub peers: PeerConfig,
    pub jobs: JobsConfig,
    pub indexer: IndexerConfig,
    pub cache: CacheConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Env {
    node_env: String,

    chain_mode: String,

    bnb_rpc_url: String,

    chain_id: Option<u64>,

    private_key: String,

    oracle_registry_address: String,

    proposal_manager_address: String,

    staking_manager_address: String,

    event_manager_url: String,

    proposal_service_url: String,

    dispute_service_url: String,

    reward_service_url: String,

    notification_service_url: String,

    redis_host: String,

    redis_port: u16,

    redis_password: String,

    postgres_host: String,

    postgres_port: u16,

    postgres_user: String,

    postgres_password: String,

    postgres_name: String,

    liveness_window_secs: i64,

    settlement_delay_secs: u64,

    liveness_job_attempts: u32,

    liveness_job_backoff_secs: u64,

    settlement_job_attempts: u32,

    settlement_job_backoff_secs: u64,

    indexer_poll_interval_secs: u64,

    indexer_replay_blocks: u64,

    event_cache_ttl_secs: u64,

    peer_timeout_secs: u64,

    scheduler_tick_ms: u64,

    queue_concurrency: u64,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            node_env: String::new(),
            chain_mode: "rpc".to_string(),
            bnb_rpc_url: String::new(),
            chain_id: None,
            private_key: String::new(),
            oracle_registry_address: String::new(),
            proposal_manager_address: String::new(),
            staking_manager_address: String::new(),
            event_manager_url: String::new(),
            proposal_service_url: String::new(),
            dispute_service_url: String::new(),
            reward_service_url: String::new(),
            notification_service_url: String::new(),
            redis_host: String::new(),
            redis_port: 0,
            redis_password: String::new(),
            postgres_host: String::new(),
            postgres_port: 0,
            postgres_user: String::new(),
            postgres_password: String::new(),
            postgres_name: String::new(),
            liveness_window_secs: 7_200,
            settlement_delay_secs: 60,
            liveness_job_attempts: 3,
            liveness_job_backoff_secs: 5,
            settlement_job_attempts: 5,
            settlement_job_backoff_secs: 10,
            indexer_poll_interval_secs: 10,
            indexer_replay_blocks: 100,
            event_cache_ttl_secs: 300,
            peer_timeout_secs: 10,
            scheduler_tick_ms: 200,
            queue_concurrency: 8,
        }
    }
}

fn parse_chain_mode(s: &str) -> Result<ChainMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "rpc" => Ok(ChainMode::Rpc),
        "mock" => Ok(ChainMode::Mock),
        other => anyhow::bail!("unsupported CHAIN_MODE: {other} (expected: rpc|mock)"),
    }
}

fn parse_address(label: &str, s: &str) -> Result<Address> {
    s.parse::<Address>()
        .with_context(|| format!("invalid {label}: {s}"))
}

fn parse_hex_32(label: &str, s: &str) -> Result<[u8; 32]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("invalid hex for {label}"))?;
    if bytes.len() != 32 {
        anyhow::bail!("{label} must be 32 bytes (got {})", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn require(label: &str, s: &str) -> Result<()> {
    if s.trim().is_empty() {
        anyhow::bail!("{label} must be set");
    }
    Ok(())
}

pub fn load_config() -> Result<AppConfig> {
    let env: Env = envy::from_env().context("load engine env config")?;
    build(env)
}

pub fn build(env: Env) -> Result<AppConfig> {
    require("NODE_ENV", &env.node_env)?;
    require("EVENT_MANAGER_URL", &env.event_manager_url)?;
    require("PROPOSAL_SERVICE_URL", &env.proposal_service_url)?;
    require("DISPUTE_SERVICE_URL", &env.dispute_service_url)?;
    require("REWARD_SERVICE_URL", &env.reward_service_url)?;
    require("NOTIFICATION_SERVICE_URL", &env.notification_service_url)?;

    require("REDIS_HOST", &env.redis_host)?;
    if env.redis_port == 0 {
        anyhow::bail!("REDIS_PORT must be set");
    }
    require("REDIS_PASSWORD", &env.redis_password)?;

    require("POSTGRES_HOST", &env.postgres_host)?;
    if env.postgres_port == 0 {
        anyhow::bail!("POSTGRES_PORT must be set");
    }
    require("POSTGRES_USER", &env.postgres_user)?;
    require("POSTGRES_PASSWORD", &env.postgres_password)?;
    require("POSTGRES_NAME", &env.postgres_name)?;

    let mode = parse_chain_mode(&env.chain_mode)?;
    let chain = match mode {
        ChainMode::Rpc => {
            require("BNB_RPC_URL", &env.bnb_rpc_url)?;
            require("PRIVATE_KEY", &env.private_key)?;
            require("ORACLE_REGISTRY_ADDRESS", &env.oracle_registry_address)?;
            require("PROPOSAL_MANAGER_ADDRESS", &env.proposal_manager_address)?;
            require("STAKING_MANAGER_ADDRESS", &env.staking_manager_address)?;
            ChainConfig {
                mode,
                rpc_url: env.bnb_rpc_url,
                chain_id: env.chain_id,
                private_key: parse_hex_32("PRIVATE_KEY", &env.private_key)?,
                oracle_registry: Some(parse_address(
                    "ORACLE_REGISTRY_ADDRESS",
                    &env.oracle_registry_address,
                )?),
                proposal_manager: Some(parse_address(
                    "PROPOSAL_MANAGER_ADDRESS",
                    &env.proposal_manager_address,
                )?),
                staking_manager: Some(parse_address(
                    "STAKING_MANAGER_ADDRESS",
                    &env.staking_manager_address,
                )?),
                liveness_window_secs: env.liveness_window_secs.max(1),
            }
        }
        ChainMode::Mock => ChainConfig {
            mode,
            rpc_url: env.bnb_rpc_url,
            chain_id: env.chain_id,
            private_key: [0u8; 32],
            oracle_registry: None,
            proposal_manager: None,
            staking_manager: None,
            liveness_window_secs: env.liveness_window_secs.max(1),
        },
    };

    Ok(AppConfig {
        node_env: env.node_env,
        chain,
        peers: PeerConfig {
            event_manager_url: env.event_manager_url,
            proposal_service_url: env.proposal_service_url,
            dispute_service_url: env.dispute_service_url,
            reward_service_url: env.reward_service_url,
            notification_service_url: env.notification_service_url,
            timeout: Duration::from_secs(env.peer_timeout_secs.max(1)),
        },
        jobs: JobsConfig {
            settlement_delay: Duration::from_secs(env.settlement_delay_secs),
            liveness_attempts: env.liveness_job_attempts.max(1),
            liveness_backoff: Duration::from_secs(env.liveness_job_backoff_secs.max(1)),
            settlement_attempts: env.settlement_job_attempts.max(1),
            settlement_backoff: Duration::from_secs(env.settlement_job_backoff_secs.max(1)),
            scheduler_tick: Duration::from_millis(env.scheduler_tick_ms.max(10)),
            queue_concurrency: usize::try_from(env.queue_concurrency.max(1)).unwrap_or(8),
        },
        indexer: IndexerConfig {
            poll_interval: Duration::from_secs(env.indexer_poll_interval_secs.max(1)),
            replay_blocks: env.indexer_replay_blocks,
        },
        cache: CacheConfig {
            redis_host: env.redis_host,
            redis_port: env.redis_port,
            redis_password: env.redis_password,
            event_ttl: Duration::from_secs(env.event_cache_ttl_secs.max(1)),
        },
        database: DatabaseConfig {
            host: env.postgres_host,
            port: env.postgres_port,
            user: env.postgres_user,
            password: env.postgres_password,
            name: env.postgres_name,
        },
    })
}
