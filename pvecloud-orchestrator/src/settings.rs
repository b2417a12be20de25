use anyhow::{anyhow, Context, Result};
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::lifecycle::LifecycleConfig;
use crate::task_waiter::WaitPolicy;

pub const DEFAULT_SELECT_COEFF: f64 = 4.0 * 1024.0 * 1024.0 * 1024.0;
pub const DEFAULT_MAX_START_RETRY: i32 = 10;
pub const DEFAULT_INSTANCE_PREFIX: &str = "INSTANCE";

/// Process configuration, read once at startup and handed to constructors.
#[derive(Debug, Clone)]
pub struct Settings {
    pub proxmox_endpoint: String,
    /// `<user>=<secret>`, sent as `PVEAPIToken=...`.
    pub proxmox_token: String,
    pub proxmox_timeout: Duration,
    pub select_coeff: f64,
    pub metadata_server: String,
    pub project_id: Option<String>,
    pub instance_prefix: String,
    pub max_start_retry: i32,
    pub clone_wait: WaitPolicy,
    pub task_wait: WaitPolicy,
    pub database_url: String,
    pub admin_addr: SocketAddr,
    pub watch_dog_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let proxmox_endpoint = get("PVE_ENDPOINT").context("PVE_ENDPOINT must be set")?;
        let token_user = get("PVE_TOKEN_USER").context("PVE_TOKEN_USER must be set")?;
        // Prefer *_FILE for secrets (Docker/K8s friendly), fallback to env var.
        let token_secret = get("PVE_TOKEN_SECRET_FILE")
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| get("PVE_TOKEN_SECRET"))
            .context("PVE_TOKEN_SECRET or PVE_TOKEN_SECRET_FILE must be set")?;

        let metadata_server =
            get("PVE_METADATA_SERVER").context("PVE_METADATA_SERVER must be set")?;
        let database_url = get("DATABASE_URL").context("DATABASE_URL must be set")?;

        let select_coeff: f64 = parse_or(&get, "PVE_SELECT_COEFF", DEFAULT_SELECT_COEFF)?;
        if select_coeff <= 0.0 {
            return Err(anyhow!("PVE_SELECT_COEFF must be positive"));
        }

        // A zero period would spin the pollers or panic `tokio::time::interval`.
        let millis = |key: &str, default: u64| -> Result<Duration> {
            positive(key, parse_or(&get, key, default)?, Duration::from_millis)
        };
        let secs = |key: &str, default: u64| -> Result<Duration> {
            positive(key, parse_or(&get, key, default)?, Duration::from_secs)
        };

        Ok(Self {
            proxmox_endpoint,
            proxmox_token: format!("{}={}", token_user, token_secret),
            proxmox_timeout: millis("PVE_TIMEOUT_MS", 20_000)?,
            select_coeff,
            metadata_server,
            project_id: get("PVE_PROJECT_ID"),
            instance_prefix: get("PVE_INSTANCE_PREFIX")
                .unwrap_or_else(|| DEFAULT_INSTANCE_PREFIX.to_string()),
            max_start_retry: parse_or(&get, "PVE_MAX_START_RETRY", DEFAULT_MAX_START_RETRY)?,
            clone_wait: WaitPolicy {
                interval: millis("PVE_CLONE_POLL_MS", 1_000)?,
                max_wait: secs("PVE_CLONE_TIMEOUT_SECS", 600)?,
            },
            task_wait: WaitPolicy {
                interval: millis("PVE_TASK_POLL_MS", 500)?,
                max_wait: secs("PVE_TASK_TIMEOUT_SECS", 300)?,
            },
            database_url,
            admin_addr: parse_or(
                &get,
                "ADMIN_LISTEN_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 8001)),
            )?,
            watch_dog_interval: secs("WATCH_DOG_INTERVAL_SECS", 60)?,
        })
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        LifecycleConfig {
            select_coeff: self.select_coeff,
            max_start_retry: self.max_start_retry,
            metadata_server: self.metadata_server.clone(),
            project_id: self.project_id.clone(),
            instance_prefix: self.instance_prefix.clone(),
            clone_wait: self.clone_wait,
            task_wait: self.task_wait,
        }
    }
}

fn positive(key: &str, value: u64, unit: fn(u64) -> Duration) -> Result<Duration> {
    if value == 0 {
        return Err(anyhow!("{} must be positive", key));
    }
    Ok(unit(value))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {}={:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}
