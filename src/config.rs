use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::Utc;

/// Default JSON log destination; the sink falls back to the working
/// directory when this directory cannot be created.
pub const DEFAULT_LOG_PATH: &str = "/var/log/frr/async_route_convergence_cpp.json";

/// Default quiet period that closes a session.
pub const DEFAULT_THRESHOLD_MS: i64 = 3000;

/// Runtime configuration for the monitor, assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct Config {
    /// Quiet period (ms) after which the route table counts as converged.
    pub threshold_ms: i64,

    /// Identifies this host in every record.
    pub router_name: String,

    /// Where the JSON record stream goes.
    pub log_path: PathBuf,

    /// Account the monitor runs as, stamped on every record.
    pub user: String,
}

impl Config {
    /// Build a config from CLI values, filling in generated defaults.
    pub fn new(
        threshold_ms: i64,
        router_name: Option<String>,
        log_path: Option<PathBuf>,
    ) -> Self {
        let user = current_user();
        let router_name = router_name.unwrap_or_else(|| default_router_name(&user));
        let log_path = log_path.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH));

        Self {
            threshold_ms,
            router_name,
            log_path,
            user,
        }
    }

    /// Validate for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.threshold_ms <= 0 {
            bail!("convergence threshold must be positive, got {}", self.threshold_ms);
        }

        if self.router_name.is_empty() {
            bail!("router name must not be empty");
        }

        if self.log_path.as_os_str().is_empty() {
            bail!("log path must not be empty");
        }

        Ok(())
    }
}

/// Name of the account the process runs as, `unknown` if the uid has no
/// passwd entry.
pub fn current_user() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map_or_else(|| "unknown".to_string(), |user| user.name)
}

/// Generated router name: `router_<user>_<unix_ts>`.
fn default_router_name(user: &str) -> String {
    format!("router_{user}_{}", Utc::now().timestamp())
}
