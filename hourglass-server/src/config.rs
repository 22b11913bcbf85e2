use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    /// Base URL of the report sidecar that performs the actual report
    /// creation/poll/download cycle.
    pub report_api_url: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Namespaces the steady-state sync loop keeps current. Empty disables
    /// the loop; repair can still be triggered per namespace over HTTP.
    pub sync_namespaces: Vec<String>,
    pub sync_interval_seconds: u64,
    pub sync_lookback_hours: i64,
    pub lock_ttl_seconds: i64,
    pub failure_cooldown_minutes: i64,
    pub quota_cooldown_minutes: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let report_api_url = env::var("REPORT_API_URL")
            .context("REPORT_API_URL environment variable is required")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let sync_namespaces = parse_namespaces(env::var("SYNC_NAMESPACES").ok());

        let sync_interval_seconds = env::var("SYNC_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .context("SYNC_INTERVAL_SECONDS must be a valid number")?;

        let sync_lookback_hours = env::var("SYNC_LOOKBACK_HOURS")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<i64>()
            .context("SYNC_LOOKBACK_HOURS must be a valid number")?;

        let lock_ttl_seconds = env::var("LOCK_TTL_SECONDS")
            .unwrap_or_else(|_| "900".to_string())
            .parse::<i64>()
            .context("LOCK_TTL_SECONDS must be a valid number")?;

        let failure_cooldown_minutes = env::var("FAILURE_COOLDOWN_MINUTES")
            .unwrap_or_else(|_| "15".to_string())
            .parse::<i64>()
            .context("FAILURE_COOLDOWN_MINUTES must be a valid number")?;

        let quota_cooldown_minutes = env::var("QUOTA_COOLDOWN_MINUTES")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<i64>()
            .context("QUOTA_COOLDOWN_MINUTES must be a valid number")?;

        Ok(Config {
            report_api_url,
            port,
            state_dir,
            sync_namespaces,
            sync_interval_seconds,
            sync_lookback_hours,
            lock_ttl_seconds,
            failure_cooldown_minutes,
            quota_cooldown_minutes,
        })
    }
}

/// Parse a comma-separated namespace list.
///
/// Whitespace-only items are dropped so a trailing comma or an entirely
/// empty variable cleanly disables the sync loop rather than producing a
/// phantom "" namespace.
pub fn parse_namespaces(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
