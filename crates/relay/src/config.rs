// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The PostgreSQL pool reads its own sizing variables in
// `db::pool`.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

use crate::sync::merge::MergePolicy;

const DEV_JWT_SECRET: &str = "tandem_local_development_jwt_secret_must_be_32_chars";

pub const DEFAULT_UPDATE_LOG_LIMIT: usize = 100;
pub const DEFAULT_FLUSH_EVERY_UPDATES: u64 = 10;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_IDLE_AFTER_SECS: u64 = 5 * 60;
pub const DEFAULT_EXPIRE_AFTER_SECS: u64 = 30 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to verify identity tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. `None` keeps durable state in memory.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `tandem_relay=debug`).
    pub log_filter: String,
    /// Number of update records retained per workspace.
    pub update_log_limit: usize,
    /// Flush after this many applied updates (0 disables the count trigger).
    pub flush_every_updates: u64,
    /// Flush when this much time passed since the last flush (0 disables).
    pub flush_interval: Duration,
    /// Active participants without activity for this long become idle.
    pub idle_after: Duration,
    /// Participants without activity for this long are removed.
    pub expire_after: Duration,
    /// Cadence of the presence sweeper.
    pub sweep_interval: Duration,
    pub merge_policy: MergePolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_RELAY_HOST` | `0.0.0.0` |
    /// | `TANDEM_RELAY_PORT` | `8080` |
    /// | `TANDEM_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `TANDEM_RELAY_DATABASE_URL` | *(none, in-memory durability)* |
    /// | `TANDEM_RELAY_CORS_ORIGINS` | *(none, permissive in dev)* |
    /// | `TANDEM_RELAY_LOG_FILTER` | `info` |
    /// | `TANDEM_RELAY_UPDATE_LOG_LIMIT` | `100` |
    /// | `TANDEM_RELAY_FLUSH_EVERY_UPDATES` | `10` |
    /// | `TANDEM_RELAY_FLUSH_INTERVAL_SECS` | `30` |
    /// | `TANDEM_RELAY_IDLE_AFTER_SECS` | `300` |
    /// | `TANDEM_RELAY_EXPIRE_AFTER_SECS` | `1800` |
    /// | `TANDEM_RELAY_SWEEP_INTERVAL_SECS` | `60` |
    /// | `TANDEM_RELAY_MERGE_POLICY` | `lww` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("TANDEM_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "TANDEM_RELAY_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("TANDEM_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("TANDEM_RELAY_DATABASE_URL").ok().filter(|url| !url.is_empty());
        let cors_origins = env("TANDEM_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("TANDEM_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let merge_policy = match env("TANDEM_RELAY_MERGE_POLICY") {
            Ok(raw) => MergePolicy::parse(&raw).unwrap_or_else(|| {
                warn!(merge_policy = %raw, "unknown merge policy, falling back to lww");
                MergePolicy::LastWriterWins
            }),
            Err(_) => MergePolicy::LastWriterWins,
        };

        Self {
            listen_addr,
            jwt_secret,
            database_url,
            cors_origins,
            log_filter,
            update_log_limit: parse_or(&env, "TANDEM_RELAY_UPDATE_LOG_LIMIT", DEFAULT_UPDATE_LOG_LIMIT)
                .max(1),
            flush_every_updates: parse_or(
                &env,
                "TANDEM_RELAY_FLUSH_EVERY_UPDATES",
                DEFAULT_FLUSH_EVERY_UPDATES,
            ),
            flush_interval: Duration::from_secs(parse_or(
                &env,
                "TANDEM_RELAY_FLUSH_INTERVAL_SECS",
                DEFAULT_FLUSH_INTERVAL_SECS,
            )),
            idle_after: Duration::from_secs(parse_or(
                &env,
                "TANDEM_RELAY_IDLE_AFTER_SECS",
                DEFAULT_IDLE_AFTER_SECS,
            )),
            expire_after: Duration::from_secs(parse_or(
                &env,
                "TANDEM_RELAY_EXPIRE_AFTER_SECS",
                DEFAULT_EXPIRE_AFTER_SECS,
            )),
            sweep_interval: Duration::from_secs(
                parse_or(&env, "TANDEM_RELAY_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)
                    .max(1),
            ),
            merge_policy,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}
