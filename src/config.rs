//! Environment configuration.
//!
//! Everything comes from environment variables (a `.env` file is honored in
//! development). Each component degrades gracefully when its configuration
//! is absent: no worker list disables dispatch and everything that needs it,
//! no catalog URL disables the orphan-branch phase, no API key disables
//! bearer auth.

use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Required.
    pub database_url: String,
    /// HTTP bind address.
    pub http_addr: SocketAddr,
    /// Worker base URLs, comma-separated in `SMELTER_WORKERS`.
    pub workers: Vec<String>,
    /// Bearer token for the API; `None` disables auth.
    pub api_key: Option<String>,
    /// Shared secret for the worker callback ingress; `None` disables the
    /// check.
    pub callback_secret: Option<String>,
    /// Connection pool bound.
    pub db_max_connections: u32,
    /// Per-IP request rate (requests/second); `None` disables limiting.
    pub rate_limit_rps: Option<u32>,
    /// Cap on live log stream duration.
    pub log_stream_max_secs: u64,
    /// Metadata catalog base URL; `None` disables the orphan-branch phase.
    pub catalog_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL is required".to_string())?;

        let http_addr = match std::env::var("SMELTER_HTTP_ADDR") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| format!("invalid SMELTER_HTTP_ADDR {raw:?}: {e}"))?,
            Err(_) => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let workers = std::env::var("SMELTER_WORKERS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let db_max_connections = match std::env::var("SMELTER_DB_MAX_CONNECTIONS") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| format!("invalid SMELTER_DB_MAX_CONNECTIONS {raw:?}: {e}"))?,
            Err(_) => smelter_postgres::DEFAULT_MAX_CONNECTIONS,
        };

        let rate_limit_rps = match std::env::var("SMELTER_RATE_LIMIT_RPS") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|e| format!("invalid SMELTER_RATE_LIMIT_RPS {raw:?}: {e}"))?,
            ),
            Err(_) => None,
        };

        let log_stream_max_secs = match std::env::var("SMELTER_LOG_STREAM_MAX_SECS") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| format!("invalid SMELTER_LOG_STREAM_MAX_SECS {raw:?}: {e}"))?,
            Err(_) => 300,
        };

        Ok(Self {
            database_url,
            http_addr,
            workers,
            api_key: non_empty_env("SMELTER_API_KEY"),
            callback_secret: non_empty_env("SMELTER_CALLBACK_SECRET"),
            db_max_connections,
            rate_limit_rps,
            log_stream_max_secs,
            catalog_url: non_empty_env("SMELTER_CATALOG_URL"),
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_list_splits_and_trims() {
        let workers: Vec<String> = "http://a:7070, http://b:7070 ,,"
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        assert_eq!(workers, vec!["http://a:7070", "http://b:7070"]);
    }
}
