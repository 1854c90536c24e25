//! Runtime configuration
//!
//! Everything is environment-driven. Each knob has the default named in
//! the deployment docs; unparseable values fall back to the default with
//! a warning rather than aborting startup.

use std::time::Duration;

/// Log-file rotation cadence. Unrecognized values fall back to daily,
/// the audit-friendly default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl LogRotation {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => LogRotation::Hourly,
            "never" => LogRotation::Never,
            _ => LogRotation::Daily,
        }
    }
}

/// Logging configuration block
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: String,
    pub log_file: String,
    pub log_level: String,
    pub rotation: LogRotation,
    pub use_json: bool,
}

/// Catalog refresh schedule, parsed from `CATALOG_REFRESH="hourly:15"`.
///
/// The minute offset is deliberate: refreshing at :15 avoids the
/// top-of-hour burst every other consumer of the exchange API produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogRefresh {
    pub minute_offset: u32,
}

impl CatalogRefresh {
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("hourly:")?;
        let minute_offset: u32 = rest.parse().ok()?;
        if minute_offset >= 60 {
            return None;
        }
        Some(Self { minute_offset })
    }
}

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_url: String,
    pub bind_addr: String,

    /// Wall-clock budget for one webhook request.
    pub http_deadline: Duration,
    /// Queue scheduler tick.
    pub queue_rebalance: Duration,
    /// REST open-order polling cycle (also drives the orphan sweep).
    pub open_order_poll: Duration,
    /// Price cache refresh cycle.
    pub price_refresh: Duration,
    /// Position mark / unrealized PnL refresh cycle.
    pub pnl_refresh: Duration,
    pub catalog_refresh: CatalogRefresh,

    /// Per-subscriber SSE queue bound.
    pub sse_max_queue: usize,
    /// Per-key retained event history (not replayed on connect).
    pub sse_history: usize,
    pub sse_heartbeat: Duration,

    /// Fraction of each side's exchange slots STOP orders may occupy.
    pub stop_allocation_ratio: f64,
    pub max_batch_orders: usize,
    /// Manual retry cap for failed orders.
    pub max_retry: u32,
    /// Token buckets are sized to the documented ceiling times this factor.
    pub rate_limit_safety: f64,

    pub log: LogConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, %raw, %default, "Unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let catalog_refresh = CatalogRefresh::parse(&env_string("CATALOG_REFRESH", "hourly:15"))
            .unwrap_or(CatalogRefresh { minute_offset: 15 });

        Self {
            db_url: env_string("DB_URL", ""),
            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8080"),
            http_deadline: Duration::from_millis(env_or("HTTP_DEADLINE_MS", 10_000u64)),
            queue_rebalance: Duration::from_millis(env_or("QUEUE_REBALANCE_MS", 1_000u64)),
            open_order_poll: Duration::from_secs(env_or("OPEN_ORDER_POLL_S", 29u64)),
            price_refresh: Duration::from_secs(env_or("PRICE_REFRESH_S", 31u64)),
            pnl_refresh: Duration::from_secs(env_or("PNL_REFRESH_S", 307u64)),
            catalog_refresh,
            sse_max_queue: env_or("SSE_MAX_QUEUE", 50usize),
            sse_history: env_or("SSE_HISTORY", 100usize),
            sse_heartbeat: Duration::from_secs(env_or("SSE_HEARTBEAT_S", 10u64)),
            stop_allocation_ratio: env_or("STOP_ALLOCATION_RATIO", 0.25f64),
            max_batch_orders: env_or("MAX_BATCH_ORDERS", 30usize),
            max_retry: env_or("MAX_RETRY", 5u32),
            rate_limit_safety: env_or("RATE_LIMIT_SAFETY", 0.55f64),
            log: LogConfig {
                log_dir: env_string("LOG_DIR", "logs"),
                log_file: env_string("LOG_FILE", "signal-relay.log"),
                log_level: env_string("LOG_LEVEL", "info"),
                rotation: LogRotation::parse(&env_string("LOG_ROTATION", "daily")),
                use_json: env_or("LOG_JSON", false),
            },
        }
    }

    /// Threshold after which a PENDING or CANCELLING row is considered
    /// abandoned by its original request.
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(120)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // Defaults only; does not read the environment.
        Self {
            db_url: String::new(),
            bind_addr: "0.0.0.0:8080".to_string(),
            http_deadline: Duration::from_millis(10_000),
            queue_rebalance: Duration::from_millis(1_000),
            open_order_poll: Duration::from_secs(29),
            price_refresh: Duration::from_secs(31),
            pnl_refresh: Duration::from_secs(307),
            catalog_refresh: CatalogRefresh { minute_offset: 15 },
            sse_max_queue: 50,
            sse_history: 100,
            sse_heartbeat: Duration::from_secs(10),
            stop_allocation_ratio: 0.25,
            max_batch_orders: 30,
            max_retry: 5,
            rate_limit_safety: 0.55,
            log: LogConfig {
                log_dir: "logs".to_string(),
                log_file: "signal-relay.log".to_string(),
                log_level: "info".to_string(),
                rotation: LogRotation::Daily,
                use_json: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_refresh_parse() {
        assert_eq!(
            CatalogRefresh::parse("hourly:15"),
            Some(CatalogRefresh { minute_offset: 15 })
        );
        assert_eq!(
            CatalogRefresh::parse("hourly:0"),
            Some(CatalogRefresh { minute_offset: 0 })
        );
        assert_eq!(CatalogRefresh::parse("hourly:60"), None);
        assert_eq!(CatalogRefresh::parse("daily:15"), None);
        assert_eq!(CatalogRefresh::parse("hourly:"), None);
    }

    #[test]
    fn test_log_rotation_parse() {
        assert_eq!(LogRotation::parse("hourly"), LogRotation::Hourly);
        assert_eq!(LogRotation::parse("NEVER"), LogRotation::Never);
        assert_eq!(LogRotation::parse("daily"), LogRotation::Daily);
        // Unknown cadences keep the audit default.
        assert_eq!(LogRotation::parse("weekly"), LogRotation::Daily);
        assert_eq!(LogRotation::parse(""), LogRotation::Daily);
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.http_deadline, Duration::from_millis(10_000));
        assert_eq!(cfg.open_order_poll, Duration::from_secs(29));
        assert_eq!(cfg.pnl_refresh, Duration::from_secs(307));
        assert_eq!(cfg.sse_max_queue, 50);
        assert_eq!(cfg.max_batch_orders, 30);
        assert!((cfg.rate_limit_safety - 0.55).abs() < f64::EPSILON);
    }
}
