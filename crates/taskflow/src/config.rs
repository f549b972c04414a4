use std::path::PathBuf;

use crate::tasks::backend::DEFAULT_MAX_PAYLOAD_BYTES;

// Config is the one place runtime settings are read.
// Every value has a TASKFLOW_* name and an unprefixed fallback.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub queue: String,
    pub lease_seconds: i64,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub max_payload_bytes: usize,
    /// Registers the synthetic task types (`echo`, `always-fails`,
    /// `report-progress`). Never on in production.
    pub diagnostic_tasks: bool,
    pub exports_dir: PathBuf,
    pub max_concurrency: usize,
    pub reap_interval_ms: u64,
    pub db: DbSettings,
}

/// Pool sizing follows the worker: one connection per in-flight job plus
/// room for the lease loop and the admin API.
#[derive(Clone, Debug, PartialEq)]
pub struct DbSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub disable_jit: bool,
    /// Shows up in `pg_stat_activity` so a stuck lease can be traced to
    /// its worker.
    pub application_name: String,
}

const POOL_HEADROOM: u32 = 2;

impl DbSettings {
    fn from_env(worker_id: &str, max_concurrency: usize) -> Self {
        let wanted = u32::try_from(max_concurrency)
            .unwrap_or(u32::MAX)
            .saturating_add(POOL_HEADROOM);
        let max_connections = std::env::var("TASKFLOW_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(wanted)
            .clamp(1, 64);

        let acquire_timeout_secs = std::env::var("TASKFLOW_DB_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(10)
            .clamp(1, 60);

        Self {
            max_connections,
            acquire_timeout_secs,
            disable_jit: env_bool("TASKFLOW_DISABLE_JIT").unwrap_or(true),
            application_name: format!("taskflow:{worker_id}"),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        Ok(Self::with_database_url(database_url))
    }

    /// Everything but the database URL from the environment, for callers
    /// that resolved the URL themselves.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        dotenvy::dotenv().ok();
        let database_url = database_url.into();

        let worker_id = env_or_fallback("TASKFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let queue =
            env_or_fallback("TASKFLOW_QUEUE", "QUEUE").unwrap_or_else(|| "default".to_string());

        let lease_seconds = env_or_fallback("TASKFLOW_LEASE_SECONDS", "LEASE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        let admin_addr = env_or_fallback("TASKFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("TASKFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let max_payload_bytes =
            env_or_fallback("TASKFLOW_MAX_PAYLOAD_BYTES", "MAX_PAYLOAD_BYTES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);

        let diagnostic_tasks = env_bool("TASKFLOW_DIAGNOSTIC_TASKS")
            .or_else(|| env_bool("RUNNING_TESTS"))
            .unwrap_or(false);

        let exports_dir = std::env::var("TASKFLOW_EXPORTS_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./exports"));

        let max_concurrency = std::env::var("TASKFLOW_MAX_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4)
            .max(1);

        let reap_interval_ms = std::env::var("TASKFLOW_REAP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let db = DbSettings::from_env(&worker_id, max_concurrency);

        Self {
            database_url,
            worker_id,
            queue,
            lease_seconds,
            admin_addr,
            migrate_on_startup,
            max_payload_bytes,
            diagnostic_tasks,
            exports_dir,
            max_concurrency,
            reap_interval_ms,
            db,
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| parse_bool(&v))
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_addr_can_be_switched_off() {
        assert_eq!(normalize_optional_addr(" 0 "), None);
        assert_eq!(normalize_optional_addr("OFF"), None);
        assert_eq!(normalize_optional_addr(""), None);
        assert_eq!(
            normalize_optional_addr("127.0.0.1:3000").as_deref(),
            Some("127.0.0.1:3000")
        );
    }

    #[test]
    fn explicit_url_needs_no_database_url_variable() {
        let cfg = Config::with_database_url("postgres://localhost/taskflow_test");
        assert_eq!(cfg.database_url, "postgres://localhost/taskflow_test");
        assert!(cfg.db.application_name.ends_with(&cfg.worker_id));
    }

    #[test]
    fn pool_leaves_room_beyond_the_job_slots() {
        let db = DbSettings::from_env("w1", 6);
        if std::env::var("TASKFLOW_DB_MAX_CONNECTIONS").is_err() {
            assert_eq!(db.max_connections, 8);
        }
        assert_eq!(db.application_name, "taskflow:w1");
    }

    #[test]
    fn booleans_accept_the_usual_spellings() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "nope", ""] {
            assert!(!parse_bool(v), "{v}");
        }
    }
}
