//! Process configuration resolved from the environment.
//!
//! Every path defaults beneath `DAM_DATA_ROOT` so a fresh checkout runs with no setup;
//! deployments point the individual variables at mounted volumes instead.

use std::path::PathBuf;
use std::time::Duration;

use crate::policy::Action;

pub const DEFAULT_READ_TTL_SECS: u64 = 600;
pub const DEFAULT_WRITE_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: PathBuf,
    /// Directory of `<subject_uuid>.policies` files.
    pub user_policies: PathBuf,
    /// Directory of `<endpoint_uuid>.json` files.
    pub endpoint_configs: PathBuf,
    /// Subject registry JSON map.
    pub uuid_store: PathBuf,
    pub read_ttl: Duration,
    pub write_ttl: Duration,
}

fn parse_secs_env(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok())
}

impl Settings {
    pub fn from_env() -> Self {
        let data_root = PathBuf::from(std::env::var("DAM_DATA_ROOT").unwrap_or_else(|_| "dam-data".to_string()));
        let path_or = |name: &str, default: PathBuf| std::env::var(name).map(PathBuf::from).unwrap_or(default);
        Self {
            user_policies: path_or("USER_POLICIES", data_root.join("policies")),
            endpoint_configs: path_or("ENDPOINT_CONFIGS", data_root.join("endpoints")),
            uuid_store: path_or("UUID_STORE", data_root.join("users.json")),
            read_ttl: Duration::from_secs(parse_secs_env("DAM_READ_TTL_SECS").unwrap_or(DEFAULT_READ_TTL_SECS)),
            write_ttl: Duration::from_secs(parse_secs_env("DAM_WRITE_TTL_SECS").unwrap_or(DEFAULT_WRITE_TTL_SECS)),
            data_root,
        }
    }

    /// Settings rooted at an explicit folder with default TTLs; used by tests and tools.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let data_root = root.into();
        Self {
            user_policies: data_root.join("policies"),
            endpoint_configs: data_root.join("endpoints"),
            uuid_store: data_root.join("users.json"),
            read_ttl: Duration::from_secs(DEFAULT_READ_TTL_SECS),
            write_ttl: Duration::from_secs(DEFAULT_WRITE_TTL_SECS),
            data_root,
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.user_policies)?;
        std::fs::create_dir_all(&self.endpoint_configs)?;
        if let Some(dir) = self.uuid_store.parent() { std::fs::create_dir_all(dir)?; }
        Ok(())
    }

    /// Default credential lifetime for an action; only read and write are ever issued.
    pub fn ttl_for(&self, action: Action) -> Duration {
        match action {
            Action::Write => self.write_ttl,
            _ => self.read_ttl,
        }
    }
}
