use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Centralized helpers for the files the access manager persists.
/// This keeps on-disk naming consistent across the policy store, the endpoint
/// registry and the subject registry.
pub const POLICY_EXT: &str = "policies";
pub const ENDPOINT_EXT: &str = "json";

// ---- Policy store (one record file per subject) ----
#[inline]
pub fn policy_file(dir: &Path, subject: &Uuid) -> PathBuf { dir.join(format!("{}.{}", subject, POLICY_EXT)) }

#[inline]
pub fn policy_tmp_file(dir: &Path, subject: &Uuid) -> PathBuf { dir.join(format!("{}.{}.tmp", subject, POLICY_EXT)) }

// ---- Endpoint registry (one config file per endpoint) ----
#[inline]
pub fn endpoint_config_file(dir: &Path, endpoint: &Uuid) -> PathBuf { dir.join(format!("{}.{}", endpoint, ENDPOINT_EXT)) }

/// `<file>.tmp` next to `path`, for single-file stores such as the subject registry.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Parse a `<uuid>.<ext>` file name back into its uuid. Files with another extension or a
/// stem that is not a uuid are ignored by callers.
pub fn uuid_from_file(path: &Path, ext: &str) -> Option<Uuid> {
    if path.extension().and_then(|e| e.to_str()) != Some(ext) { return None; }
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok()
}

/// Write `bytes` to `path` through a sibling temp file and rename, so readers see either the
/// previous contents or the new ones.
pub fn write_atomic(path: &Path, tmp: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() { std::fs::create_dir_all(dir)?; }
    std::fs::write(tmp, bytes)?;
    std::fs::rename(tmp, path)
}
