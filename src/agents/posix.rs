//! Posix filesystem agent.
//!
//! Walks a local directory into a tree of relative file paths and issues links of the form
//! `{endpoint_url}?cert={urlsafe base64 certificate}` for the file-serving front end that
//! trusts the endpoint CA.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{certificate, SharedTree, StorageAgent};
use crate::error::{AccessError, AccessResult};
use crate::policy::Action;
use crate::tree::ResourceTree;

pub const FLAVOR: &str = "posix";
pub const SEPARATOR: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosixConfig {
    /// Directory whose files make up the tree.
    pub root: PathBuf,
    /// Base URL of the service that serves files under `root`.
    pub endpoint_url: String,
    /// PKCS#8 PEM ed25519 key used to sign per-request certificates.
    pub ssh_ca_key: PathBuf,
}

pub struct PosixAgent {
    config: PosixConfig,
    tree: SharedTree,
    closed: AtomicBool,
}

impl PosixAgent {
    /// Check the CA key and walk `root`.
    pub fn open(config: PosixConfig) -> AccessResult<Self> {
        certificate::load_ca_key(&config.ssh_ca_key)?;
        let agent = Self { config, tree: SharedTree::new(ResourceTree::new(SEPARATOR)), closed: AtomicBool::new(false) };
        agent.load_tree()?;
        info!(target: "dam::agents", "posix agent opened at {}", agent.config.root.display());
        Ok(agent)
    }

    fn ensure_open(&self) -> AccessResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AccessError::BackendUnavailable(format!(
                "posix agent for {} is closed", self.config.root.display()
            )));
        }
        Ok(())
    }
}

/// Relative, separator-joined paths of every regular file under `root`.
pub fn walk_files(root: &Path) -> AccessResult<Vec<String>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(AccessError::backend)?;
        if !entry.file_type().is_file() { continue; }
        let Ok(rel) = entry.path().strip_prefix(root) else { continue; };
        let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
        out.push(parts.join(SEPARATOR));
    }
    Ok(out)
}

impl StorageAgent for PosixAgent {
    fn flavor(&self) -> &'static str { FLAVOR }

    fn tree(&self) -> Arc<ResourceTree> { self.tree.get() }

    fn load_tree(&self) -> AccessResult<Arc<ResourceTree>> {
        self.ensure_open()?;
        if !self.config.root.is_dir() {
            return Err(AccessError::BackendUnavailable(format!("{} is not a directory", self.config.root.display())));
        }
        let files = walk_files(&self.config.root)?;
        let tree = ResourceTree::build(&files, SEPARATOR);
        debug!(target: "dam::agents", "posix tree for {} has {} nodes", self.config.root.display(), tree.len());
        Ok(self.tree.replace(tree))
    }

    fn sign(&self, path: &str, action: Action, ttl: Duration) -> AccessResult<String> {
        self.ensure_open()?;
        if !matches!(action, Action::Read | Action::Write) {
            return Err(AccessError::UnsupportedAction(action.to_string()));
        }
        let ca = certificate::load_ca_key(&self.config.ssh_ca_key)?;
        let cert = certificate::issue(&ca, path, action, ttl, Utc::now())?;
        Ok(format!("{}?cert={}", self.config.endpoint_url, URL_SAFE.encode(cert.as_bytes())))
    }

    fn config(&self, include_secrets: bool) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("root".into(), self.config.root.to_string_lossy().into_owned().into());
        map.insert("endpoint_url".into(), self.config.endpoint_url.clone().into());
        if include_secrets {
            map.insert("ssh_ca_key".into(), self.config.ssh_ca_key.to_string_lossy().into_owned().into());
        }
        map
    }

    fn refresh_connection(&self) -> AccessResult<()> {
        certificate::load_ca_key(&self.config.ssh_ca_key)?;
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(target: "dam::agents", "posix agent for {} closed", self.config.root.display());
        }
    }
}
