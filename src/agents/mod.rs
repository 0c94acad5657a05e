//!
//! dam storage agents
//! ------------------
//! One `StorageAgent` per configured endpoint. An agent lists its backend into a
//! `ResourceTree`, expands resource patterns against that tree and mints backend-native,
//! time-limited credentials: SigV4 presigned URLs for object stores, CA-signed certificates
//! for posix filesystems.
//!
//! Agents are built by `connect`, keyed on the endpoint flavor. The tree snapshot is held
//! behind an `Arc` swap so readers never observe a half-built tree while `load_tree` runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AccessError, AccessResult};
use crate::policy::Action;
use crate::tree::{ResourceNode, ResourceTree};

pub mod certificate;
pub mod posix;
pub mod presign;
pub mod s3;

pub use posix::{PosixAgent, PosixConfig};
pub use s3::{BucketClient, HttpBucketClient, S3Agent, S3Config};

/// Transient result of a credential issuance. `urls[i]` grants access to `resource_paths[i]`
/// until `expires_at`; the backend enforces the expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCredential {
    pub urls: Vec<String>,
    pub resource_paths: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Current tree snapshot of an agent, replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct SharedTree {
    current: RwLock<Arc<ResourceTree>>,
}

impl SharedTree {
    pub fn new(tree: ResourceTree) -> Self { Self { current: RwLock::new(Arc::new(tree)) } }

    pub fn get(&self) -> Arc<ResourceTree> { self.current.read().clone() }

    pub fn replace(&self, tree: ResourceTree) -> Arc<ResourceTree> {
        let fresh = Arc::new(tree);
        *self.current.write() = fresh.clone();
        fresh
    }
}

/// Compile a resource pattern so it must match a whole node id.
pub fn full_match(pattern: &str) -> AccessResult<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| AccessError::InvalidPattern { pattern: pattern.to_string(), reason: e.to_string() })
}

pub trait StorageAgent: Send + Sync {
    fn flavor(&self) -> &'static str;

    /// Snapshot of the most recently loaded tree.
    fn tree(&self) -> Arc<ResourceTree>;

    /// List the backend and replace the cached tree. On failure the previous tree stays.
    fn load_tree(&self) -> AccessResult<Arc<ResourceTree>>;

    /// Mint one credential for a single concrete resource path.
    fn sign(&self, path: &str, action: Action, ttl: Duration) -> AccessResult<String>;

    /// Agent configuration for persistence; secrets only when asked for.
    fn config(&self, include_secrets: bool) -> serde_json::Map<String, serde_json::Value>;

    /// Rebuild the backend connection from the captured configuration.
    fn refresh_connection(&self) -> AccessResult<()>;

    /// Release held connections. Idempotent. A closed agent refuses to list or sign until
    /// `refresh_connection` succeeds.
    fn close(&self);

    /// Whether a node matched by a read pattern gets a credential of its own.
    fn readable(&self, node: &ResourceNode) -> bool { !node.is_root() }

    /// Ids of every non-root node fully matching `pattern` (all of them for `None`), in
    /// tree insertion order.
    fn list_matching(&self, pattern: Option<&str>) -> AccessResult<Vec<String>> {
        let tree = self.tree();
        match pattern {
            None => Ok(tree.ids().map(str::to_string).collect()),
            Some(p) => {
                let re = full_match(p)?;
                Ok(tree.ids().filter(|id| re.is_match(id)).map(str::to_string).collect())
            }
        }
    }

    /// Write issues exactly one credential for the literal `resource`; read treats
    /// `resource` as a pattern and issues one credential per readable match, in
    /// `list_matching` order.
    fn issue_access(&self, resource: &str, action: Action, ttl: Duration) -> AccessResult<AccessCredential> {
        let paths = match action {
            Action::Write => vec![resource.to_string()],
            Action::Read => {
                let mut matched = self.list_matching(Some(resource))?;
                let tree = self.tree();
                matched.retain(|id| tree.get(id).map_or(false, |node| self.readable(node)));
                if matched.is_empty() {
                    return Err(AccessError::NoMatch(resource.to_string()));
                }
                matched
            }
            other => return Err(AccessError::UnsupportedAction(other.to_string())),
        };
        let lifetime = chrono::Duration::from_std(ttl)
            .map_err(|_| AccessError::InvalidConfig(format!("ttl out of range: {:?}", ttl)))?;
        let expires_at = Utc::now() + lifetime;
        let urls = paths.iter().map(|p| self.sign(p, action, ttl)).collect::<AccessResult<Vec<_>>>()?;
        info!(
            target: "dam::agents",
            "issued {} {} credential(s) for '{}' via {} ttl_secs={}",
            urls.len(), action, resource, self.flavor(), ttl.as_secs()
        );
        Ok(AccessCredential { urls, resource_paths: paths, expires_at })
    }
}

pub fn available_flavors() -> &'static [&'static str] { &[s3::FLAVOR, posix::FLAVOR] }

/// Construct the agent for `flavor` from its persisted configuration.
pub fn connect(flavor: &str, config: serde_json::Value) -> AccessResult<Arc<dyn StorageAgent>> {
    let bad = |e: serde_json::Error| AccessError::InvalidConfig(format!("{} agent: {}", flavor, e));
    match flavor {
        s3::FLAVOR => Ok(Arc::new(S3Agent::connect(serde_json::from_value(config).map_err(bad)?)?)),
        posix::FLAVOR => Ok(Arc::new(PosixAgent::open(serde_json::from_value(config).map_err(bad)?)?)),
        other => Err(AccessError::UnsupportedFlavor(other.to_string())),
    }
}
