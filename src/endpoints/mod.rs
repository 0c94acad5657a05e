//!
//! dam endpoint registry
//! ---------------------
//! The configured access points. Each endpoint owns one storage agent and is persisted as
//! `<endpoint_uuid>.json` holding `{uuid, name, flavor, agent}`, where `agent` is the
//! flavor-specific configuration including secrets.
//!
//! Creating an endpoint grants its creator `("*", admin)` on it; removing one closes the
//! agent, deletes the file and purges every policy that references it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::{self, StorageAgent};
use crate::error::{AccessError, AccessResult};
use crate::policy::{Action, Policy, PolicyStore, WILDCARD_RESOURCE};
use crate::system_paths::{endpoint_config_file, tmp_sibling, uuid_from_file, write_atomic, ENDPOINT_EXT};

pub struct Endpoint {
    pub uuid: Uuid,
    pub name: String,
    pub flavor: String,
    agent: Arc<dyn StorageAgent>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

/// On-disk form of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub uuid: Uuid,
    pub name: String,
    pub flavor: String,
    pub agent: serde_json::Map<String, serde_json::Value>,
}

impl Endpoint {
    pub fn new(uuid: Uuid, name: impl Into<String>, agent: Arc<dyn StorageAgent>) -> Self {
        Self { uuid, name: name.into(), flavor: agent.flavor().to_string(), agent }
    }

    /// Build a fresh endpoint (new uuid) by connecting an agent of `flavor`.
    pub fn connect(name: &str, flavor: &str, config: serde_json::Value) -> AccessResult<Self> {
        let agent = agents::connect(flavor, config)?;
        Ok(Self::new(Uuid::new_v4(), name, agent))
    }

    pub fn agent(&self) -> &Arc<dyn StorageAgent> { &self.agent }

    pub fn record(&self, include_secrets: bool) -> EndpointRecord {
        EndpointRecord {
            uuid: self.uuid,
            name: self.name.clone(),
            flavor: self.flavor.clone(),
            agent: self.agent.config(include_secrets),
        }
    }

    fn from_record(record: EndpointRecord) -> AccessResult<Self> {
        let agent = agents::connect(&record.flavor, serde_json::Value::Object(record.agent))?;
        Ok(Self { uuid: record.uuid, name: record.name, flavor: record.flavor, agent })
    }
}

pub struct EndpointRegistry {
    dir: PathBuf,
    policies: Arc<PolicyStore>,
    endpoints: RwLock<Vec<Arc<Endpoint>>>,
}

impl EndpointRegistry {
    /// Empty registry persisting into `dir`.
    pub fn new<P: AsRef<Path>>(dir: P, policies: Arc<PolicyStore>) -> AccessResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, policies, endpoints: RwLock::new(Vec::new()) })
    }

    /// Registry holding every endpoint configured in `dir`. Entries that cannot be read or
    /// whose agent fails to connect are logged and left out.
    pub fn load<P: AsRef<Path>>(dir: P, policies: Arc<PolicyStore>) -> AccessResult<Self> {
        let registry = Self::new(dir, policies)?;
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&registry.dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| uuid_from_file(p, ENDPOINT_EXT).is_some())
            .collect();
        paths.sort();
        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::read_endpoint(&path) {
                Ok(ep) => {
                    debug!(target: "dam::endpoints", "loaded endpoint '{}' ({}) from {}", ep.name, ep.uuid, path.display());
                    loaded.push(Arc::new(ep));
                }
                Err(e) => warn!(target: "dam::endpoints", "skipping endpoint config {}: {}", path.display(), e),
            }
        }
        info!(target: "dam::endpoints", "endpoint registry loaded {} endpoints from {}", loaded.len(), registry.dir.display());
        *registry.endpoints.write() = loaded;
        Ok(registry)
    }

    fn read_endpoint(path: &Path) -> AccessResult<Endpoint> {
        let record: EndpointRecord = serde_json::from_slice(&std::fs::read(path)?)?;
        if uuid_from_file(path, ENDPOINT_EXT) != Some(record.uuid) {
            return Err(AccessError::InvalidConfig(format!("file name does not match endpoint uuid {}", record.uuid)));
        }
        Endpoint::from_record(record)
    }

    pub fn dir(&self) -> &Path { &self.dir }

    pub fn policies(&self) -> &Arc<PolicyStore> { &self.policies }

    pub fn list(&self) -> Vec<Arc<Endpoint>> { self.endpoints.read().clone() }

    pub fn get(&self, uuid: &Uuid) -> AccessResult<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .find(|e| &e.uuid == uuid)
            .cloned()
            .ok_or_else(|| AccessError::not_found("endpoint", uuid))
    }

    pub fn get_by_name(&self, name: &str) -> AccessResult<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| AccessError::not_found("endpoint", name))
    }

    /// Endpoints whose name is in `names`, in registry order. Unknown names are ignored.
    pub fn by_names<S: AsRef<str>>(&self, names: &[S]) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .read()
            .iter()
            .filter(|e| names.iter().any(|n| n.as_ref() == e.name))
            .cloned()
            .collect()
    }

    fn write_config(&self, endpoint: &Endpoint) -> AccessResult<()> {
        let path = endpoint_config_file(&self.dir, &endpoint.uuid);
        let bytes = serde_json::to_vec_pretty(&endpoint.record(true))?;
        write_atomic(&path, &tmp_sibling(&path), &bytes)?;
        Ok(())
    }

    /// Register `endpoint`, persist it and grant `creator` full control over it. Nothing is
    /// kept if any step fails.
    pub fn add(&self, endpoint: Endpoint, creator: &Uuid) -> AccessResult<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.write();
        if endpoints.iter().any(|e| e.uuid == endpoint.uuid) {
            return Err(AccessError::already_exists("endpoint", endpoint.uuid));
        }
        if endpoints.iter().any(|e| e.name == endpoint.name) {
            return Err(AccessError::already_exists("endpoint", &endpoint.name));
        }
        self.write_config(&endpoint)?;
        let bootstrap = Policy::new(*creator, endpoint.uuid, WILDCARD_RESOURCE, Action::Admin);
        if let Err(e) = self.policies.add(bootstrap) {
            warn!(target: "dam::endpoints", "bootstrap grant for endpoint {} failed, rolling back: {}", endpoint.uuid, e);
            if let Err(undo) = std::fs::remove_file(endpoint_config_file(&self.dir, &endpoint.uuid)) {
                error!(target: "dam::endpoints", "could not roll back config of endpoint {}: {}", endpoint.uuid, undo);
            }
            return Err(e);
        }
        let endpoint = Arc::new(endpoint);
        endpoints.push(endpoint.clone());
        info!(
            target: "dam::endpoints",
            "added {} endpoint '{}' ({}) created by {}",
            endpoint.flavor, endpoint.name, endpoint.uuid, creator
        );
        Ok(endpoint)
    }

    /// Unregister an endpoint: delete its configuration, purge its policies, then drop and
    /// close it. The endpoint stays registered if either step fails.
    pub fn remove(&self, uuid: &Uuid) -> AccessResult<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.write();
        let pos = endpoints
            .iter()
            .position(|e| &e.uuid == uuid)
            .ok_or_else(|| AccessError::not_found("endpoint", uuid))?;
        match std::fs::remove_file(endpoint_config_file(&self.dir, uuid)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let purged = match self.policies.purge_endpoint(uuid) {
            Ok(n) => n,
            Err(e) => {
                warn!(target: "dam::endpoints", "purging policies of endpoint {} failed, restoring its config: {}", uuid, e);
                if let Err(undo) = self.write_config(&endpoints[pos]) {
                    error!(target: "dam::endpoints", "could not restore config of endpoint {}: {}", uuid, undo);
                }
                return Err(e);
            }
        };
        let endpoint = endpoints.remove(pos);
        drop(endpoints);
        endpoint.agent.close();
        info!(target: "dam::endpoints", "removed endpoint '{}' ({}), purged {} policies", endpoint.name, uuid, purged);
        Ok(endpoint)
    }

    /// Rewrite the configuration file of every registered endpoint.
    pub fn save(&self) -> AccessResult<()> {
        let endpoints = self.endpoints.read();
        for endpoint in endpoints.iter() {
            self.write_config(endpoint)?;
        }
        debug!(target: "dam::endpoints", "saved {} endpoint configs", endpoints.len());
        Ok(())
    }

    /// Close every agent. Endpoints stay registered.
    pub fn close_all(&self) {
        for endpoint in self.endpoints.read().iter() {
            endpoint.agent.close();
        }
    }
}
