use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::subject::{Role, Subject};
use crate::error::{AccessError, AccessResult};
use crate::system_paths::{tmp_sibling, write_atomic};

pub trait IdentityProvider: Send + Sync {
    /// Register `slug`; fails with `AlreadyExists` when the slug is taken.
    fn create_user(&self, slug: &str, role: Role) -> AccessResult<Subject>;
    /// Forget a user; fails with `NotFound` for unknown uuids.
    fn delete_user(&self, uuid: &Uuid) -> AccessResult<Subject>;
    fn get(&self, slug: &str) -> AccessResult<Subject>;
    /// Every user, ordered by slug.
    fn list(&self) -> Vec<Subject>;

    fn get_by_uuid(&self, uuid: &Uuid) -> AccessResult<Subject> {
        self.list()
            .into_iter()
            .find(|s| &s.uuid == uuid)
            .ok_or_else(|| AccessError::not_found("user", uuid))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    uuid: Uuid,
    #[serde(default)]
    role: Role,
}

/// Subject registry persisted as one JSON map `slug -> {uuid, role}`.
pub struct LocalIdentityProvider {
    path: PathBuf,
    users: RwLock<BTreeMap<String, Entry>>,
}

impl LocalIdentityProvider {
    /// Load the registry at `path`; a missing file is an empty registry.
    pub fn open<P: AsRef<Path>>(path: P) -> AccessResult<Self> {
        let path = path.as_ref().to_path_buf();
        let users = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, users: RwLock::new(users) })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn persist(&self, users: &BTreeMap<String, Entry>) -> AccessResult<()> {
        let bytes = serde_json::to_vec_pretty(users)?;
        write_atomic(&self.path, &tmp_sibling(&self.path), &bytes)?;
        Ok(())
    }
}

fn subject(slug: &str, e: &Entry) -> Subject { Subject { uuid: e.uuid, slug: slug.to_string(), role: e.role } }

impl IdentityProvider for LocalIdentityProvider {
    fn create_user(&self, slug: &str, role: Role) -> AccessResult<Subject> {
        let slug = slug.trim();
        if slug.is_empty() {
            return Err(AccessError::InvalidConfig("user slug must not be empty".into()));
        }
        let mut users = self.users.write();
        if users.contains_key(slug) {
            return Err(AccessError::already_exists("user", slug));
        }
        let entry = Entry { uuid: Uuid::new_v4(), role };
        users.insert(slug.to_string(), entry.clone());
        if let Err(e) = self.persist(&users) {
            users.remove(slug);
            return Err(e);
        }
        info!(target: "dam::manager", "created user '{}' ({}) role={}", slug, entry.uuid, role);
        Ok(subject(slug, &entry))
    }

    fn delete_user(&self, uuid: &Uuid) -> AccessResult<Subject> {
        let mut users = self.users.write();
        let slug = users
            .iter()
            .find(|(_, e)| &e.uuid == uuid)
            .map(|(s, _)| s.clone())
            .ok_or_else(|| AccessError::not_found("user", uuid))?;
        let Some(entry) = users.remove(&slug) else {
            return Err(AccessError::not_found("user", uuid));
        };
        if let Err(e) = self.persist(&users) {
            users.insert(slug, entry);
            return Err(e);
        }
        info!(target: "dam::manager", "deleted user '{}' ({})", slug, uuid);
        Ok(subject(&slug, &entry))
    }

    fn get(&self, slug: &str) -> AccessResult<Subject> {
        self.users
            .read()
            .get(slug)
            .map(|e| subject(slug, e))
            .ok_or_else(|| AccessError::not_found("user", slug))
    }

    fn list(&self) -> Vec<Subject> { self.users.read().iter().map(|(s, e)| subject(s, e)).collect() }
}
