use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Action, Policy, PolicyFilter};
use crate::error::{AccessError, AccessResult};
use crate::system_paths::{policy_file, policy_tmp_file, uuid_from_file, write_atomic, POLICY_EXT};

/// Policies of one subject: insertion order for the record file, plus an
/// endpoint -> action -> resources index so per-node checks stay O(1).
#[derive(Debug, Clone, Default)]
struct SubjectPolicies {
    order: Vec<Policy>,
    grants: HashMap<Uuid, HashMap<Action, HashSet<String>>>,
}

impl SubjectPolicies {
    fn contains(&self, endpoint: &Uuid, resource: &str, action: Action) -> bool {
        self.grants
            .get(endpoint)
            .and_then(|by_action| by_action.get(&action))
            .map_or(false, |resources| resources.contains(resource))
    }

    fn insert(&mut self, p: Policy) -> bool {
        let fresh = self.grants
            .entry(p.endpoint)
            .or_default()
            .entry(p.action)
            .or_default()
            .insert(p.resource.clone());
        if fresh { self.order.push(p); }
        fresh
    }

    /// Drop every policy matching `filter`, returning what was removed.
    fn remove_matching(&mut self, filter: &PolicyFilter) -> Vec<Policy> {
        let (removed, kept): (Vec<Policy>, Vec<Policy>) = self.order.drain(..).partition(|p| filter.matches(p));
        self.order = kept;
        for p in &removed {
            if let Some(by_action) = self.grants.get_mut(&p.endpoint) {
                if let Some(resources) = by_action.get_mut(&p.action) {
                    resources.remove(&p.resource);
                    if resources.is_empty() { by_action.remove(&p.action); }
                }
                if by_action.is_empty() { self.grants.remove(&p.endpoint); }
            }
        }
        removed
    }

    fn to_file_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for p in &self.order {
            out.push_str(&p.to_record());
            out.push('\n');
        }
        out.into_bytes()
    }
}

/// In-memory policy index backed by one record file per subject.
///
/// Reads (`has`, `enforce`, `filter`) only take the shared index lock. Mutations are
/// serialized per subject: the subject's writer lock is held across the in-memory update and
/// the rewrite of its record file, so two writers for the same subject never interleave
/// their read-modify-persist cycles. A failed rewrite restores the previous in-memory state.
pub struct PolicyStore {
    dir: PathBuf,
    subjects: RwLock<HashMap<Uuid, SubjectPolicies>>,
    writers: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PolicyStore {
    /// Open (creating if needed) the policy directory and load every `*.policies` file in it.
    pub fn open<P: AsRef<Path>>(dir: P) -> AccessResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut subjects: HashMap<Uuid, SubjectPolicies> = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(subject) = uuid_from_file(&path, POLICY_EXT) else { continue; };
            let text = std::fs::read_to_string(&path)?;
            let mut policies = SubjectPolicies::default();
            for (lineno, line) in text.lines().enumerate() {
                if line.trim().is_empty() { continue; }
                let p = Policy::parse_record(line).map_err(|e| {
                    AccessError::InvalidConfig(format!("{}:{}: {}", path.display(), lineno + 1, e))
                })?;
                if p.subject != subject {
                    return Err(AccessError::InvalidConfig(format!(
                        "{}:{}: record for subject {} in file of subject {}",
                        path.display(), lineno + 1, p.subject, subject
                    )));
                }
                if !policies.insert(p) {
                    warn!(target: "dam::policy", "duplicate record ignored in {} line {}", path.display(), lineno + 1);
                }
            }
            debug!(target: "dam::policy", "loaded {} policies for subject {}", policies.order.len(), subject);
            subjects.insert(subject, policies);
        }
        info!(target: "dam::policy", "policy store opened at '{}' with {} subjects", dir.display(), subjects.len());
        Ok(Self { dir, subjects: RwLock::new(subjects), writers: Mutex::new(HashMap::new()) })
    }

    pub fn dir(&self) -> &Path { &self.dir }

    fn writer(&self, subject: &Uuid) -> Arc<Mutex<()>> {
        self.writers.lock().entry(*subject).or_default().clone()
    }

    /// Rewrite a subject's record file from the in-memory index. Caller holds the subject's
    /// writer lock.
    fn persist(&self, subject: &Uuid) -> AccessResult<()> {
        let bytes = match self.subjects.read().get(subject) {
            Some(policies) => policies.to_file_bytes(),
            None => return Ok(()),
        };
        write_atomic(&policy_file(&self.dir, subject), &policy_tmp_file(&self.dir, subject), &bytes)?;
        Ok(())
    }

    /// Apply `mutate` to one subject and persist it, restoring the old state if the file
    /// rewrite fails. Caller holds the subject's writer lock.
    fn mutate_subject<T>(
        &self,
        subject: &Uuid,
        mutate: impl FnOnce(&mut SubjectPolicies) -> AccessResult<T>,
    ) -> AccessResult<T> {
        let (before, out) = {
            let mut subjects = self.subjects.write();
            let policies = subjects.get_mut(subject).ok_or_else(|| AccessError::not_found("subject policy store", subject))?;
            let before = policies.clone();
            (before, mutate(policies)?)
        };
        if let Err(e) = self.persist(subject) {
            warn!(target: "dam::policy", "persisting policies of {} failed, rolling back: {}", subject, e);
            self.subjects.write().insert(*subject, before);
            return Err(e);
        }
        Ok(out)
    }

    /// Exact-tuple membership test.
    pub fn has(&self, subject: &Uuid, endpoint: &Uuid, resource: &str, action: Action) -> bool {
        self.subjects.read().get(subject).map_or(false, |p| p.contains(endpoint, resource, action))
    }

    /// Authorization check used on every tree node during partitioning. Same answer as `has`.
    #[inline]
    pub fn enforce(&self, subject: &Uuid, endpoint: &Uuid, resource: &str, action: Action) -> bool {
        self.has(subject, endpoint, resource, action)
    }

    /// All policies matching the filter, grouped by subject (ordered by uuid) and in grant
    /// order within a subject.
    pub fn filter(&self, filter: &PolicyFilter) -> Vec<Policy> {
        let subjects = self.subjects.read();
        let mut ids: Vec<&Uuid> = match &filter.subject {
            Some(s) => subjects.get_key_value(s).map(|(k, _)| vec![k]).unwrap_or_default(),
            None => subjects.keys().collect(),
        };
        ids.sort();
        ids.into_iter()
            .flat_map(|id| subjects[id].order.iter())
            .filter(|p| filter.matches(p))
            .cloned()
            .collect()
    }

    /// Resources a subject holds, grouped per endpoint, optionally limited to one action.
    pub fn resources_by_endpoint(&self, subject: &Uuid, action: Option<Action>) -> BTreeMap<Uuid, Vec<String>> {
        let mut out: BTreeMap<Uuid, Vec<String>> = BTreeMap::new();
        let filter = PolicyFilter { subject: Some(*subject), action, ..Default::default() };
        for p in self.filter(&filter) {
            let resources = out.entry(p.endpoint).or_default();
            if !resources.contains(&p.resource) { resources.push(p.resource); }
        }
        out
    }

    pub fn subjects(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.subjects.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn has_subject_store(&self, subject: &Uuid) -> bool { self.subjects.read().contains_key(subject) }

    pub fn add(&self, policy: Policy) -> AccessResult<Policy> {
        let subject = policy.subject;
        let lock = self.writer(&subject);
        let _guard = lock.lock();
        let stored = policy.clone();
        self.mutate_subject(&subject, move |policies| {
            let shown = policy.to_string();
            if policies.insert(policy) { Ok(()) } else { Err(AccessError::DuplicatePolicy(shown)) }
        })?;
        info!(target: "dam::policy", "policy added {}", stored);
        Ok(stored)
    }

    /// Remove every policy matching `filter`; fails with `NothingRemoved` when none matched.
    pub fn remove(&self, filter: &PolicyFilter) -> AccessResult<usize> {
        let targets: Vec<Uuid> = match filter.subject {
            Some(s) => vec![s],
            None => self.subjects(),
        };
        let mut removed = 0usize;
        for subject in targets {
            removed += self.remove_for_subject(&subject, filter)?;
        }
        if removed == 0 {
            return Err(AccessError::NothingRemoved(filter.to_string()));
        }
        info!(target: "dam::policy", "removed {} policies matching {}", removed, filter);
        Ok(removed)
    }

    fn remove_for_subject(&self, subject: &Uuid, filter: &PolicyFilter) -> AccessResult<usize> {
        let lock = self.writer(subject);
        let _guard = lock.lock();
        let hit = self.subjects.read().get(subject).map_or(false, |p| p.order.iter().any(|x| filter.matches(x)));
        if !hit { return Ok(0); }
        self.mutate_subject(subject, |policies| Ok(policies.remove_matching(filter).len()))
    }

    /// Drop every policy referencing an endpoint, across all subjects. Zero is not an error:
    /// this is the cascade run when an endpoint is deleted.
    pub fn purge_endpoint(&self, endpoint: &Uuid) -> AccessResult<usize> {
        let filter = PolicyFilter::endpoint(*endpoint);
        let mut purged = 0usize;
        for subject in self.subjects() {
            purged += self.remove_for_subject(&subject, &filter)?;
        }
        info!(target: "dam::policy", "purged {} policies of endpoint {}", purged, endpoint);
        Ok(purged)
    }

    /// Provision an empty record file for a subject.
    pub fn create_subject_store(&self, subject: &Uuid) -> AccessResult<()> {
        let lock = self.writer(subject);
        let _guard = lock.lock();
        let path = policy_file(&self.dir, subject);
        if path.exists() || self.has_subject_store(subject) {
            return Err(AccessError::already_exists("subject policy store", subject));
        }
        write_atomic(&path, &policy_tmp_file(&self.dir, subject), b"")?;
        self.subjects.write().insert(*subject, SubjectPolicies::default());
        info!(target: "dam::policy", "created policy store for subject {}", subject);
        Ok(())
    }

    /// Destroy a subject's record file and every policy it held. Returns the number of
    /// policies purged.
    pub fn delete_subject_store(&self, subject: &Uuid) -> AccessResult<usize> {
        let lock = self.writer(subject);
        let _guard = lock.lock();
        let path = policy_file(&self.dir, subject);
        let on_disk = path.exists();
        if on_disk { std::fs::remove_file(&path)?; }
        let purged = self.subjects.write().remove(subject);
        if !on_disk && purged.is_none() {
            return Err(AccessError::not_found("subject policy store", subject));
        }
        drop(_guard);
        self.writers.lock().remove(subject);
        let count = purged.map_or(0, |p| p.order.len());
        info!(target: "dam::policy", "deleted policy store for subject {} ({} policies)", subject, count);
        Ok(count)
    }
}
