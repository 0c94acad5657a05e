//! Front door of the access manager: ties the subject registry, the policy store and the
//! endpoint registry together and runs the request flow
//! (authorize, partition the endpoint tree, re-validate, issue).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::AccessCredential;
use crate::config::Settings;
use crate::endpoints::{Endpoint, EndpointRegistry};
use crate::error::{AccessError, AccessResult};
use crate::identity::{IdentityProvider, LocalIdentityProvider, Role, Subject};
use crate::policy::{Action, Policy, PolicyFilter, PolicyStore};
use crate::tree::{partition, ResourceTree};

pub struct AccessManager {
    settings: Settings,
    identities: Arc<dyn IdentityProvider>,
    policies: Arc<PolicyStore>,
    endpoints: EndpointRegistry,
}

impl AccessManager {
    /// Open every store named by `settings`, creating directories as needed.
    pub fn open(settings: Settings) -> AccessResult<Self> {
        settings.ensure_dirs()?;
        let identities = Arc::new(LocalIdentityProvider::open(&settings.uuid_store)?);
        let policies = Arc::new(PolicyStore::open(&settings.user_policies)?);
        let endpoints = EndpointRegistry::load(&settings.endpoint_configs, policies.clone())?;
        info!(target: "dam::manager", "access manager ready at {}", settings.data_root.display());
        Ok(Self { settings, identities, policies, endpoints })
    }

    /// Assemble from existing parts, e.g. an external identity provider.
    pub fn with_parts(
        settings: Settings,
        identities: Arc<dyn IdentityProvider>,
        policies: Arc<PolicyStore>,
        endpoints: EndpointRegistry,
    ) -> Self {
        Self { settings, identities, policies, endpoints }
    }

    pub fn settings(&self) -> &Settings { &self.settings }
    pub fn identities(&self) -> &Arc<dyn IdentityProvider> { &self.identities }
    pub fn policies(&self) -> &Arc<PolicyStore> { &self.policies }
    pub fn endpoints(&self) -> &EndpointRegistry { &self.endpoints }

    pub fn subject(&self, slug: &str) -> AccessResult<Subject> { self.identities.get(slug) }

    /// Create the identity, then its policy store. If the store cannot be provisioned the
    /// identity is deleted again before the error is returned.
    pub fn register_user(&self, slug: &str, role: Role) -> AccessResult<Subject> {
        let subject = self.identities.create_user(slug, role)?;
        if let Err(e) = self.policies.create_subject_store(&subject.uuid) {
            warn!(target: "dam::manager", "provisioning policies for '{}' failed, removing the user: {}", slug, e);
            if let Err(undo) = self.identities.delete_user(&subject.uuid) {
                error!(target: "dam::manager", "could not roll back user '{}' ({}): {}", slug, subject.uuid, undo);
            }
            return Err(e);
        }
        info!(target: "dam::manager", "registered user '{}' ({})", slug, subject.uuid);
        Ok(subject)
    }

    /// Delete the user's policies, then the user. Returns how many policies went with it.
    pub fn remove_user(&self, slug: &str) -> AccessResult<usize> {
        let subject = self.identities.get(slug)?;
        let purged = match self.policies.delete_subject_store(&subject.uuid) {
            Ok(n) => n,
            Err(AccessError::NotFound { .. }) => 0,
            Err(e) => return Err(e),
        };
        self.identities.delete_user(&subject.uuid)?;
        info!(target: "dam::manager", "removed user '{}' and {} policies", slug, purged);
        Ok(purged)
    }

    pub fn grant(&self, slug: &str, endpoint: &Uuid, resource: &str, action: Action) -> AccessResult<Policy> {
        let subject = self.identities.get(slug)?;
        self.endpoints.get(endpoint)?;
        self.policies.add(Policy::new(subject.uuid, *endpoint, resource, action))
    }

    pub fn revoke(&self, filter: &PolicyFilter) -> AccessResult<usize> { self.policies.remove(filter) }

    /// Connect a new endpoint and register it with `creator_slug` as its administrator.
    pub fn add_endpoint(
        &self,
        creator_slug: &str,
        name: &str,
        flavor: &str,
        config: serde_json::Value,
    ) -> AccessResult<Arc<Endpoint>> {
        let creator = self.identities.get(creator_slug)?;
        let endpoint = Endpoint::connect(name, flavor, config)?;
        let agent = endpoint.agent().clone();
        self.endpoints.add(endpoint, &creator.uuid).map_err(|e| {
            agent.close();
            e
        })
    }

    pub fn remove_endpoint(&self, uuid: &Uuid) -> AccessResult<Arc<Endpoint>> { self.endpoints.remove(uuid) }

    /// Re-list an endpoint's backend.
    pub fn refresh_endpoint(&self, uuid: &Uuid) -> AccessResult<Arc<ResourceTree>> {
        self.endpoints.get(uuid)?.agent().load_tree()
    }

    /// The part of `endpoint`'s tree the user may act on, per requested action.
    pub fn visible_tree(&self, slug: &str, endpoint: &Uuid, actions: &[Action]) -> AccessResult<BTreeMap<Action, ResourceTree>> {
        let subject = self.identities.get(slug)?;
        let ep = self.endpoints.get(endpoint)?;
        let tree = ep.agent().tree();
        let policies = &self.policies;
        Ok(partition(&tree, |node, action| policies.enforce(&subject.uuid, endpoint, &node.id, action), actions))
    }

    /// Re-validate the exact `(user, endpoint, resource, action)` grant and have the
    /// endpoint's agent mint credentials for it.
    pub fn issue_access(
        &self,
        slug: &str,
        endpoint: &Uuid,
        resource: &str,
        action: Action,
        ttl: Duration,
    ) -> AccessResult<AccessCredential> {
        let subject = self.identities.get(slug)?;
        let ep = self.endpoints.get(endpoint)?;
        if !self.policies.enforce(&subject.uuid, endpoint, resource, action) {
            warn!(target: "dam::manager", "denied {} on '{}' at {} for '{}'", action, resource, endpoint, slug);
            return Err(AccessError::Forbidden {
                subject: subject.uuid,
                endpoint: *endpoint,
                resource: resource.to_string(),
                action: action.to_string(),
            });
        }
        ep.agent().issue_access(resource, action, ttl)
    }

    /// `issue_access` with the configured default lifetime for `action`.
    pub fn issue_access_default(&self, slug: &str, endpoint: &Uuid, resource: &str, action: Action) -> AccessResult<AccessCredential> {
        self.issue_access(slug, endpoint, resource, action, self.settings.ttl_for(action))
    }

    /// Resources the user holds, per endpoint.
    pub fn resources_of(&self, slug: &str, action: Option<Action>) -> AccessResult<BTreeMap<Uuid, Vec<String>>> {
        let subject = self.identities.get(slug)?;
        Ok(self.policies.resources_by_endpoint(&subject.uuid, action))
    }

    /// Close every endpoint agent.
    pub fn shutdown(&self) { self.endpoints.close_all(); }
}
