//!
//! dam policy module
//! -----------------
//! Flat authorization tuples `(subject, endpoint, resource, action)` and the store that
//! persists them. A policy grants exactly one subject one action on one resource at one
//! endpoint; there is no inheritance between resources at this level, the tree partitioner
//! decides what ancestors a subject gets to see.
//!
//! On disk every subject owns one record file whose lines look like
//! `p, <subject_uuid>, <endpoint_uuid>, <resource>, <action>`.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AccessError, AccessResult};

mod store;

pub use store::PolicyStore;

/// Resource string granting full access to an endpoint.
pub const WILDCARD_RESOURCE: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Admin,
    Share,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Read, Action::Write, Action::Admin, Action::Share];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Admin => "admin",
            Action::Share => "share",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Action {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "admin" => Ok(Action::Admin),
            "share" => Ok(Action::Share),
            other => Err(AccessError::UnsupportedAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Policy {
    pub subject: Uuid,
    pub endpoint: Uuid,
    pub resource: String,
    pub action: Action,
}

impl Policy {
    pub fn new(subject: Uuid, endpoint: Uuid, resource: impl Into<String>, action: Action) -> Self {
        Self { subject, endpoint, resource: resource.into(), action }
    }

    /// Serialize as one record line (without the trailing newline).
    pub fn to_record(&self) -> String {
        format!("p, {}, {}, {}, {}", self.subject, self.endpoint, self.resource, self.action)
    }

    /// Parse one record line. The resource sits between the endpoint and the action and may
    /// itself contain commas, so the action is split off from the right.
    pub fn parse_record(line: &str) -> AccessResult<Self> {
        let bad = || AccessError::InvalidConfig(format!("malformed policy record: '{}'", line));
        let rest = line.trim().strip_prefix("p,").ok_or_else(bad)?;
        let (subject, rest) = rest.split_once(',').ok_or_else(bad)?;
        let (endpoint, rest) = rest.split_once(',').ok_or_else(bad)?;
        let (resource, action) = rest.rsplit_once(',').ok_or_else(bad)?;
        let resource = resource.trim();
        if resource.is_empty() { return Err(bad()); }
        Ok(Self {
            subject: Uuid::parse_str(subject.trim()).map_err(|_| bad())?,
            endpoint: Uuid::parse_str(endpoint.trim()).map_err(|_| bad())?,
            resource: resource.to_string(),
            action: action.parse().map_err(|_| bad())?,
        })
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}, {})", self.subject, self.endpoint, self.resource, self.action)
    }
}

/// Query shape for `filter`/`remove`: `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFilter {
    #[serde(default)]
    pub subject: Option<Uuid>,
    #[serde(default)]
    pub endpoint: Option<Uuid>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub action: Option<Action>,
}

impl PolicyFilter {
    pub fn subject(subject: Uuid) -> Self { Self { subject: Some(subject), ..Default::default() } }

    pub fn endpoint(endpoint: Uuid) -> Self { Self { endpoint: Some(endpoint), ..Default::default() } }

    pub fn matches(&self, p: &Policy) -> bool {
        self.subject.map_or(true, |s| s == p.subject)
            && self.endpoint.map_or(true, |e| e == p.endpoint)
            && self.resource.as_deref().map_or(true, |r| r == p.resource)
            && self.action.map_or(true, |a| a == p.action)
    }
}

impl From<&Policy> for PolicyFilter {
    fn from(p: &Policy) -> Self {
        Self { subject: Some(p.subject), endpoint: Some(p.endpoint), resource: Some(p.resource.clone()), action: Some(p.action) }
    }
}

impl Display for PolicyFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn or_any<T: Display>(v: &Option<T>) -> String { v.as_ref().map(|x| x.to_string()).unwrap_or_else(|| "*".into()) }
        write!(f, "filter({}, {}, {}, {})", or_any(&self.subject), or_any(&self.endpoint), or_any(&self.resource), or_any(&self.action))
    }
}
