//! Subjects and the identity provider seam.
//! Authentication lives outside this crate; the provider only maps slugs to uuids and roles.

mod provider;
mod subject;

pub use provider::{IdentityProvider, LocalIdentityProvider};
pub use subject::{Role, Subject};
