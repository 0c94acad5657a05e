//! dam: a data access manager. Maps users to fine-grained grants on storage endpoints,
//! renders the part of each endpoint a user may see and mints short-lived backend
//! credentials (presigned URLs, signed certificates) for granted resources.

pub mod agents;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod identity;
pub mod manager;
pub mod policy;
pub mod system_paths;
pub mod tree;

pub use error::{AccessError, AccessResult};
pub use manager::AccessManager;

// Test-only printing helper: expands to tprintln! during tests and is absent otherwise.
// Usage in tests: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In non-test builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}
