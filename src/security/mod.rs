//! Trust material and the audit trail for display-sentinel.
//!
//! See [`sentinel`] for the module overview, architecture diagram,
//! and public API documentation.

mod audit;
mod identity_store;
mod record;
mod sentinel;
mod signing;
mod storage;

// The sentinel.rs facade controls the entire public API surface.
pub use self::sentinel::*;
