//! Capability authorization (screen capture) behind an audited gate.

mod errors;
mod gate;
mod scripted;

pub use errors::{AuthorizationError, AuthorizationState, SystemError, codes};
pub use gate::{AuthorizationGate, PERMISSION_MARKER_KEY, SystemAuthorizer};
pub use scripted::ScriptedAuthorizer;
