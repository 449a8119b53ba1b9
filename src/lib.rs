//! display-sentinel - trusted display monitoring with a signed audit trail
//!
//! This crate provides:
//! - Display pipeline: hardware notifications classified against an
//!   allow-list of trusted display identities
//! - Authorization gate for the screen-capture capability
//! - Append-only audit log of every security decision, HMAC-signed
//! - Secure storage, configuration and XDG paths

pub mod authorization;
pub mod concurrency;
pub mod config;
pub mod display;
pub mod paths;
pub mod security;
pub mod service;

pub use config::Config;
pub use service::{Collaborators, Sentinel};
