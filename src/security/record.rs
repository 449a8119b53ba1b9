//! Security event records and their canonical signing encoding.
//!
//! # Canonical encoding
//!
//! The signed payload is a compact JSON object with a fixed field order,
//! prefixed by a domain separator and a newline:
//!
//! ```text
//! display-sentinel:security-event:v1
//! {"ts":"2026-02-09T14:00:00.000000000Z","actor":"alice","subject":"SN-100","decision":"display_added","context":{"handle":"1"}}
//! ```
//!
//! The timestamp is always rendered with nanosecond precision and a `Z`
//! suffix. The context map is a `BTreeMap`, so its keys are sorted. The
//! signature field itself is never part of the payload.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::display::DisplayIdentity;

/// Domain separator for signed security events.
pub const SECURITY_EVENT_DOMAIN: &str = "display-sentinel:security-event:v1";

/// Security decisions recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    /// Trusted display admitted to the active set.
    DisplayAdded,
    /// Display left the active set (or was reported gone).
    DisplayRemoved,
    /// Display reported an identity that is not on the allow-list.
    InvalidSerial,
    /// Display reported no identity at all.
    SerialMissing,
    /// Capability request found access already in place.
    AlreadyGranted,
    /// Startup preflight found access already in place.
    PreflightGranted,
    /// User granted access at the prompt.
    Granted,
    /// User refused access at the prompt.
    UserDenied,
    /// User dismissed the prompt without answering.
    UserCancelled,
    /// System policy forbids the capability.
    SystemRestricted,
    /// Host reported an error outside the known table.
    SystemError,
    /// Previously granted access is gone.
    Revoked,
    /// Trusted identity set replaced.
    IdentitySetReplaced,
    /// Trusted identity storage unreadable, fallback set in force.
    IdentityStoreUnavailable,
}

impl AuditDecision {
    pub const ALL: &'static [AuditDecision] = &[
        Self::DisplayAdded,
        Self::DisplayRemoved,
        Self::InvalidSerial,
        Self::SerialMissing,
        Self::AlreadyGranted,
        Self::PreflightGranted,
        Self::Granted,
        Self::UserDenied,
        Self::UserCancelled,
        Self::SystemRestricted,
        Self::SystemError,
        Self::Revoked,
        Self::IdentitySetReplaced,
        Self::IdentityStoreUnavailable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DisplayAdded => "display_added",
            Self::DisplayRemoved => "display_removed",
            Self::InvalidSerial => "invalid_serial",
            Self::SerialMissing => "serial_missing",
            Self::AlreadyGranted => "already_granted",
            Self::PreflightGranted => "preflight_granted",
            Self::Granted => "granted",
            Self::UserDenied => "user_denied",
            Self::UserCancelled => "user_cancelled",
            Self::SystemRestricted => "system_restricted",
            Self::SystemError => "system_error",
            Self::Revoked => "revoked",
            Self::IdentitySetReplaced => "identity_set_replaced",
            Self::IdentityStoreUnavailable => "identity_store_unavailable",
        }
    }

    /// Decisions produced by the authorization gate.
    pub fn is_authorization(self) -> bool {
        matches!(
            self,
            Self::AlreadyGranted
                | Self::PreflightGranted
                | Self::Granted
                | Self::UserDenied
                | Self::UserCancelled
                | Self::SystemRestricted
                | Self::SystemError
                | Self::Revoked
        )
    }
}

impl fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("unknown audit decision: {}", s))
    }
}

/// Signature attached to a security event.
///
/// Serialized as `{"hmac_sha256": "<hex>"}` or the bare string `"unsigned"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSignature {
    HmacSha256(String),
    /// No key was available when the entry was written.
    Unsigned,
}

impl EventSignature {
    pub fn is_signed(&self) -> bool {
        !matches!(self, Self::Unsigned)
    }
}

/// One immutable audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub ts: DateTime<Utc>,
    pub actor: String,
    #[serde(default)]
    pub subject: Option<DisplayIdentity>,
    pub decision: AuditDecision,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    pub signature: EventSignature,
}

#[derive(Serialize)]
struct CanonicalRecord<'a> {
    ts: String,
    actor: &'a str,
    subject: Option<&'a str>,
    decision: &'static str,
    context: &'a BTreeMap<String, String>,
}

impl SecurityEvent {
    /// Bytes covered by the signature: everything except the signature.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let record = CanonicalRecord {
            ts: self.ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
            actor: &self.actor,
            subject: self.subject.as_ref().map(DisplayIdentity::as_str),
            decision: self.decision.as_str(),
            context: &self.context,
        };

        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(SECURITY_EVENT_DOMAIN.as_bytes());
        bytes.push(b'\n');
        serde_json::to_writer(&mut bytes, &record)?;
        Ok(bytes)
    }
}

/// A decision waiting to be stamped, signed, and appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub decision: AuditDecision,
    pub subject: Option<DisplayIdentity>,
    pub context: BTreeMap<String, String>,
}

impl EventDraft {
    pub fn new(decision: AuditDecision) -> Self {
        Self {
            decision,
            subject: None,
            context: BTreeMap::new(),
        }
    }

    pub fn subject(mut self, identity: Option<DisplayIdentity>) -> Self {
        self.subject = identity;
        self
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}
