//! # Sentinel Security Module
//!
//! Front door for everything the monitor trusts or records: the allow-list
//! of display identities, the device signing key, secure storage and the
//! signed audit log. All security-critical types are re-exported here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  sentinel.rs (you are here)                      │
//! │                  Public API facade & documentation               │
//! ├──────────────────┬──────────────┬──────────────┬────────────────┤
//! │ identity_store.rs│  signing.rs  │  audit.rs    │  storage.rs    │
//! │ Trusted set,     │  Device key, │  Append-only │  Key-value     │
//! │ atomic replace,  │  HMAC-SHA256 │  JSONL log,  │  secrets,      │
//! │ fallback policy  │  over events │  writer      │  0600 files    │
//! │                  │              │  thread      │                │
//! ├──────────────────┴──────────────┴──────────────┴────────────────┤
//! │  record.rs: SecurityEvent, decisions, canonical signed bytes    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! 1. **Allow-list only**: a display is admitted only if its hardware
//!    identity is in the active [`TrustedIdentitySet`]. Missing or
//!    unknown identities are rejected and audited.
//!
//! 2. **Swap, never edit**: the trusted set is replaced as a whole. The
//!    new version is persisted before it becomes visible, so readers see
//!    either the old set or the new one.
//!
//! 3. **Signed before committed**: every entry is signed with a device-local
//!    key over a canonical encoding that covers the timestamp, actor,
//!    subject, decision and context. Changing any of them breaks the
//!    signature.
//!
//! 4. **Degrade loudly**: if no key is available, entries are still
//!    recorded but marked `unsigned`, and a warning goes to the
//!    `display_sentinel::signing` target. Unsigned entries never verify.
//!
//! ## File Hierarchy
//!
//! ```text
//! <data_dir>/
//! ├── sentinel.device.key                   # 32-byte HMAC key (0600)
//! └── secure/
//!     ├── trusted_identities                # TrustedIdentitySet JSON
//!     └── screen_capture_permission         # Last authorization state
//! <state_dir>/
//! └── sentinel.audit.jsonl                  # Append-only audit log
//! ```
//!
//! ## Threat Model
//!
//! | Threat | Defense Layer |
//! |--------|--------------|
//! | Untrusted display attached | Identity allow-list, `invalid_serial` audit |
//! | Display without a serial | Rejected, `serial_missing` audit |
//! | Audit entry edited on disk | HMAC over the full canonical record |
//! | Allow-list half-written | Persist-then-swap, temp file + rename |
//! | Concurrent writers interleave lines | `flock` per line write |

// ── Trusted Identities ──────────────────────────────────────────────

pub use super::identity_store::{
    IdentityStore, IdentityStoreError, PLACEHOLDER_IDENTITY, TrustedIdentitySet,
};

// ── Signing & Integrity ─────────────────────────────────────────────

pub use super::signing::{
    DEVICE_KEY_LEN, DeviceKeyFile, EventSigner, KeyProvider, NoKey, SigningError, StaticKey,
    ensure_device_key, read_device_key,
};

// ── Security Events ─────────────────────────────────────────────────

pub use super::record::{
    AuditDecision, EventDraft, EventSignature, SECURITY_EVENT_DOMAIN, SecurityEvent,
};

// ── Audit Log ───────────────────────────────────────────────────────

pub use super::audit::{
    AUDIT_FILENAME, AuditFile, AuditLog, AuditReport, audit_file_path, read_audit_file,
    verify_audit_file,
};

// ── Secure Storage ──────────────────────────────────────────────────

pub use super::storage::{FileSecureStorage, MemorySecureStorage, SecureStorage, StorageError};
