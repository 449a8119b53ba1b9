//! Screen-capture authorization gate.
//!
//! State machine over [`AuthorizationState`]. Calls are serialized by an
//! async mutex; the current state is published on a `watch` channel so any
//! number of observers can read it without touching the lock.
//!
//! | Input | From | To | Audit |
//! |-------|------|----|-------|
//! | `refresh`: preflight true | any but Granted | Granted | `preflight_granted` |
//! | `refresh`: preflight false | Granted, or persisted grant | Revoked | `revoked` |
//! | `refresh`: restricted | any but Restricted | Restricted | `system_restricted` |
//! | `request_access`: preflight true | any | Granted | `already_granted` |
//! | `request_access`: preflight false | Granted | Revoked, then prompt | `revoked` |
//! | `request_access`: restricted | any | Restricted | `system_restricted` |
//! | prompt true | any | Granted | `granted` |
//! | prompt false | any | Denied | `user_denied` |
//! | prompt cancelled | any | Denied | `user_cancelled` |
//! | prompt unknown error | any | unchanged | `system_error` |
//!
//! The gate never prompts on its own. Only `request_access` prompts, once
//! per call.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::errors::{AuthorizationError, AuthorizationState, SystemError};
use crate::security::{AuditDecision, AuditLog, EventDraft, SecureStorage};

/// Secure storage key for the last decided state.
pub const PERMISSION_MARKER_KEY: &str = "screen_capture_permission";

/// Host authorization service (external collaborator).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SystemAuthorizer: Send + Sync {
    /// Non-interactive check. Restriction is reported as an error.
    async fn preflight(&self) -> Result<bool, SystemError>;

    /// Show the user-facing prompt once.
    async fn request_capability(&self) -> Result<bool, SystemError>;
}

pub struct AuthorizationGate {
    authorizer: Arc<dyn SystemAuthorizer>,
    audit: AuditLog,
    storage: Arc<dyn SecureStorage>,
    state: watch::Sender<AuthorizationState>,
    serial: Mutex<()>,
}

impl AuthorizationGate {
    pub fn new(
        authorizer: Arc<dyn SystemAuthorizer>,
        audit: AuditLog,
        storage: Arc<dyn SecureStorage>,
    ) -> Self {
        let (state, _) = watch::channel(AuthorizationState::Unknown);
        Self {
            authorizer,
            audit,
            storage,
            state,
            serial: Mutex::new(()),
        }
    }

    pub fn state(&self) -> AuthorizationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthorizationState> {
        self.state.subscribe()
    }

    /// Resolve the state from a non-interactive preflight. Never prompts.
    pub async fn refresh(&self) -> AuthorizationState {
        let _serial = self.serial.lock().await;
        let current = self.state();

        match self.authorizer.preflight().await {
            Ok(true) => {
                if current != AuthorizationState::Granted {
                    self.commit(AuthorizationState::Granted, EventDraft::new(AuditDecision::PreflightGranted));
                }
            }
            Ok(false) => {
                let was_granted = current == AuthorizationState::Granted
                    || (current == AuthorizationState::Unknown
                        && self.persisted() == Some(AuthorizationState::Granted));
                if was_granted {
                    warn!("Screen capture permission was revoked");
                    self.commit(AuthorizationState::Revoked, EventDraft::new(AuditDecision::Revoked));
                } else {
                    debug!("Preflight: not granted, state stays {}", current);
                }
            }
            Err(e) => match e.classify() {
                AuthorizationError::SystemPolicyRestricted => {
                    if current != AuthorizationState::Restricted {
                        self.commit(
                            AuthorizationState::Restricted,
                            EventDraft::new(AuditDecision::SystemRestricted).with("code", e.code),
                        );
                    }
                }
                other => warn!("Authorization preflight failed: {}", other),
            },
        }

        self.state()
    }

    /// Obtain the capability, prompting the user at most once.
    pub async fn request_access(&self) -> Result<(), AuthorizationError> {
        let _serial = self.serial.lock().await;

        // A cached grant is never trusted: the host may have revoked it.
        match self.authorizer.preflight().await {
            Ok(true) => {
                debug!("Screen capture permission already granted");
                self.commit(AuthorizationState::Granted, EventDraft::new(AuditDecision::AlreadyGranted));
                return Ok(());
            }
            Ok(false) => {
                if self.state() == AuthorizationState::Granted {
                    warn!("Screen capture permission was revoked");
                    self.commit(AuthorizationState::Revoked, EventDraft::new(AuditDecision::Revoked));
                }
            }
            Err(e) => match e.classify() {
                AuthorizationError::SystemPolicyRestricted => {
                    warn!("Screen capture access is restricted by system policy");
                    self.commit(
                        AuthorizationState::Restricted,
                        EventDraft::new(AuditDecision::SystemRestricted).with("code", e.code),
                    );
                    return Err(AuthorizationError::SystemPolicyRestricted);
                }
                other => warn!("Authorization preflight failed, prompting anyway: {}", other),
            },
        }

        info!("Requesting screen capture permission");
        match self.authorizer.request_capability().await {
            Ok(true) => {
                info!("Screen capture permission granted");
                self.commit(AuthorizationState::Granted, EventDraft::new(AuditDecision::Granted));
                Ok(())
            }
            Ok(false) => {
                warn!("Screen capture permission denied by user");
                self.commit(AuthorizationState::Denied, EventDraft::new(AuditDecision::UserDenied));
                Err(AuthorizationError::DeniedByUser)
            }
            Err(e) => {
                let classified = e.classify();
                match &classified {
                    AuthorizationError::SystemPolicyRestricted => self.commit(
                        AuthorizationState::Restricted,
                        EventDraft::new(AuditDecision::SystemRestricted).with("code", e.code),
                    ),
                    AuthorizationError::UserCancelled => self.commit(
                        AuthorizationState::Denied,
                        EventDraft::new(AuditDecision::UserCancelled).with("code", e.code),
                    ),
                    AuthorizationError::DeniedByUser => self.commit(
                        AuthorizationState::Denied,
                        EventDraft::new(AuditDecision::UserDenied).with("code", e.code),
                    ),
                    AuthorizationError::Unexpected { code, message } => {
                        warn!("Unexpected authorization error {}: {}", code, message);
                        self.audit.append(
                            EventDraft::new(AuditDecision::SystemError)
                                .with("state", self.state())
                                .with("code", code)
                                .with("message", message),
                        );
                    }
                }
                Err(classified)
            }
        }
    }

    /// Publish `next`, write its audit entry and persist the marker.
    fn commit(&self, next: AuthorizationState, draft: EventDraft) {
        let previous = self.state.send_replace(next);
        self.audit
            .append(draft.with("from", previous).with("to", next));

        if let Err(e) = self
            .storage
            .save(PERMISSION_MARKER_KEY, next.as_str().as_bytes())
        {
            warn!("Failed to persist authorization state: {}", e);
        }
    }

    fn persisted(&self) -> Option<AuthorizationState> {
        match self.storage.load(PERMISSION_MARKER_KEY) {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(AuthorizationState::parse),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read authorization state: {}", e);
                None
            }
        }
    }
}
