//! Process-scoped service context.
//!
//! [`Sentinel`] is built once at startup and owns every long-lived service:
//! the trusted identity store, the audit log, the display monitor and the
//! authorization gate. Everything else borrows from it.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::authorization::{AuthorizationGate, AuthorizationState, SystemAuthorizer};
use crate::config::Config;
use crate::display::{
    DisplayEventBus, DisplayIdentity, DisplayMonitor, DisplayRegistry, EventClassifier,
    HardwareFeed, IdentityResolver, MonitorError,
};
use crate::security::{
    AuditDecision, AuditLog, DeviceKeyFile, EventDraft, EventSigner, FileSecureStorage,
    IdentityStore, IdentityStoreError, KeyProvider, NoKey, SecureStorage, TrustedIdentitySet,
    ensure_device_key,
};

/// External collaborators the core runs against.
pub struct Collaborators {
    pub feed: Arc<dyn HardwareFeed>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub authorizer: Arc<dyn SystemAuthorizer>,
    pub storage: Arc<dyn SecureStorage>,
    pub keys: Arc<dyn KeyProvider>,
}

impl Collaborators {
    /// File-backed storage and device key under `config.paths`, with the
    /// given display hardware and authorizer.
    pub fn host<D>(config: &Config, displays: Arc<D>, authorizer: Arc<dyn SystemAuthorizer>) -> Result<Self>
    where
        D: HardwareFeed + IdentityResolver + 'static,
    {
        let paths = &config.paths;
        let keys: Arc<dyn KeyProvider> = if config.audit.signing {
            let key_path = paths.device_key();
            ensure_device_key(&key_path)?;
            Arc::new(DeviceKeyFile::new(key_path))
        } else {
            warn!(
                target: "display_sentinel::signing",
                "Audit signing disabled by configuration; entries will be unsigned"
            );
            Arc::new(NoKey)
        };

        Ok(Self {
            feed: displays.clone(),
            resolver: displays,
            authorizer,
            storage: Arc::new(FileSecureStorage::new(paths.secure_storage_dir())),
            keys,
        })
    }
}

pub struct Sentinel {
    config: Config,
    identities: Arc<IdentityStore>,
    audit: AuditLog,
    monitor: DisplayMonitor,
    gate: Arc<AuthorizationGate>,
}

impl Sentinel {
    /// Wire every service together. Loads the trusted identity set and
    /// warms the audit history; does not start monitoring.
    pub fn build(config: Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            feed,
            resolver,
            authorizer,
            storage,
            keys,
        } = collaborators;

        let audit = AuditLog::open(
            config.paths.audit_log(),
            config.audit.actor.clone(),
            EventSigner::new(keys),
        )
        .context("Failed to open audit log")?;

        let identities = Arc::new(IdentityStore::new(storage.clone(), &config.identity));
        match identities.load() {
            Ok(_) => {}
            Err(IdentityStoreError::StoreUnavailable { reason, fallback }) => {
                audit.append(
                    EventDraft::new(AuditDecision::IdentityStoreUnavailable)
                        .with("reason", reason)
                        .with("fallback", config.identity.fallback)
                        .with("fallback_size", fallback.len()),
                );
            }
            Err(e) => return Err(e).context("Failed to load trusted identities"),
        }

        let registry = Arc::new(DisplayRegistry::new());
        let events = DisplayEventBus::new(config.monitor.event_buffer);
        let classifier = Arc::new(EventClassifier::new(
            registry.clone(),
            identities.clone(),
            audit.clone(),
            events.clone(),
            Duration::from_secs(config.monitor.removed_retention_secs),
        ));
        let monitor = DisplayMonitor::new(classifier, registry, events, feed, resolver);
        let gate = Arc::new(AuthorizationGate::new(authorizer, audit.clone(), storage));

        Ok(Self {
            config,
            identities,
            audit,
            monitor,
            gate,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn monitor(&self) -> &DisplayMonitor {
        &self.monitor
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    /// Start monitoring and resolve authorization in the background.
    pub async fn start(&self) -> Result<JoinHandle<AuthorizationState>, MonitorError> {
        self.monitor.start().await?;
        Ok(self.spawn_authorization_refresh())
    }

    /// Non-blocking startup preflight.
    pub fn spawn_authorization_refresh(&self) -> JoinHandle<AuthorizationState> {
        let gate = self.gate.clone();
        tokio::spawn(async move { gate.refresh().await })
    }

    /// Replace the allow-list as a whole and audit the change.
    pub fn replace_trusted_identities(
        &self,
        identities: impl IntoIterator<Item = DisplayIdentity>,
    ) -> Result<Arc<TrustedIdentitySet>, IdentityStoreError> {
        let before = self.identities.current();
        let next = self.identities.replace(identities)?;

        let old: BTreeSet<_> = before.iter().collect();
        let new: BTreeSet<_> = next.iter().collect();
        let added = new.difference(&old).count();
        let removed = old.difference(&new).count();

        self.audit.append(
            EventDraft::new(AuditDecision::IdentitySetReplaced)
                .with("version", next.version())
                .with("size", next.len())
                .with("added", added)
                .with("removed", removed),
        );
        Ok(next)
    }

    /// Stop monitoring (if running) and wait for the audit log to drain.
    pub async fn shutdown(&self) {
        match self.monitor.stop().await {
            Ok(()) | Err(MonitorError::NotRunning) => {}
            Err(e) => warn!("Failed to stop display monitor: {}", e),
        }
        self.audit.flush().await;
        info!("Sentinel shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::ScriptedAuthorizer;
    use crate::display::SimulatedDisplays;
    use crate::paths::Paths;
    use crate::security::{MemorySecureStorage, read_audit_file};

    fn config(root: &std::path::Path, trusted: &[&str]) -> Config {
        let mut config = Config {
            paths: Paths::under(root),
            ..Config::default()
        };
        config.identity.trusted = trusted.iter().map(|s| s.to_string()).collect();
        config.audit.actor = "tester".to_string();
        config
    }

    fn id(s: &str) -> DisplayIdentity {
        DisplayIdentity::parse(s).unwrap()
    }

    #[tokio::test]
    async fn host_collaborators_create_device_key() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), &["SN-100"]);
        let displays = Arc::new(SimulatedDisplays::new());
        let collaborators = Collaborators::host(
            &config,
            displays,
            Arc::new(ScriptedAuthorizer::new(Ok(false))),
        )
        .unwrap();
        assert!(config.paths.device_key().exists());

        let sentinel = Sentinel::build(config, collaborators).unwrap();
        assert!(sentinel.identities().contains(&id("SN-100")));
        sentinel.shutdown().await;
    }

    #[tokio::test]
    async fn replace_is_audited() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), &["SN-100", "SN-200"]);
        let audit_path = config.paths.audit_log();
        let displays = Arc::new(SimulatedDisplays::new());
        let collaborators =
            Collaborators::host(&config, displays, Arc::new(ScriptedAuthorizer::new(Ok(false))))
                .unwrap();
        let sentinel = Sentinel::build(config, collaborators).unwrap();

        let next = sentinel
            .replace_trusted_identities([id("SN-200"), id("SN-300")])
            .unwrap();
        assert_eq!(next.version(), 1);
        sentinel.shutdown().await;

        let file = read_audit_file(&audit_path).unwrap();
        let entry = file.entries.last().unwrap();
        assert_eq!(entry.decision, AuditDecision::IdentitySetReplaced);
        assert_eq!(entry.context.get("added").map(String::as_str), Some("1"));
        assert_eq!(entry.context.get("removed").map(String::as_str), Some("1"));
        assert!(entry.signature.is_signed());
    }

    #[tokio::test]
    async fn unavailable_store_is_audited_with_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), &["SN-100"]);
        let storage = Arc::new(MemorySecureStorage::new());
        storage.set_fail_reads(true);
        let displays = Arc::new(SimulatedDisplays::new());

        let sentinel = Sentinel::build(
            config,
            Collaborators {
                feed: displays.clone(),
                resolver: displays,
                authorizer: Arc::new(ScriptedAuthorizer::new(Ok(false))),
                storage,
                keys: Arc::new(NoKey),
            },
        )
        .unwrap();

        let history = sentinel.audit().load_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, AuditDecision::IdentityStoreUnavailable);
        assert_eq!(
            history[0].context.get("fallback").map(String::as_str),
            Some("placeholder")
        );
        assert!(!sentinel.identities().contains(&id("SN-100")));
        sentinel.shutdown().await;
    }

    #[tokio::test]
    async fn start_refreshes_authorization() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path(), &[]);
        let displays = Arc::new(SimulatedDisplays::new());
        let collaborators =
            Collaborators::host(&config, displays, Arc::new(ScriptedAuthorizer::new(Ok(true))))
                .unwrap();
        let sentinel = Sentinel::build(config, collaborators).unwrap();

        let refresh = sentinel.start().await.unwrap();
        assert_eq!(refresh.await.unwrap(), AuthorizationState::Granted);
        assert!(sentinel.monitor().is_running().await);

        sentinel.shutdown().await;
        assert!(!sentinel.monitor().is_running().await);
    }
}
