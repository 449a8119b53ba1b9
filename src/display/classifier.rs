//! Turns raw hardware notifications into validated decisions.
//!
//! For every notification the classifier decides what happened (added,
//! removed, configuration begin/end), validates the display against the
//! trusted identity set, updates the registry, writes the audit entry and
//! publishes the observer event, in that order.
//!
//! Only the monitor task calls into a classifier, so registry writes for
//! one identity happen in notification order.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::events::{ConfigurationError, DisplayEvent, DisplayEventBus};
use super::feed::FadeReport;
use super::registry::DisplayRegistry;
use super::types::{
    DisplayHandle, DisplayIdentity, DisplayRecord, DisplayState, NotificationKind,
    RawNotification, StateEvent,
};
use crate::security::{AuditDecision, AuditLog, EventDraft, IdentityStore};

/// Outcome of classifying one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Trusted display joined the active set.
    Admitted(DisplayIdentity),
    /// Add for a display that was already online.
    Refreshed(DisplayIdentity),
    /// Add refused; the display never enters the active set.
    Rejected(ConfigurationError),
    /// Display left (or was reported gone). `None` if it could not be named.
    Removed(Option<DisplayIdentity>),
    /// Configuration began; carries the state the display moved to.
    Reconfiguring(DisplayIdentity, DisplayState),
    /// Configuration settled; carries the recomputed state.
    Reconfigured(DisplayIdentity, DisplayState),
    /// Configuration notification for a display we are not tracking.
    Unknown(DisplayHandle),
}

pub struct EventClassifier {
    registry: Arc<DisplayRegistry>,
    identities: Arc<IdentityStore>,
    audit: AuditLog,
    events: DisplayEventBus,
    retention: Duration,
}

impl EventClassifier {
    pub fn new(
        registry: Arc<DisplayRegistry>,
        identities: Arc<IdentityStore>,
        audit: AuditLog,
        events: DisplayEventBus,
        retention: Duration,
    ) -> Self {
        Self {
            registry,
            identities,
            audit,
            events,
            retention,
        }
    }

    pub fn handle(&self, notification: &RawNotification) -> Classification {
        self.registry.prune_expired(self.retention);

        let kind = NotificationKind::from_flags(notification.flags);
        debug!(
            handle = %notification.handle,
            flags = ?notification.flags.names(),
            "Classifying notification as {:?}",
            kind
        );

        match kind {
            NotificationKind::Added => self.on_added(notification),
            NotificationKind::Removed => self.on_removed(notification),
            NotificationKind::BeginConfiguration => {
                self.on_configuration(notification, StateEvent::BeginConfiguration)
            }
            NotificationKind::EndConfiguration => {
                self.on_configuration(notification, StateEvent::EndConfiguration)
            }
        }
    }

    /// Feed a fade engine report into the display's state machine.
    pub fn apply_fade(
        &self,
        identity: &DisplayIdentity,
        report: FadeReport,
    ) -> Result<DisplayState, ConfigurationError> {
        let next = self.registry.upsert(identity, |slot| match slot.as_mut() {
            Some(record) if record.online => Some(record.transition(report.into())),
            _ => None,
        });

        match next {
            Some(state) => {
                debug!("Display {} is now {}", identity, state.label());
                Ok(state)
            }
            None => {
                let error = ConfigurationError::NotOnline {
                    identity: identity.clone(),
                };
                self.publish_error(&error);
                Err(error)
            }
        }
    }

    fn on_added(&self, notification: &RawNotification) -> Classification {
        let handle = notification.handle;

        let Some(identity) = notification.identity.clone() else {
            warn!("Display {} reported no serial identity; not admitted", handle);
            self.audit.append(
                self.draft(AuditDecision::SerialMissing, None, notification),
            );
            let error = ConfigurationError::SerialMissing { handle };
            self.publish_error(&error);
            return Classification::Rejected(error);
        };

        let trusted = self.identities.current();
        if !trusted.contains(&identity) {
            warn!("Display {} ({}) is not trusted; not admitted", identity, handle);
            self.audit.append(
                self.draft(AuditDecision::InvalidSerial, Some(identity.clone()), notification)
                    .with("trusted_set_version", trusted.version()),
            );
            let error = ConfigurationError::InvalidSerial { handle, identity };
            self.publish_error(&error);
            return Classification::Rejected(error);
        }

        let is_main = notification.is_main;
        let was_online = self.registry.upsert(&identity, |slot| match slot.as_mut() {
            Some(record) if record.online => {
                record.handle = handle;
                record.is_main = is_main;
                record.transition(StateEvent::Admitted);
                true
            }
            _ => {
                *slot = Some(DisplayRecord::admitted(identity.clone(), handle, is_main));
                false
            }
        });

        if !was_online {
            info!("Display {} admitted on {}", identity, handle);
            self.audit.append(
                self.draft(AuditDecision::DisplayAdded, Some(identity.clone()), notification)
                    .with("is_main", is_main)
                    .with("trusted_set_version", trusted.version()),
            );
        }

        self.events.publish(DisplayEvent::DisplayAdded {
            identity: identity.clone(),
            handle,
            is_main,
        });

        if was_online {
            Classification::Refreshed(identity)
        } else {
            Classification::Admitted(identity)
        }
    }

    fn on_removed(&self, notification: &RawNotification) -> Classification {
        let handle = notification.handle;
        let identity = notification
            .identity
            .clone()
            .or_else(|| self.registry.identity_for_handle(handle));

        let was_active = identity
            .as_ref()
            .is_some_and(|identity| self.registry.mark_removed(identity));

        match &identity {
            Some(identity) => info!("Display {} removed from {}", identity, handle),
            None => info!("Unidentified display removed from {}", handle),
        }

        self.audit.append(
            self.draft(AuditDecision::DisplayRemoved, identity.clone(), notification)
                .with("was_active", was_active),
        );
        self.events.publish(DisplayEvent::DisplayRemoved {
            identity: identity.clone(),
            handle,
        });

        self.registry.prune_expired(self.retention);
        Classification::Removed(identity)
    }

    fn on_configuration(&self, notification: &RawNotification, event: StateEvent) -> Classification {
        let handle = notification.handle;
        let Some(identity) = self.online_identity(notification) else {
            debug!("Configuration change for untracked display {}", handle);
            self.publish_error(&ConfigurationError::UnknownDisplay { handle });
            return Classification::Unknown(handle);
        };

        let next = self.registry.upsert(&identity, |slot| match slot.as_mut() {
            Some(record) if record.online => Some(record.transition(event)),
            _ => None,
        });
        let Some(state) = next else {
            self.publish_error(&ConfigurationError::UnknownDisplay { handle });
            return Classification::Unknown(handle);
        };

        if event == StateEvent::BeginConfiguration {
            debug!("Display {} reconfiguring, now {}", identity, state.label());
            return Classification::Reconfiguring(identity, state);
        }

        debug!("Display {} reconfigured, now {}", identity, state.label());
        self.events.publish(DisplayEvent::ConfigurationChanged {
            identity: identity.clone(),
            handle,
        });
        Classification::Reconfigured(identity, state)
    }

    /// Identity of the online display behind the notification, trusting the
    /// reported serial only when the registry agrees the display is online.
    fn online_identity(&self, notification: &RawNotification) -> Option<DisplayIdentity> {
        let handle = notification.handle;
        let is_online = |identity: &DisplayIdentity| {
            self.registry
                .get(identity)
                .is_some_and(|record| record.online)
        };

        notification
            .identity
            .clone()
            .filter(|identity| is_online(identity))
            .or_else(|| {
                self.registry
                    .identity_for_handle(handle)
                    .filter(|identity| is_online(identity))
            })
    }

    fn draft(
        &self,
        decision: AuditDecision,
        subject: Option<DisplayIdentity>,
        notification: &RawNotification,
    ) -> EventDraft {
        let mut draft = EventDraft::new(decision)
            .subject(subject)
            .with("handle", notification.handle.0);
        if let Some(context) = &notification.context {
            draft = draft.with("feed_context", context);
        }
        draft
    }

    fn publish_error(&self, error: &ConfigurationError) {
        self.events.publish(DisplayEvent::ConfigurationError {
            error: error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::display::feed::{IdentityResolver, StaticResolver};
    use std::collections::BTreeSet;
    use crate::display::types::{ChangeFlags, FadeParams};
    use crate::security::{
        DEVICE_KEY_LEN, EventSigner, MemorySecureStorage, SecurityEvent, StaticKey,
    };

    struct Fixture {
        classifier: EventClassifier,
        resolver: StaticResolver,
        registry: Arc<DisplayRegistry>,
        audit: AuditLog,
        events: DisplayEventBus,
    }

    impl Fixture {
        /// What the hardware callback would deliver for `handle` right now.
        fn note(&self, handle: u32, flags: ChangeFlags) -> RawNotification {
            RawNotification::capture(&self.resolver, DisplayHandle(handle), flags, None)
        }
    }

    fn id(s: &str) -> DisplayIdentity {
        DisplayIdentity::parse(s).unwrap()
    }

    fn fixture(resolver: StaticResolver, trusted: &[&str]) -> Fixture {
        let registry = Arc::new(DisplayRegistry::new());
        let identities = Arc::new(IdentityStore::new(
            Arc::new(MemorySecureStorage::new()),
            &IdentityConfig {
                trusted: trusted.iter().map(|s| s.to_string()).collect(),
                ..IdentityConfig::default()
            },
        ));
        identities.load().unwrap();
        let audit = AuditLog::in_memory(
            "tester",
            EventSigner::new(Arc::new(StaticKey::new([3; DEVICE_KEY_LEN]))),
        );
        let events = DisplayEventBus::new(32);
        let classifier = EventClassifier::new(
            registry.clone(),
            identities,
            audit.clone(),
            events.clone(),
            Duration::ZERO,
        );
        Fixture {
            classifier,
            resolver,
            registry,
            audit,
            events,
        }
    }

    fn decisions(log: &[SecurityEvent]) -> Vec<AuditDecision> {
        log.iter().map(|e| e.decision).collect()
    }

    #[tokio::test]
    async fn trusted_add_then_remove() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), true), &["SN-100"]);
        let mut rx = f.events.subscribe();

        assert_eq!(
            f.classifier.handle(&f.note(1, ChangeFlags::ADD)),
            Classification::Admitted(id("SN-100"))
        );
        assert!(f.registry.enumerate().contains(&id("SN-100")));

        assert_eq!(
            f.classifier.handle(&f.note(1, ChangeFlags::REMOVE)),
            Classification::Removed(Some(id("SN-100")))
        );
        assert!(f.registry.enumerate().is_empty());
        // Zero retention destroys the record
        assert!(f.registry.get(&id("SN-100")).is_none());

        let history = f.audit.load_history();
        assert_eq!(
            decisions(&history),
            vec![AuditDecision::DisplayAdded, AuditDecision::DisplayRemoved]
        );
        assert_eq!(history[0].context.get("is_main").map(String::as_str), Some("true"));
        assert_eq!(history[1].context.get("was_active").map(String::as_str), Some("true"));

        assert!(matches!(rx.recv().await.unwrap(), DisplayEvent::DisplayAdded { is_main: true, .. }));
        assert!(matches!(rx.recv().await.unwrap(), DisplayEvent::DisplayRemoved { identity: Some(_), .. }));
    }

    #[tokio::test]
    async fn untrusted_add_is_rejected() {
        let f = fixture(StaticResolver::new().with(2, Some("SN-999"), false), &["SN-100"]);
        let mut rx = f.events.subscribe();

        let outcome = f.classifier.handle(&f.note(2, ChangeFlags::ADD));
        assert!(matches!(
            outcome,
            Classification::Rejected(ConfigurationError::InvalidSerial { .. })
        ));
        assert!(f.registry.enumerate().is_empty());
        assert!(f.registry.get(&id("SN-999")).is_none());

        let history = f.audit.load_history();
        assert_eq!(decisions(&history), vec![AuditDecision::InvalidSerial]);
        assert_eq!(history[0].subject, Some(id("SN-999")));

        assert!(matches!(
            rx.recv().await.unwrap(),
            DisplayEvent::ConfigurationError {
                error: ConfigurationError::InvalidSerial { .. }
            }
        ));
    }

    #[test]
    fn missing_serial_is_rejected() {
        let f = fixture(StaticResolver::new().with(3, None, false), &["SN-100"]);

        let outcome = f.classifier.handle(&f.note(3, ChangeFlags::ADD));
        assert_eq!(
            outcome,
            Classification::Rejected(ConfigurationError::SerialMissing {
                handle: DisplayHandle(3)
            })
        );
        let history = f.audit.load_history();
        assert_eq!(decisions(&history), vec![AuditDecision::SerialMissing]);
        assert_eq!(history[0].subject, None);
        assert_eq!(history[0].context.get("handle").map(String::as_str), Some("3"));
    }

    #[test]
    fn duplicate_add_is_audited_once() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), false), &["SN-100"]);

        f.classifier.handle(&f.note(1, ChangeFlags::ADD));
        assert_eq!(
            f.classifier.handle(&f.note(1, ChangeFlags::ADD)),
            Classification::Refreshed(id("SN-100"))
        );
        assert_eq!(decisions(&f.audit.load_history()), vec![AuditDecision::DisplayAdded]);
    }

    #[test]
    fn remove_wins_when_both_flags_set() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), false), &["SN-100"]);
        f.classifier.handle(&f.note(1, ChangeFlags::ADD));

        let outcome = f.classifier.handle(&f.note(1, ChangeFlags::ADD | ChangeFlags::REMOVE));
        assert_eq!(outcome, Classification::Removed(Some(id("SN-100"))));
        assert!(f.registry.enumerate().is_empty());
    }

    #[test]
    fn removal_of_unknown_display_is_still_audited() {
        let f = fixture(StaticResolver::new(), &["SN-100"]);

        assert_eq!(
            f.classifier.handle(&f.note(7, ChangeFlags::REMOVE)),
            Classification::Removed(None)
        );
        let history = f.audit.load_history();
        assert_eq!(decisions(&history), vec![AuditDecision::DisplayRemoved]);
        assert_eq!(history[0].subject, None);
        assert_eq!(history[0].context.get("was_active").map(String::as_str), Some("false"));
    }

    #[test]
    fn removal_falls_back_to_handle_index() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), false), &["SN-100"]);
        f.classifier.handle(&f.note(1, ChangeFlags::ADD));

        // The display is gone: the remove carries no serial.
        let gone = RawNotification::capture(
            &StaticResolver::new(),
            DisplayHandle(1),
            ChangeFlags::REMOVE,
            None,
        );
        assert_eq!(gone.identity, None);
        assert_eq!(
            f.classifier.handle(&gone),
            Classification::Removed(Some(id("SN-100")))
        );
        assert_eq!(
            decisions(&f.audit.load_history()),
            vec![AuditDecision::DisplayAdded, AuditDecision::DisplayRemoved]
        );
    }

    #[test]
    fn add_uses_serial_captured_at_delivery() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), true), &["SN-100"]);
        let added = f.note(1, ChangeFlags::ADD);

        // Unplugged before the add is classified; the resolver has forgotten it.
        let f = Fixture {
            resolver: StaticResolver::new(),
            ..f
        };
        let removed = f.note(1, ChangeFlags::REMOVE);

        assert_eq!(
            f.classifier.handle(&added),
            Classification::Admitted(id("SN-100"))
        );
        assert_eq!(
            f.classifier.handle(&removed),
            Classification::Removed(Some(id("SN-100")))
        );

        let history = f.audit.load_history();
        assert_eq!(
            decisions(&history),
            vec![AuditDecision::DisplayAdded, AuditDecision::DisplayRemoved]
        );
        assert!(history.iter().all(|e| e.subject == Some(id("SN-100"))));
        assert_eq!(history[0].context.get("is_main").map(String::as_str), Some("true"));
    }

    /// Every add/remove sequence for one display: membership follows the
    /// last well-formed add or remove, and each change of the active set is
    /// audited exactly once.
    #[test]
    fn add_remove_sequences_keep_parity() {
        const STEPS: usize = 8;

        for seq in 0u32..(1 << STEPS) {
            let f = fixture(StaticResolver::new().with(1, Some("SN-100"), false), &["SN-100"]);
            let mut online = false;
            let mut added = 0;
            let mut removed = 0;
            let mut deactivated = 0;

            for step in 0..STEPS {
                let is_add = seq & (1 << step) != 0;
                if is_add {
                    f.classifier.handle(&f.note(1, ChangeFlags::ADD));
                    if !online {
                        added += 1;
                    }
                    online = true;
                } else {
                    f.classifier.handle(&f.note(1, ChangeFlags::REMOVE));
                    removed += 1;
                    if online {
                        deactivated += 1;
                    }
                    online = false;
                }

                let history = f.audit.load_history();
                let count = |d: AuditDecision| history.iter().filter(|e| e.decision == d).count();
                assert_eq!(
                    f.registry.enumerate().contains(&id("SN-100")),
                    online,
                    "sequence {:08b} step {}",
                    seq,
                    step
                );
                assert_eq!(count(AuditDecision::DisplayAdded), added, "sequence {:08b}", seq);
                // Removals are audited even when nothing was active.
                assert_eq!(count(AuditDecision::DisplayRemoved), removed, "sequence {:08b}", seq);
                let was_active: Vec<_> = history
                    .iter()
                    .filter(|e| e.decision == AuditDecision::DisplayRemoved)
                    .filter(|e| e.context.get("was_active").map(String::as_str) == Some("true"))
                    .collect();
                assert_eq!(was_active.len(), deactivated, "sequence {:08b}", seq);
            }
        }
    }

    /// Same parity with a second display interleaved and untrusted adds
    /// mixed in: neither disturbs the first display's record.
    #[test]
    fn interleaved_displays_do_not_disturb_each_other() {
        let resolver = StaticResolver::new()
            .with(1, Some("SN-100"), false)
            .with(2, Some("SN-200"), false)
            .with(3, Some("SN-999"), false);
        let f = fixture(resolver, &["SN-100", "SN-200"]);

        // (handle, is_add)
        let script = [
            (1, true),
            (2, true),
            (3, true),
            (1, true),
            (2, false),
            (3, false),
            (2, false),
            (1, false),
            (2, true),
            (1, true),
        ];
        let mut expected = BTreeSet::new();
        for (handle, is_add) in script {
            let flags = if is_add { ChangeFlags::ADD } else { ChangeFlags::REMOVE };
            f.classifier.handle(&f.note(handle, flags));
            let identity = f.resolver.resolve(DisplayHandle(handle)).unwrap();
            if identity.as_str() != "SN-999" {
                if is_add {
                    expected.insert(identity);
                } else {
                    expected.remove(&identity);
                }
            }
            assert_eq!(f.registry.enumerate(), expected);
        }

        let history = f.audit.load_history();
        let count = |d: AuditDecision| history.iter().filter(|e| e.decision == d).count();
        assert_eq!(count(AuditDecision::DisplayAdded), 4);
        assert_eq!(count(AuditDecision::DisplayRemoved), 4);
        assert_eq!(count(AuditDecision::InvalidSerial), 1);
    }

    #[tokio::test]
    async fn configuration_cycle_updates_state() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), false), &["SN-100"]);
        f.classifier.handle(&f.note(1, ChangeFlags::ADD));
        let mut rx = f.events.subscribe();

        assert_eq!(
            f.classifier.handle(&f.note(1, ChangeFlags::BEGIN_CONFIGURATION)),
            Classification::Reconfiguring(id("SN-100"), DisplayState::Recovering)
        );
        let record = f.registry.get(&id("SN-100")).unwrap();
        assert_eq!(record.previous_state, DisplayState::Ready);
        assert_eq!(record.current_state, DisplayState::Recovering);

        assert_eq!(
            f.classifier.handle(&f.note(1, ChangeFlags::SET_MODE)),
            Classification::Reconfigured(id("SN-100"), DisplayState::Ready)
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            DisplayEvent::ConfigurationChanged {
                identity: id("SN-100"),
                handle: DisplayHandle(1)
            }
        );
        // Configuration changes are not security decisions
        assert_eq!(f.audit.load_history().len(), 1);
    }

    #[tokio::test]
    async fn configuration_for_unknown_display_is_reported() {
        let f = fixture(StaticResolver::new().with(5, Some("SN-999"), false), &["SN-100"]);
        let mut rx = f.events.subscribe();

        assert_eq!(
            f.classifier.handle(&f.note(5, ChangeFlags::MOVED)),
            Classification::Unknown(DisplayHandle(5))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            DisplayEvent::ConfigurationError {
                error: ConfigurationError::UnknownDisplay {
                    handle: DisplayHandle(5)
                }
            }
        );
    }

    #[test]
    fn fade_interrupted_by_configuration() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), false), &["SN-100"]);
        f.classifier.handle(&f.note(1, ChangeFlags::ADD));
        let params = FadeParams {
            duration_ms: 800,
            target_percent: 10,
        };

        assert_eq!(
            f.classifier.apply_fade(&id("SN-100"), FadeReport::Started(params)),
            Ok(DisplayState::ActiveFade(params))
        );
        f.classifier.handle(&f.note(1, ChangeFlags::BEGIN_CONFIGURATION));
        assert_eq!(
            f.registry.get(&id("SN-100")).unwrap().current_state,
            DisplayState::InterruptedFade(params)
        );
        assert_eq!(
            f.classifier.apply_fade(&id("SN-100"), FadeReport::Finished),
            Ok(DisplayState::Ready)
        );
    }

    #[test]
    fn fade_for_offline_display_errors() {
        let f = fixture(StaticResolver::new(), &["SN-100"]);
        assert_eq!(
            f.classifier.apply_fade(&id("SN-100"), FadeReport::Finished),
            Err(ConfigurationError::NotOnline {
                identity: id("SN-100")
            })
        );
    }

    #[test]
    fn feed_context_is_recorded() {
        let f = fixture(StaticResolver::new().with(1, Some("SN-100"), false), &["SN-100"]);
        let mut n = f.note(1, ChangeFlags::ADD);
        n.context = Some("initial_refresh".to_string());
        f.classifier.handle(&n);

        let history = f.audit.load_history();
        assert_eq!(
            history[0].context.get("feed_context").map(String::as_str),
            Some("initial_refresh")
        );
    }
}
