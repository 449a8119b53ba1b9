//! Monitoring session: owns the classifier task and the hardware callback.
//!
//! ```text
//!  hardware callback ──► NotificationSender ──► mpsc ──► monitor task
//!  fade engine ─────────► DisplayMonitor::report_fade ──┘      │
//!                                                              ▼
//!                                  EventClassifier ─► registry, audit, events
//! ```
//!
//! Exactly one consumer task drains the channel, so per-display order is
//! the order in which the hardware delivered notifications.

use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::classifier::EventClassifier;
use super::events::{DisplayEvent, DisplayEventBus};
use super::feed::{
    FadeReport, FeedError, HardwareFeed, IdentityResolver, MonitorCommand, NotificationSender,
};
use super::registry::DisplayRegistry;
use super::types::{ChangeFlags, DisplayIdentity};

/// Context tag on notifications synthesized at session start.
pub const INITIAL_REFRESH_CONTEXT: &str = "initial_refresh";

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("display monitor is already running")]
    AlreadyRunning,

    #[error("display monitor is not running")]
    NotRunning,

    #[error(transparent)]
    Feed(#[from] FeedError),
}

struct Session {
    tx: mpsc::UnboundedSender<MonitorCommand>,
    task: JoinHandle<()>,
}

pub struct DisplayMonitor {
    classifier: Arc<EventClassifier>,
    registry: Arc<DisplayRegistry>,
    events: DisplayEventBus,
    feed: Arc<dyn HardwareFeed>,
    resolver: Arc<dyn IdentityResolver>,
    session: Mutex<Option<Session>>,
}

impl DisplayMonitor {
    pub fn new(
        classifier: Arc<EventClassifier>,
        registry: Arc<DisplayRegistry>,
        events: DisplayEventBus,
        feed: Arc<dyn HardwareFeed>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            classifier,
            registry,
            events,
            feed,
            resolver,
            session: Mutex::new(None),
        }
    }

    /// Start a session: spawn the owning task, register the hardware
    /// callback, then classify every display that is already online.
    pub async fn start(&self) -> Result<(), MonitorError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_monitor(self.classifier.clone(), rx));

        let sender = NotificationSender::new(tx.clone(), self.resolver.clone());
        if let Err(e) = self.feed.register(sender.clone()) {
            let _ = tx.send(MonitorCommand::Shutdown);
            if let Err(join) = task.await {
                error!("Monitor task failed during aborted start: {}", join);
            }
            return Err(e.into());
        }

        // Registered first: anything that changes while we enumerate is
        // delivered by the callback, and a duplicate add is harmless.
        let online = self.feed.online_displays();
        debug!("Initial refresh of {} online display(s)", online.len());
        for handle in online {
            sender.notify(handle, ChangeFlags::ADD, Some(INITIAL_REFRESH_CONTEXT.to_string()));
        }

        *session = Some(Session { tx, task });
        info!("Display monitor started");
        Ok(())
    }

    /// End the session. Notifications queued before the call are still
    /// classified; afterwards the active-display state is cleared.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let Some(Session { tx, task }) = self.session.lock().await.take() else {
            return Err(MonitorError::NotRunning);
        };

        self.feed.deregister();
        let _ = tx.send(MonitorCommand::Shutdown);
        if let Err(e) = task.await {
            error!("Monitor task failed: {}", e);
        }

        self.registry.clear();
        info!("Display monitor stopped");
        Ok(())
    }

    /// Wait until everything enqueued before this call has been classified.
    pub async fn sync(&self) -> Result<(), MonitorError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(MonitorCommand::Barrier(done_tx)).await?;
        done_rx.await.map_err(|_| MonitorError::NotRunning)
    }

    /// Forward a fade engine report for `identity`.
    pub async fn report_fade(
        &self,
        identity: DisplayIdentity,
        report: FadeReport,
    ) -> Result<(), MonitorError> {
        self.send(MonitorCommand::Fade { identity, report }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.events.subscribe()
    }

    pub fn active_displays(&self) -> BTreeSet<DisplayIdentity> {
        self.registry.enumerate()
    }

    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn send(&self, command: MonitorCommand) -> Result<(), MonitorError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(MonitorError::NotRunning)?;
        session
            .tx
            .send(command)
            .map_err(|_| MonitorError::NotRunning)
    }
}

async fn run_monitor(classifier: Arc<EventClassifier>, mut rx: mpsc::UnboundedReceiver<MonitorCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            MonitorCommand::Notification(notification) => {
                classifier.handle(&notification);
            }
            MonitorCommand::Fade { identity, report } => {
                if let Err(e) = classifier.apply_fade(&identity, report) {
                    warn!("Ignoring fade report: {}", e);
                }
            }
            MonitorCommand::Barrier(done) => {
                let _ = done.send(());
            }
            MonitorCommand::Shutdown => break,
        }
    }
    debug!("Monitor task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::display::simulated::SimulatedDisplays;
    use crate::display::types::{DisplayState, FadeParams};
    use crate::security::{
        AuditDecision, AuditLog, DEVICE_KEY_LEN, EventSigner, IdentityStore, MemorySecureStorage,
        StaticKey,
    };
    use std::time::Duration;

    struct Fixture {
        monitor: DisplayMonitor,
        displays: Arc<SimulatedDisplays>,
        audit: AuditLog,
    }

    fn id(s: &str) -> DisplayIdentity {
        DisplayIdentity::parse(s).unwrap()
    }

    fn fixture(trusted: &[&str]) -> Fixture {
        let displays = Arc::new(SimulatedDisplays::new());
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
            EventSigner::new(Arc::new(StaticKey::new([5; DEVICE_KEY_LEN]))),
        );
        let events = DisplayEventBus::new(16);
        let classifier = Arc::new(EventClassifier::new(
            registry.clone(),
            identities,
            audit.clone(),
            events.clone(),
            Duration::ZERO,
        ));
        let monitor = DisplayMonitor::new(
            classifier,
            registry,
            events,
            displays.clone(),
            displays.clone(),
        );
        Fixture {
            monitor,
            displays,
            audit,
        }
    }

    #[tokio::test]
    async fn start_refreshes_online_displays() {
        let f = fixture(&["SN-100"]);
        f.displays.connect_initial(1, Some("SN-100"), true);
        f.displays.connect_initial(2, Some("SN-999"), false);

        f.monitor.start().await.unwrap();
        f.monitor.sync().await.unwrap();

        assert_eq!(f.monitor.active_displays(), BTreeSet::from([id("SN-100")]));
        let history = f.audit.load_history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| {
            e.context.get("feed_context").map(String::as_str) == Some(INITIAL_REFRESH_CONTEXT)
        }));

        f.monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn single_session_at_a_time() {
        let f = fixture(&[]);
        f.monitor.start().await.unwrap();
        assert!(matches!(f.monitor.start().await, Err(MonitorError::AlreadyRunning)));
        assert!(f.monitor.is_running().await);

        f.monitor.stop().await.unwrap();
        assert!(matches!(f.monitor.stop().await, Err(MonitorError::NotRunning)));
        assert!(matches!(f.monitor.sync().await, Err(MonitorError::NotRunning)));

        // A new session can register again
        f.monitor.start().await.unwrap();
        f.monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_queue_then_clears() {
        let f = fixture(&["SN-100", "SN-200"]);
        f.monitor.start().await.unwrap();

        f.displays.attach(1, Some("SN-100"), true);
        f.displays.attach(2, Some("SN-200"), false);
        f.monitor.stop().await.unwrap();

        // Both queued adds were classified before the session ended.
        let added = f
            .audit
            .load_history()
            .iter()
            .filter(|e| e.decision == AuditDecision::DisplayAdded)
            .count();
        assert_eq!(added, 2);
        assert!(f.monitor.active_displays().is_empty());
        assert!(!f.displays.is_registered());
    }

    #[tokio::test]
    async fn fade_reports_reach_state_machine() {
        let f = fixture(&["SN-100"]);
        f.monitor.start().await.unwrap();
        f.displays.attach(1, Some("SN-100"), true);

        let params = FadeParams {
            duration_ms: 300,
            target_percent: 0,
        };
        f.monitor
            .report_fade(id("SN-100"), FadeReport::Started(params))
            .await
            .unwrap();
        f.displays.begin_configuration(1);
        f.monitor.sync().await.unwrap();

        let record = f.monitor.registry.get(&id("SN-100")).unwrap();
        assert_eq!(record.previous_state, DisplayState::ActiveFade(params));
        assert_eq!(record.current_state, DisplayState::InterruptedFade(params));

        f.monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn observers_see_events_in_order() {
        let f = fixture(&["SN-100"]);
        let mut rx = f.monitor.subscribe();
        f.monitor.start().await.unwrap();

        f.displays.attach(1, Some("SN-100"), false);
        f.displays.begin_configuration(1);
        f.displays.reconfigure(1, ChangeFlags::MOVED);
        f.displays.detach(1);
        f.monitor.sync().await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), DisplayEvent::DisplayAdded { .. }));
        assert!(matches!(rx.recv().await.unwrap(), DisplayEvent::ConfigurationChanged { .. }));
        assert!(matches!(rx.recv().await.unwrap(), DisplayEvent::DisplayRemoved { .. }));

        f.monitor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn hot_plug_before_classification_keeps_identity() {
        let f = fixture(&["SN-100"]);
        f.monitor.start().await.unwrap();

        // Plugged and unplugged before the monitor task gets to run.
        f.displays.attach(1, Some("SN-100"), true);
        f.displays.detach(1);
        f.monitor.sync().await.unwrap();

        let history = f.audit.load_history();
        let audited: Vec<_> = history
            .iter()
            .map(|e| (e.decision, e.subject.clone()))
            .collect();
        assert_eq!(
            audited,
            vec![
                (AuditDecision::DisplayAdded, Some(id("SN-100"))),
                (AuditDecision::DisplayRemoved, Some(id("SN-100"))),
            ]
        );
        assert!(f.monitor.active_displays().is_empty());

        f.monitor.stop().await.unwrap();
    }
}
