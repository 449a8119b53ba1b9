//! Contracts for the host's display hardware.
//!
//! The hardware callback runs in a context we do not control. It only ever
//! sees a [`NotificationSender`], which reads the display's serial while the
//! hardware still reports it, forwards the notification into the monitor's
//! channel and returns immediately.

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::types::{
    ChangeFlags, DisplayErrorKind, DisplayHandle, DisplayIdentity, FadeParams, RawNotification,
    StateEvent,
};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("a reconfiguration callback is already registered")]
    AlreadyRegistered,

    #[error("hardware feed unavailable: {0}")]
    Unavailable(String),
}

/// Source of display reconfiguration notifications.
pub trait HardwareFeed: Send + Sync {
    /// Install the reconfiguration callback. One registration per session.
    fn register(&self, sender: NotificationSender) -> Result<(), FeedError>;

    /// Remove the callback. Harmless if none is installed.
    fn deregister(&self);

    /// Handles of displays online right now.
    fn online_displays(&self) -> Vec<DisplayHandle>;
}

/// Maps an untrusted handle to hardware-derived facts.
pub trait IdentityResolver: Send + Sync {
    /// Serial identity of the display behind `handle`, if it reports one.
    fn resolve(&self, handle: DisplayHandle) -> Option<DisplayIdentity>;

    fn is_main(&self, handle: DisplayHandle) -> bool;
}

/// State report from the external fade engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeReport {
    Started(FadeParams),
    Finished,
    Failed(DisplayErrorKind),
}

impl From<FadeReport> for StateEvent {
    fn from(report: FadeReport) -> Self {
        match report {
            FadeReport::Started(params) => StateEvent::FadeStarted(params),
            FadeReport::Finished => StateEvent::FadeFinished,
            FadeReport::Failed(kind) => StateEvent::FadeFailed(kind),
        }
    }
}

pub(crate) enum MonitorCommand {
    Notification(RawNotification),
    Fade {
        identity: DisplayIdentity,
        report: FadeReport,
    },
    Barrier(oneshot::Sender<()>),
    Shutdown,
}

impl RawNotification {
    /// Snapshot the hardware facts for `handle` at delivery time.
    pub fn capture(
        resolver: &dyn IdentityResolver,
        handle: DisplayHandle,
        flags: ChangeFlags,
        context: Option<String>,
    ) -> Self {
        Self {
            handle,
            flags,
            identity: resolver.resolve(handle),
            is_main: resolver.is_main(handle),
            context,
        }
    }
}

/// Handle given to the hardware callback.
#[derive(Clone)]
pub struct NotificationSender {
    tx: mpsc::UnboundedSender<MonitorCommand>,
    resolver: Arc<dyn IdentityResolver>,
}

impl NotificationSender {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<MonitorCommand>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self { tx, resolver }
    }

    /// Capture and forward one notification. Returns `false` once the
    /// monitor has stopped.
    ///
    /// Must not be called while holding a lock the resolver takes.
    pub fn notify(&self, handle: DisplayHandle, flags: ChangeFlags, context: Option<String>) -> bool {
        let notification = RawNotification::capture(self.resolver.as_ref(), handle, flags, context);
        self.tx
            .send(MonitorCommand::Notification(notification))
            .is_ok()
    }
}

/// Static resolver backed by a handle table. Useful for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    displays: BTreeMap<DisplayHandle, (Option<DisplayIdentity>, bool)>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handle: u32, serial: Option<&str>, is_main: bool) -> Self {
        self.displays.insert(
            DisplayHandle(handle),
            (serial.and_then(DisplayIdentity::parse), is_main),
        );
        self
    }
}

impl IdentityResolver for StaticResolver {
    fn resolve(&self, handle: DisplayHandle) -> Option<DisplayIdentity> {
        self.displays.get(&handle).and_then(|(id, _)| id.clone())
    }

    fn is_main(&self, handle: DisplayHandle) -> bool {
        self.displays.get(&handle).is_some_and(|(_, main)| *main)
    }
}
