//! Observer-facing event stream.
//!
//! Multicast via `tokio::sync::broadcast`: every subscriber sees each
//! event published after it subscribed, and nothing from before.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use super::types::{DisplayHandle, DisplayIdentity};

/// Validation and bookkeeping failures surfaced to observers. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigurationError {
    #[error("display {handle} did not report a serial identity")]
    SerialMissing { handle: DisplayHandle },

    #[error("display {handle} reported untrusted identity {identity}")]
    InvalidSerial {
        handle: DisplayHandle,
        identity: DisplayIdentity,
    },

    #[error("configuration change for display {handle}, which is not being monitored")]
    UnknownDisplay { handle: DisplayHandle },

    #[error("fade report for display {identity}, which is not online")]
    NotOnline { identity: DisplayIdentity },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DisplayEvent {
    DisplayAdded {
        identity: DisplayIdentity,
        handle: DisplayHandle,
        is_main: bool,
    },
    DisplayRemoved {
        /// `None` when neither the hardware nor the registry could name it.
        identity: Option<DisplayIdentity>,
        handle: DisplayHandle,
    },
    ConfigurationChanged {
        identity: DisplayIdentity,
        handle: DisplayHandle,
    },
    ConfigurationError {
        error: ConfigurationError,
    },
}

/// Cheap-to-clone publisher half of the event stream.
#[derive(Debug, Clone)]
pub struct DisplayEventBus {
    tx: broadcast::Sender<DisplayEvent>,
}

impl DisplayEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: DisplayEvent) {
        // No subscribers is normal: events are not buffered for late joiners.
        if self.tx.send(event).is_err() {
            trace!("No display event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> DisplayIdentity {
        DisplayIdentity::parse(s).unwrap()
    }

    #[tokio::test]
    async fn subscribers_only_see_future_events() {
        let bus = DisplayEventBus::new(8);
        bus.publish(DisplayEvent::DisplayRemoved {
            identity: None,
            handle: DisplayHandle(1),
        });

        let mut rx = bus.subscribe();
        let added = DisplayEvent::DisplayAdded {
            identity: id("SN-100"),
            handle: DisplayHandle(2),
            is_main: true,
        };
        bus.publish(added.clone());

        assert_eq!(rx.recv().await.unwrap(), added);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_serialize_tagged() {
        let event = DisplayEvent::ConfigurationError {
            error: ConfigurationError::InvalidSerial {
                handle: DisplayHandle(7),
                identity: id("SN-999"),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"configuration_error\""));
        assert!(json.contains("\"kind\":\"invalid_serial\""));
        assert!(json.contains("SN-999"));
    }

    #[test]
    fn error_messages_name_the_display() {
        let err = ConfigurationError::SerialMissing {
            handle: DisplayHandle(3),
        };
        assert_eq!(err.to_string(), "display #3 did not report a serial identity");
    }
}
