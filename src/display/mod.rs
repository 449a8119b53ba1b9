//! Display pipeline: hardware notifications in, validated decisions out.

mod classifier;
mod events;
mod feed;
mod monitor;
mod registry;
pub mod simulated;
mod types;

pub use classifier::{Classification, EventClassifier};
pub use events::{ConfigurationError, DisplayEvent, DisplayEventBus};
pub use feed::{
    FadeReport, FeedError, HardwareFeed, IdentityResolver, NotificationSender, StaticResolver,
};
pub use monitor::{DisplayMonitor, INITIAL_REFRESH_CONTEXT, MonitorError};
pub use registry::DisplayRegistry;
pub use simulated::{ReplayScript, SimulatedDisplays};
pub use types::{
    ChangeFlags, DisplayErrorKind, DisplayHandle, DisplayIdentity, DisplayRecord, DisplayState,
    FadeParams, NotificationKind, RawNotification, StateEvent,
};
