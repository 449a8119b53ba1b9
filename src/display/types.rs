//! Core display data model: identities, hardware handles, change flags,
//! and the per-display state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::time::Instant;

/// Stable hardware-derived identifier (serial / product id) of a physical display.
///
/// Never empty. Used as the join key between the registry, the trusted
/// identity set and audit entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DisplayIdentity(String);

impl DisplayIdentity {
    /// Derive an identity from raw hardware data. Blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DisplayIdentity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| "display identity must not be blank".to_string())
    }
}

impl From<DisplayIdentity> for String {
    fn from(value: DisplayIdentity) -> Self {
        value.0
    }
}

/// Per-session numeric id the hardware feed uses for a display. Not trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayHandle(pub u32);

impl fmt::Display for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reconfiguration summary bits delivered with every hardware notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeFlags(u32);

const FLAG_NAMES: &[(&str, ChangeFlags)] = &[
    ("begin_configuration", ChangeFlags::BEGIN_CONFIGURATION),
    ("moved", ChangeFlags::MOVED),
    ("set_main", ChangeFlags::SET_MAIN),
    ("set_mode", ChangeFlags::SET_MODE),
    ("add", ChangeFlags::ADD),
    ("remove", ChangeFlags::REMOVE),
    ("enabled", ChangeFlags::ENABLED),
    ("disabled", ChangeFlags::DISABLED),
    ("mirror", ChangeFlags::MIRROR),
    ("unmirror", ChangeFlags::UNMIRROR),
    ("desktop_shape_changed", ChangeFlags::DESKTOP_SHAPE_CHANGED),
];

impl ChangeFlags {
    pub const NONE: Self = Self(0);
    pub const BEGIN_CONFIGURATION: Self = Self(1 << 0);
    pub const MOVED: Self = Self(1 << 1);
    pub const SET_MAIN: Self = Self(1 << 2);
    pub const SET_MODE: Self = Self(1 << 3);
    pub const ADD: Self = Self(1 << 4);
    pub const REMOVE: Self = Self(1 << 5);
    pub const ENABLED: Self = Self(1 << 8);
    pub const DISABLED: Self = Self(1 << 9);
    pub const MIRROR: Self = Self(1 << 10);
    pub const UNMIRROR: Self = Self(1 << 11);
    pub const DESKTOP_SHAPE_CHANGED: Self = Self(1 << 12);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Parse symbolic flag names (`"add"`, `"set_main"`, ...).
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        names.iter().try_fold(Self::NONE, |acc, name| {
            let name = name.as_ref();
            FLAG_NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, flag)| acc | *flag)
                .ok_or_else(|| format!("unknown change flag: {}", name))
        })
    }

    /// Symbolic names of the set bits, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl BitOr for ChangeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One raw notification from the hardware callback, before classification.
///
/// `identity` and `is_main` are read from the hardware when the callback
/// fires. A display that is unplugged before the notification is classified
/// still carries the serial it reported at the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub handle: DisplayHandle,
    pub flags: ChangeFlags,
    pub identity: Option<DisplayIdentity>,
    pub is_main: bool,
    /// Opaque context passed through from the feed, recorded but never trusted.
    pub context: Option<String>,
}

/// What a raw notification means once its flags are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Added,
    Removed,
    BeginConfiguration,
    EndConfiguration,
}

impl NotificationKind {
    /// Remove beats add when hardware reports both on one notification.
    pub fn from_flags(flags: ChangeFlags) -> Self {
        if flags.contains(ChangeFlags::REMOVE) {
            Self::Removed
        } else if flags.contains(ChangeFlags::ADD) {
            Self::Added
        } else if flags.contains(ChangeFlags::BEGIN_CONFIGURATION) {
            Self::BeginConfiguration
        } else {
            Self::EndConfiguration
        }
    }
}

/// Parameters of a fade reported by the external fade engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FadeParams {
    pub duration_ms: u64,
    /// Target brightness in percent (0-100).
    pub target_percent: u8,
}

/// Failure kinds a display can be parked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayErrorKind {
    GammaUnavailable,
    FadeAborted,
    Unresponsive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum DisplayState {
    Ready,
    ActiveFade(FadeParams),
    InterruptedFade(FadeParams),
    Recovering,
    Error(DisplayErrorKind),
}

/// Inputs to the per-display state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Admitted,
    BeginConfiguration,
    EndConfiguration,
    FadeStarted(FadeParams),
    FadeFinished,
    FadeFailed(DisplayErrorKind),
}

impl DisplayState {
    /// Next state for `event`. Defined for every (state, event) pair.
    pub fn apply(self, event: StateEvent) -> DisplayState {
        use DisplayState::*;

        match (self, event) {
            (_, StateEvent::Admitted) => Ready,
            (_, StateEvent::FadeFailed(kind)) => Error(kind),
            (Error(kind), _) => Error(kind),

            (ActiveFade(p) | InterruptedFade(p), StateEvent::BeginConfiguration) => {
                InterruptedFade(p)
            }
            (Ready | Recovering, StateEvent::BeginConfiguration) => Recovering,

            (Ready | Recovering, StateEvent::EndConfiguration) => Ready,
            (state @ (ActiveFade(_) | InterruptedFade(_)), StateEvent::EndConfiguration) => state,

            (Recovering, StateEvent::FadeStarted(_) | StateEvent::FadeFinished) => Recovering,
            (_, StateEvent::FadeStarted(p)) => ActiveFade(p),
            (_, StateEvent::FadeFinished) => Ready,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DisplayState::Ready => "ready",
            DisplayState::ActiveFade(_) => "active_fade",
            DisplayState::InterruptedFade(_) => "interrupted_fade",
            DisplayState::Recovering => "recovering",
            DisplayState::Error(_) => "error",
        }
    }
}

/// Last-known state of one display. Owned by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRecord {
    pub identity: DisplayIdentity,
    pub handle: DisplayHandle,
    pub online: bool,
    pub is_main: bool,
    pub previous_state: DisplayState,
    pub current_state: DisplayState,
    /// When the display went offline; drives retention pruning.
    pub removed_at: Option<Instant>,
}

impl DisplayRecord {
    pub fn admitted(identity: DisplayIdentity, handle: DisplayHandle, is_main: bool) -> Self {
        Self {
            identity,
            handle,
            online: true,
            is_main,
            previous_state: DisplayState::Ready,
            current_state: DisplayState::Ready,
            removed_at: None,
        }
    }

    /// Apply a state-machine event. `previous_state` is the snapshot taken
    /// when the last configuration began; other events leave it alone.
    pub fn transition(&mut self, event: StateEvent) -> DisplayState {
        let next = self.current_state.apply(event);
        if event == StateEvent::BeginConfiguration {
            self.previous_state = self.current_state;
        }
        self.current_state = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FADE: FadeParams = FadeParams {
        duration_ms: 500,
        target_percent: 0,
    };

    #[test]
    fn identity_rejects_blank() {
        assert!(DisplayIdentity::parse("").is_none());
        assert!(DisplayIdentity::parse("   ").is_none());
        assert_eq!(DisplayIdentity::parse(" SN-100 ").unwrap().as_str(), "SN-100");
    }

    #[test]
    fn identity_deserialize_rejects_blank() {
        assert!(serde_json::from_str::<DisplayIdentity>("\"\"").is_err());
        let id: DisplayIdentity = serde_json::from_str("\"SN-1\"").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"SN-1\"");
    }

    #[test]
    fn remove_wins_over_add() {
        let both = ChangeFlags::ADD | ChangeFlags::REMOVE;
        assert_eq!(NotificationKind::from_flags(both), NotificationKind::Removed);
        assert_eq!(
            NotificationKind::from_flags(ChangeFlags::ADD | ChangeFlags::SET_MAIN),
            NotificationKind::Added
        );
        assert_eq!(
            NotificationKind::from_flags(ChangeFlags::BEGIN_CONFIGURATION),
            NotificationKind::BeginConfiguration
        );
        assert_eq!(
            NotificationKind::from_flags(ChangeFlags::SET_MODE),
            NotificationKind::EndConfiguration
        );
    }

    #[test]
    fn flag_names_parse() {
        let flags = ChangeFlags::from_names(&["add", "set_main"]).unwrap();
        assert_eq!(flags, ChangeFlags::ADD | ChangeFlags::SET_MAIN);
        assert_eq!(flags.names(), vec!["set_main", "add"]);
        assert!(ChangeFlags::from_names(&["teleport"]).is_err());
        assert!(!ChangeFlags::NONE.contains(ChangeFlags::NONE));
    }

    #[test]
    fn configuration_cycle_returns_to_ready() {
        let mut record = DisplayRecord::admitted(
            DisplayIdentity::parse("SN-1").unwrap(),
            DisplayHandle(1),
            true,
        );
        assert_eq!(record.transition(StateEvent::BeginConfiguration), DisplayState::Recovering);
        assert_eq!(record.previous_state, DisplayState::Ready);
        assert_eq!(record.transition(StateEvent::EndConfiguration), DisplayState::Ready);
        assert_eq!(record.previous_state, DisplayState::Ready);
    }

    #[test]
    fn configuration_snapshot_survives_later_events() {
        let mut record = DisplayRecord::admitted(
            DisplayIdentity::parse("SN-1").unwrap(),
            DisplayHandle(1),
            false,
        );
        record.transition(StateEvent::FadeStarted(FADE));
        assert_eq!(record.previous_state, DisplayState::Ready);

        record.transition(StateEvent::BeginConfiguration);
        assert_eq!(record.previous_state, DisplayState::ActiveFade(FADE));
        assert_eq!(record.current_state, DisplayState::InterruptedFade(FADE));

        record.transition(StateEvent::EndConfiguration);
        record.transition(StateEvent::FadeFinished);
        assert_eq!(record.previous_state, DisplayState::ActiveFade(FADE));
        assert_eq!(record.current_state, DisplayState::Ready);
    }

    #[test]
    fn reconfiguration_interrupts_fade() {
        let state = DisplayState::ActiveFade(FADE);
        let state = state.apply(StateEvent::BeginConfiguration);
        assert_eq!(state, DisplayState::InterruptedFade(FADE));
        assert_eq!(state.apply(StateEvent::EndConfiguration), DisplayState::InterruptedFade(FADE));
        assert_eq!(state.apply(StateEvent::FadeStarted(FADE)), DisplayState::ActiveFade(FADE));
    }

    #[test]
    fn error_is_sticky_until_readmitted() {
        let state = DisplayState::Ready.apply(StateEvent::FadeFailed(DisplayErrorKind::GammaUnavailable));
        assert_eq!(state, DisplayState::Error(DisplayErrorKind::GammaUnavailable));
        assert_eq!(state.apply(StateEvent::EndConfiguration), state);
        assert_eq!(state.apply(StateEvent::FadeFinished), state);
        assert_eq!(state.apply(StateEvent::Admitted), DisplayState::Ready);
    }

    #[test]
    fn fades_wait_for_recovery() {
        assert_eq!(
            DisplayState::Recovering.apply(StateEvent::FadeStarted(FADE)),
            DisplayState::Recovering
        );
        assert_eq!(DisplayState::Ready.apply(StateEvent::FadeStarted(FADE)), DisplayState::ActiveFade(FADE));
        assert_eq!(DisplayState::ActiveFade(FADE).apply(StateEvent::FadeFinished), DisplayState::Ready);
    }
}
