//! In-process display hardware, driven by calls or by a replay script.
//!
//! `SimulatedDisplays` implements both [`HardwareFeed`] and
//! [`IdentityResolver`], so the monitor can run end to end without OS
//! bindings. A [`ReplayScript`] feeds it a JSONL file of notifications:
//!
//! ```text
//! {"handle": 1, "serial": "SN-100", "main": true, "initial": true}
//! {"handle": 2, "serial": "SN-999", "flags": ["add"], "delay_ms": 250}
//! {"handle": 1, "flags": ["begin_configuration"]}
//! {"handle": 1, "flags": ["set_mode"]}
//! {"handle": 2, "flags": ["remove"]}
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::feed::{FeedError, HardwareFeed, IdentityResolver, NotificationSender};
use super::types::{ChangeFlags, DisplayHandle, DisplayIdentity};

#[derive(Debug, Clone)]
struct SimDisplay {
    serial: Option<DisplayIdentity>,
    is_main: bool,
}

#[derive(Default)]
struct SimState {
    displays: BTreeMap<DisplayHandle, SimDisplay>,
    sender: Option<NotificationSender>,
}

#[derive(Default)]
pub struct SimulatedDisplays {
    state: Mutex<SimState>,
}

impl SimulatedDisplays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display that is already connected when monitoring starts.
    pub fn connect_initial(&self, handle: u32, serial: Option<&str>, is_main: bool) {
        self.put(handle, serial, is_main);
    }

    /// Hot-plug a display. Returns `false` if no callback delivered it.
    pub fn attach(&self, handle: u32, serial: Option<&str>, is_main: bool) -> bool {
        self.put(handle, serial, is_main);
        self.emit(handle, ChangeFlags::ADD, None)
    }

    /// Unplug a display. Its serial can no longer be queried afterwards.
    pub fn detach(&self, handle: u32) -> bool {
        self.lock().displays.remove(&DisplayHandle(handle));
        self.emit(handle, ChangeFlags::REMOVE, None)
    }

    pub fn begin_configuration(&self, handle: u32) -> bool {
        self.emit(handle, ChangeFlags::BEGIN_CONFIGURATION, None)
    }

    pub fn reconfigure(&self, handle: u32, flags: ChangeFlags) -> bool {
        self.emit(handle, flags, None)
    }

    /// Deliver a raw notification through the registered callback.
    pub fn emit(&self, handle: u32, flags: ChangeFlags, context: Option<String>) -> bool {
        // Never call out while holding our own lock.
        let sender = self.lock().sender.clone();
        match sender {
            Some(sender) => sender.notify(DisplayHandle(handle), flags, context),
            None => {
                debug!("No callback registered; dropping notification for #{}", handle);
                false
            }
        }
    }

    pub fn is_registered(&self) -> bool {
        self.lock().sender.is_some()
    }

    fn put(&self, handle: u32, serial: Option<&str>, is_main: bool) {
        self.lock().displays.insert(
            DisplayHandle(handle),
            SimDisplay {
                serial: serial.and_then(DisplayIdentity::parse),
                is_main,
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HardwareFeed for SimulatedDisplays {
    fn register(&self, sender: NotificationSender) -> Result<(), FeedError> {
        let mut state = self.lock();
        if state.sender.is_some() {
            return Err(FeedError::AlreadyRegistered);
        }
        state.sender = Some(sender);
        Ok(())
    }

    fn deregister(&self) {
        self.lock().sender = None;
    }

    fn online_displays(&self) -> Vec<DisplayHandle> {
        self.lock().displays.keys().copied().collect()
    }
}

impl IdentityResolver for SimulatedDisplays {
    fn resolve(&self, handle: DisplayHandle) -> Option<DisplayIdentity> {
        self.lock()
            .displays
            .get(&handle)
            .and_then(|display| display.serial.clone())
    }

    fn is_main(&self, handle: DisplayHandle) -> bool {
        self.lock()
            .displays
            .get(&handle)
            .is_some_and(|display| display.is_main)
    }
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    handle: u32,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    main: bool,
    #[serde(default)]
    initial: bool,
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayStep {
    pub handle: u32,
    pub flags: ChangeFlags,
    pub serial: Option<String>,
    pub main: bool,
    pub delay: Duration,
}

/// Scripted sequence of hardware notifications.
#[derive(Debug, Clone, Default)]
pub struct ReplayScript {
    initial: Vec<ReplayStep>,
    steps: Vec<ReplayStep>,
}

/// Context tag on replayed notifications.
pub const REPLAY_CONTEXT: &str = "replay";

impl ReplayScript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay script {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid replay script {}", path.display()))
    }

    /// Parse JSONL. Blank lines and `#` comments are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut script = Self::default();

        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let raw: ReplayLine =
                serde_json::from_str(line).with_context(|| format!("line {}", n + 1))?;
            let flags = ChangeFlags::from_names(&raw.flags)
                .map_err(|e| anyhow::anyhow!("line {}: {}", n + 1, e))?;

            let step = ReplayStep {
                handle: raw.handle,
                flags,
                serial: raw.serial,
                main: raw.main,
                delay: Duration::from_millis(raw.delay_ms),
            };
            if raw.initial {
                script.initial.push(step);
            } else {
                script.steps.push(step);
            }
        }

        Ok(script)
    }

    pub fn steps(&self) -> &[ReplayStep] {
        &self.steps
    }

    /// Connect the displays marked `initial`. Call before starting the monitor.
    pub fn seed(&self, displays: &SimulatedDisplays) {
        for step in &self.initial {
            displays.connect_initial(step.handle, step.serial.as_deref(), step.main);
        }
    }

    /// Deliver every step in order, honouring delays. Returns how many
    /// notifications reached a registered callback.
    pub async fn play(&self, displays: &SimulatedDisplays) -> usize {
        let mut delivered = 0;
        for step in &self.steps {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            if step.flags.contains(ChangeFlags::ADD) && !step.flags.contains(ChangeFlags::REMOVE) {
                displays.put(step.handle, step.serial.as_deref(), step.main);
            }
            if step.flags.contains(ChangeFlags::REMOVE) {
                displays.lock().displays.remove(&DisplayHandle(step.handle));
            }
            if displays.emit(step.handle, step.flags, Some(REPLAY_CONTEXT.to_string())) {
                delivered += 1;
            }
        }
        delivered
    }
}
