use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What the identity store serves when its backing storage is unreadable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Single placeholder identity (`"default"`), keeps the monitor usable.
    #[default]
    Placeholder,
    /// Empty set: every display is rejected until storage recovers.
    FailClosed,
}

impl std::str::FromStr for FallbackPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "placeholder" => Ok(Self::Placeholder),
            "fail_closed" => Ok(Self::FailClosed),
            other => anyhow::bail!("Unknown fallback policy: {}", other),
        }
    }
}

impl std::fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placeholder => f.write_str("placeholder"),
            Self::FailClosed => f.write_str("fail_closed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Seed allow-list used when nothing has been persisted yet
    #[serde(default)]
    pub trusted: Vec<String>,

    /// Behaviour when secure storage cannot be read
    #[serde(default)]
    pub fallback: FallbackPolicy,

    /// Secure storage key holding the trusted identity set
    #[serde(default = "default_identity_storage_key")]
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Actor recorded on every audit entry written by this process
    #[serde(default = "default_actor")]
    pub actor: String,

    /// Sign audit entries with the device key (default: true)
    #[serde(default = "default_true")]
    pub signing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds a removed display's record is kept before it is destroyed (0 = immediately)
    #[serde(default)]
    pub removed_retention_secs: u64,

    /// Capacity of the observer broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_identity_storage_key() -> String {
    "trusted_identities".to_string()
}
fn default_actor() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "system".to_string())
}
fn default_event_buffer() -> usize {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trusted: Vec::new(),
            fallback: FallbackPolicy::default(),
            storage_key: default_identity_storage_key(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            actor: default_actor(),
            signing: default_true(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            removed_retention_secs: 0,
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        Self::load_from(paths)
    }

    /// Load the config file under an already resolved layout.
    pub fn load_from(paths: Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            // Create default config file on first run
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.paths = paths;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;

        Ok(config)
    }

    /// Reject values the services cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.event_buffer == 0 {
            anyhow::bail!("monitor.event_buffer must be at least 1");
        }
        tracing_subscriber::EnvFilter::try_new(&self.logging.level)
            .with_context(|| format!("logging.level {:?} is not a valid filter", self.logging.level))?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["identity", "trusted"] => Ok(self.identity.trusted.join(",")),
            ["identity", "fallback"] => Ok(self.identity.fallback.to_string()),
            ["identity", "storage_key"] => Ok(self.identity.storage_key.clone()),
            ["audit", "actor"] => Ok(self.audit.actor.clone()),
            ["audit", "signing"] => Ok(self.audit.signing.to_string()),
            ["monitor", "removed_retention_secs"] => {
                Ok(self.monitor.removed_retention_secs.to_string())
            }
            ["monitor", "event_buffer"] => Ok(self.monitor.event_buffer.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["identity", "trusted"] => {
                self.identity.trusted = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            ["identity", "fallback"] => self.identity.fallback = value.parse()?,
            ["identity", "storage_key"] => self.identity.storage_key = value.to_string(),
            ["audit", "actor"] => self.audit.actor = value.to_string(),
            ["audit", "signing"] => self.audit.signing = value.parse()?,
            ["monitor", "removed_retention_secs"] => {
                self.monitor.removed_retention_secs = value.parse()?
            }
            ["monitor", "event_buffer"] => self.monitor.event_buffer = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        self.validate()
    }

    /// Edit one key on behalf of a user. Keys owned by another command are
    /// refused; on success the previous value is returned. The config is
    /// left untouched when the new value is rejected.
    pub fn update(&mut self, key: &str, value: &str) -> Result<String> {
        if let Some((_, owner)) = MANAGED_KEYS.iter().find(|(k, _)| *k == key) {
            anyhow::bail!("{} is managed by `{}`", key, owner);
        }

        let previous = self.get_value(key)?;
        let mut next = self.clone();
        next.set_value(key, value)?;
        *self = next;
        Ok(previous)
    }
}

/// Keys that `update` refuses, with the command that owns them. The stored
/// identity set wins over `identity.trusted` once it exists.
pub const MANAGED_KEYS: &[(&str, &str)] =
    &[("identity.trusted", "display-sentinel identities replace")];

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# display-sentinel configuration
# Auto-created on first run. Edit as needed.

[identity]
# Allow-list used until one is stored with `display-sentinel identities replace`
trusted = []
# When secure storage is unreadable:
#   "placeholder" - trust the single identity "default"
#   "fail_closed" - trust nothing
fallback = "placeholder"
storage_key = "trusted_identities"

[audit]
# actor = "alice"          # defaults to $USER
signing = true

[monitor]
removed_retention_secs = 0
event_buffer = 64

[logging]
level = "info"
"#;
