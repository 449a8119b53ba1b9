//! CLI subcommand: `display-sentinel access`
//!
//! Screen capture authorization. Without OS bindings the prompt is a
//! terminal question and the preflight answer is the last decision stored
//! in secure storage.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Args, Subcommand};
use std::io::{BufRead, IsTerminal, Write};
use std::sync::Arc;

use display_sentinel::authorization::{
    AuthorizationError, AuthorizationState, PERMISSION_MARKER_KEY, SystemAuthorizer, SystemError,
    codes,
};
use display_sentinel::config::Config;
use display_sentinel::display::SimulatedDisplays;
use display_sentinel::security::{FileSecureStorage, SecureStorage};

#[derive(Args)]
pub struct AccessArgs {
    #[command(subcommand)]
    pub command: AccessCommands,
}

#[derive(Subcommand)]
pub enum AccessCommands {
    /// Show the current authorization state
    Status,

    /// Request screen capture access (prompts at most once)
    Request,
}

pub async fn run(args: AccessArgs) -> Result<()> {
    let config = Config::load()?;
    let sentinel = super::build_sentinel(config, Arc::new(SimulatedDisplays::new()))?;

    let result = match args.command {
        AccessCommands::Status => {
            let state = sentinel.gate().refresh().await;
            println!("Screen capture: {}", state);
            if state != AuthorizationState::Granted {
                println!("  Run `display-sentinel access request` to ask for access.");
            }
            Ok(())
        }
        AccessCommands::Request => match sentinel.gate().request_access().await {
            Ok(()) => {
                println!("Screen capture: granted");
                Ok(())
            }
            Err(e) => {
                println!("Screen capture: {}", sentinel.gate().state());
                if let Some(hint) = recovery_hint(&e) {
                    println!("  {}", hint);
                }
                Err(e.into())
            }
        },
    };

    sentinel.shutdown().await;
    result
}

/// Where the host keeps the screen capture permission.
#[cfg(target_os = "macos")]
const SETTINGS_LOCATION: &str = "System Settings > Privacy & Security > Screen Recording \
     (x-apple.systempreferences:com.apple.preference.security?Privacy_ScreenCapture)";
#[cfg(not(target_os = "macos"))]
const SETTINGS_LOCATION: &str = "your desktop's screen sharing permissions";

/// What the user can do next after a failed request.
fn recovery_hint(error: &AuthorizationError) -> Option<String> {
    match error {
        AuthorizationError::DeniedByUser => Some(format!(
            "To allow it later, enable display-sentinel in {} and run \
             `display-sentinel access request`.",
            SETTINGS_LOCATION
        )),
        AuthorizationError::UserCancelled => {
            Some("You can try again with `display-sentinel access request`.".to_string())
        }
        AuthorizationError::SystemPolicyRestricted => Some(
            "Screen capture is blocked by a device policy. Only an administrator can lift it."
                .to_string(),
        ),
        AuthorizationError::Unexpected { .. } => None,
    }
}

pub(crate) fn marker_storage(config: &Config) -> Arc<dyn SecureStorage> {
    Arc::new(FileSecureStorage::new(config.paths.secure_storage_dir()))
}

/// Authorizer that asks on the controlling terminal.
pub struct TerminalAuthorizer {
    storage: Arc<dyn SecureStorage>,
}

impl TerminalAuthorizer {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl SystemAuthorizer for TerminalAuthorizer {
    async fn preflight(&self) -> Result<bool, SystemError> {
        let stored = self
            .storage
            .load(PERMISSION_MARKER_KEY)
            .map_err(|e| SystemError::new(-1, e.to_string()))?;

        let state = stored
            .as_deref()
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(AuthorizationState::parse);
        match state {
            Some(AuthorizationState::Granted) => Ok(true),
            Some(AuthorizationState::Restricted) => Err(SystemError::restricted()),
            _ => Ok(false),
        }
    }

    async fn request_capability(&self) -> Result<bool, SystemError> {
        if !std::io::stdin().is_terminal() {
            return Err(SystemError::new(
                codes::NOT_INTERACTIVE,
                "no terminal to prompt on",
            ));
        }

        tokio::task::spawn_blocking(|| {
            print!("Allow display-sentinel to capture the screen? [y/N] ");
            std::io::stdout()
                .flush()
                .map_err(|e| SystemError::new(-1, e.to_string()))?;

            let mut answer = String::new();
            let read = std::io::stdin()
                .lock()
                .read_line(&mut answer)
                .map_err(|e| SystemError::new(-1, e.to_string()))?;
            if read == 0 {
                return Err(SystemError::cancelled());
            }
            Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
        })
        .await
        .map_err(|e| SystemError::new(-1, e.to_string()))?
    }
}
