pub mod access;
pub mod audit;
pub mod config;
pub mod identities;
pub mod monitor;
pub mod paths;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use display_sentinel::config::Config;
use display_sentinel::display::SimulatedDisplays;
use display_sentinel::{Collaborators, Sentinel};

#[derive(Parser)]
#[command(name = "display-sentinel")]
#[command(author, version, about = "Trusted display monitor with a signed audit trail")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch displays and classify every change
    Monitor(monitor::MonitorArgs),

    /// Trusted display identities
    Identities(identities::IdentitiesArgs),

    /// Security audit log
    Audit(audit::AuditArgs),

    /// Screen capture authorization
    Access(access::AccessArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Build the service context for one-shot commands and the monitor.
pub(crate) fn build_sentinel(config: Config, displays: Arc<SimulatedDisplays>) -> Result<Sentinel> {
    let storage = access::marker_storage(&config);
    let collaborators = Collaborators::host(
        &config,
        displays,
        Arc::new(access::TerminalAuthorizer::new(storage)),
    )?;
    Sentinel::build(config, collaborators)
}
