//! CLI subcommand: `display-sentinel identities`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use display_sentinel::config::Config;
use display_sentinel::display::{DisplayIdentity, SimulatedDisplays};

#[derive(Args)]
pub struct IdentitiesArgs {
    #[command(subcommand)]
    pub command: IdentitiesCommands,
}

#[derive(Subcommand)]
pub enum IdentitiesCommands {
    /// List the active trusted identity set
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replace the trusted identity set as a whole
    Replace {
        /// Display serials to trust
        identities: Vec<String>,

        /// Read serials from a file, one per line
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

pub async fn run(args: IdentitiesArgs) -> Result<()> {
    let config = Config::load()?;
    let sentinel = super::build_sentinel(config, Arc::new(SimulatedDisplays::new()))?;

    let result = match args.command {
        IdentitiesCommands::List { json } => {
            let set = sentinel.identities().current();
            if json {
                println!("{}", serde_json::to_string_pretty(&*set)?);
            } else {
                println!("Trusted identities (v{}, {}):", set.version(), set.len());
                for identity in set.iter() {
                    println!("  {}", identity);
                }
            }
            Ok(())
        }
        IdentitiesCommands::Replace { identities, file } => {
            replace(&sentinel, identities, file.as_deref())
        }
    };

    sentinel.shutdown().await;
    result
}

fn replace(
    sentinel: &display_sentinel::Sentinel,
    mut raw: Vec<String>,
    file: Option<&std::path::Path>,
) -> Result<()> {
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        raw.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.starts_with('#'))
                .map(str::to_string),
        );
    }

    let identities: Vec<DisplayIdentity> = raw
        .iter()
        .filter_map(|s| DisplayIdentity::parse(s))
        .collect();
    if identities.is_empty() {
        anyhow::bail!("Refusing to replace the trusted set with nothing. Pass at least one serial.");
    }

    let set = sentinel.replace_trusted_identities(identities)?;
    println!(
        "Trusted identity set replaced: v{} ({} identities)",
        set.version(),
        set.len()
    );
    Ok(())
}
