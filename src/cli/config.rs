//! CLI subcommand: `display-sentinel config`
//!
//! Edits go through [`Config::update`], so a value the services would
//! refuse at startup is never written. The trusted allow-list is not
//! editable here; it lives in secure storage and is changed with
//! `display-sentinel identities replace`.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use display_sentinel::config::{Config, MANAGED_KEYS};
use display_sentinel::paths::Paths;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Print one value (e.g. identity.fallback)
    Get { key: String },

    /// Change one value and save (e.g. identity.fallback fail_closed)
    Set { key: String, value: String },

    /// Print the config file location
    Path,

    /// Write the commented default config
    Init {
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommands::Show { json } => {
            let config = Config::load()?;
            let rendered = if json {
                serde_json::to_string_pretty(&config)?
            } else {
                toml::to_string_pretty(&config)?
            };
            println!("{}", rendered);
            for (key, owner) in MANAGED_KEYS {
                println!("# {} seeds the store only; see `{}`", key, owner);
            }
            Ok(())
        }
        ConfigCommands::Get { key } => {
            println!("{}", Config::load()?.get_value(&key)?);
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            let mut config = Config::load()?;
            let previous = config.update(&key, &value)?;
            config.save()?;
            println!("{}: {} -> {}", key, previous, config.get_value(&key)?);
            Ok(())
        }
        ConfigCommands::Path => {
            println!("{}", Config::config_path()?.display());
            Ok(())
        }
        ConfigCommands::Init { force } => init(force),
    }
}

fn init(force: bool) -> Result<()> {
    let paths = Paths::resolve()?;
    let path = paths.config_file();
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite.",
            path.display()
        );
    }

    paths.ensure_dirs().context("Failed to create sentinel directories")?;
    Config {
        paths,
        ..Config::default()
    }
    .save_with_template()
}
