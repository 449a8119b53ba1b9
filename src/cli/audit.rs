//! CLI subcommand: `display-sentinel audit`

use anyhow::Result;
use clap::{Args, Subcommand};
use std::sync::Arc;

use display_sentinel::config::Config;
use display_sentinel::security::{
    AuditDecision, DeviceKeyFile, EventSigner, read_audit_file, verify_audit_file,
};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Show audit log entries
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Filter by decision (e.g., invalid_serial, user_denied)
        #[arg(long)]
        filter: Option<AuditDecision>,

        /// Only the last N entries
        #[arg(short = 'n', long)]
        last: Option<usize>,
    },

    /// Verify every entry's signature
    Verify,
}

pub async fn run(args: AuditArgs) -> Result<()> {
    match args.command {
        AuditCommands::Show { json, filter, last } => show_audit(json, filter, last),
        AuditCommands::Verify => verify_audit(),
    }
}

fn signer(config: &Config) -> EventSigner {
    EventSigner::new(Arc::new(DeviceKeyFile::new(config.paths.device_key())))
}

fn show_audit(json_output: bool, filter: Option<AuditDecision>, last: Option<usize>) -> Result<()> {
    let config = Config::load()?;
    let path = config.paths.audit_log();
    let signer = signer(&config);

    let mut entries: Vec<_> = read_audit_file(&path)?.entries.into_iter().enumerate().collect();

    if let Some(decision) = filter {
        entries.retain(|(_, e)| e.decision == decision);
    }
    if let Some(n) = last {
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
    }

    if entries.is_empty() {
        if filter.is_some() {
            println!("No audit log entries matching filter.");
        } else {
            println!("No audit log entries.");
        }
        return Ok(());
    }

    if json_output {
        let only: Vec<_> = entries.iter().map(|(_, e)| e).collect();
        println!("{}", serde_json::to_string_pretty(&only)?);
        return Ok(());
    }

    println!("Security Audit Log ({} entries):", entries.len());
    println!();
    for (i, entry) in &entries {
        let status = if !entry.signature.is_signed() {
            " [UNSIGNED]"
        } else if !signer.verify_event(entry) {
            " [SIGNATURE INVALID]"
        } else {
            ""
        };
        let subject = entry
            .subject
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let context = entry
            .context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "  #{:<4} {} {:<26} {:<12} actor={} {}{}",
            i,
            entry.ts.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.decision.as_str(),
            subject,
            entry.actor,
            context,
            status
        );
    }

    Ok(())
}

fn verify_audit() -> Result<()> {
    let config = Config::load()?;
    let path = config.paths.audit_log();
    let report = verify_audit_file(&path, &signer(&config))?;

    println!("Audit log: {}", path.display());
    println!("  Entries:       {}", report.total);
    println!("  Valid:         {}", report.valid);
    println!("  Unsigned:      {}", report.unsigned.len());
    println!("  Invalid:       {}", report.invalid.len());
    println!("  Corrupt lines: {}", report.corrupt_lines);

    for i in &report.invalid {
        println!("  - entry #{} fails signature verification", i);
    }

    if report.is_intact() {
        println!("Integrity: INTACT");
        Ok(())
    } else {
        anyhow::bail!("Integrity: BROKEN")
    }
}
