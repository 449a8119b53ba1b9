//! CLI subcommand: `display-sentinel monitor`
//!
//! Runs one monitoring session and prints every observer event as a JSON
//! line. With `--replay` the hardware is driven by a JSONL script;
//! otherwise the session idles until Ctrl-C.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use display_sentinel::concurrency::FileLock;
use display_sentinel::config::Config;
use display_sentinel::display::{ReplayScript, SimulatedDisplays};

#[derive(Args)]
pub struct MonitorArgs {
    /// Drive the monitor from a JSONL notification script
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Keep running after the replay finishes
    #[arg(long, requires = "replay")]
    pub follow: bool,
}

pub async fn run(args: MonitorArgs) -> Result<()> {
    let config = Config::load()?;

    let lock = FileLock::new(config.paths.monitor_lock())?;
    let Some(_session_lock) = lock.try_acquire()? else {
        anyhow::bail!(
            "Another monitor is already running (lock: {})",
            lock.path().display()
        );
    };

    let script = args
        .replay
        .as_deref()
        .map(ReplayScript::load)
        .transpose()?;

    let displays = Arc::new(SimulatedDisplays::new());
    if let Some(script) = &script {
        script.seed(&displays);
    }

    let sentinel = super::build_sentinel(config, displays.clone())?;
    let mut events = sentinel.monitor().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(RecvError::Lagged(n)) => warn!("Event printer fell behind, skipped {}", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let refresh = sentinel.start().await?;
    match refresh.await {
        Ok(state) => info!("Screen capture authorization: {}", state),
        Err(e) => warn!("Authorization refresh failed: {}", e),
    }

    match &script {
        Some(script) => {
            let delivered = script.play(&displays).await;
            sentinel.monitor().sync().await?;
            info!("Replayed {} notification(s)", delivered);
            if args.follow {
                wait_for_ctrl_c().await?;
            }
        }
        None => wait_for_ctrl_c().await?,
    }

    sentinel.shutdown().await;
    // Dropping the last publisher closes the stream once it is drained.
    drop(sentinel);
    printer.await.context("Event printer failed")?;
    Ok(())
}

async fn wait_for_ctrl_c() -> Result<()> {
    info!("Monitoring; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
