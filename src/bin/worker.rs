use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

use mid_onboard::config;
use mid_onboard::context::AppContext;
use mid_onboard::worker::run_next_job;

#[derive(Debug, Parser)]
#[command(author, version, about = "Process queued MID items until interrupted")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let ctx = AppContext::from_config(cfg).await?;
    let processor = ctx.processor();
    let lease = ctx.lease();
    let poll_sleep = ctx.poll_interval();

    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing current job");
            let _ = stop_tx.send(true);
        }
    });

    info!(queue = %ctx.queue.name(), "worker started");
    // A running job is never interrupted; the stop flag is checked between jobs.
    while !*stop_rx.borrow() {
        let idle = match run_next_job(&ctx.queue, &processor, lease).await {
            Ok(processed) => !processed,
            Err(err) => {
                error!(?err, "worker error");
                true
            }
        };
        if idle {
            tokio::select! {
                Ok(()) = stop_rx.changed() => {}
                _ = tokio::time::sleep(poll_sleep) => {}
            }
        }
    }
    info!("worker stopped");
    Ok(())
}
