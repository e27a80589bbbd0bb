use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::info;

use mid_onboard::config;
use mid_onboard::context::AppContext;
use mid_onboard::db::{self, ItemFilter};
use mid_onboard::export;
use mid_onboard::model::ItemStatus;
use mid_onboard::validate::{self, ImportOutcome};

#[derive(Debug, Parser)]
#[command(author, version, about = "Upload, dispatch and inspect MID onboarding batches")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a CSV file and import it as a new batch
    Upload { file: PathBuf },
    /// Queue every PENDING item of the given batches
    Queue {
        #[arg(required = true)]
        batch_ids: Vec<i64>,
        /// Operator recorded as the batch sender
        #[arg(long)]
        sender: Option<String>,
    },
    /// List batches, newest first
    Batches,
    /// List items
    Items {
        #[arg(long)]
        batch: Option<i64>,
        /// pending, queued, done or error
        #[arg(long, value_parser = parse_status)]
        status: Option<ItemStatus>,
    },
    /// Export a batch's items as CSV
    Export {
        batch_id: i64,
        /// Output file; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show how many jobs are waiting on the work queue
    QueueStatus,
    /// Drop every job on the work queue; their items stay QUEUED
    QueueClear,
}

fn parse_status(s: &str) -> Result<ItemStatus, String> {
    ItemStatus::parse_name(s).ok_or_else(|| format!("unknown status '{}'", s))
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
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

    match args.command {
        Command::Upload { file } => {
            let bytes = fs::read(&file).with_context(|| format!("failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match validate::import_batch(&ctx.store, &file_name, &bytes).await? {
                ImportOutcome::Imported { batch_id, rows } => {
                    println!("Batch imported (id {}, {} items)", batch_id, rows);
                }
                ImportOutcome::Rejected(errors) => {
                    eprint!("{}", errors);
                    std::process::exit(1);
                }
            }
        }
        Command::Queue { batch_ids, sender } => {
            let outcome = ctx
                .dispatcher()
                .queue_batches(&batch_ids, sender.as_deref())
                .await?;
            if outcome.queued.is_empty() {
                println!("No items queued. Perhaps none in the batch were PENDING");
            } else {
                println!("Queued {} items", outcome.queued.len());
            }
            if !outcome.failed.is_empty() {
                eprintln!(
                    "{} items were not queued due to a queue error",
                    outcome.failed.len()
                );
            }
            for batch_id in &outcome.failed_batches {
                eprintln!("Batch {} could not be dispatched; its items are still PENDING", batch_id);
            }
        }
        Command::Batches => {
            println!("id\tfile_name\tuploaded\tsender\tdate_sent\titems\tprocessed");
            for summary in db::list_batches(&ctx.store).await? {
                let b = &summary.batch;
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    b.id,
                    b.file_name,
                    b.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
                    fmt_opt(b.sender.as_deref()),
                    fmt_opt(b.date_sent.map(|d| d.format("%Y-%m-%d %H:%M:%S"))),
                    summary.item_count,
                    summary.processed()
                );
            }
        }
        Command::Items { batch, status } => {
            let filter = ItemFilter {
                batch_id: batch,
                status,
            };
            println!("id\tbatch\tmid\taction\tstatus\tmerchant_slug\terror_type");
            for item in db::list_items(&ctx.store, filter).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    item.id,
                    item.batch_id,
                    item.mid,
                    item.action().map(|a| a.label()).unwrap_or(item.action_code.as_str()),
                    item.status.label(),
                    item.merchant_slug,
                    fmt_opt(item.error_type.as_deref())
                );
            }
        }
        Command::Export { batch_id, out } => {
            let rows = match out {
                Some(path) => {
                    let file = fs::File::create(&path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    export::export_batch_csv(&ctx.store, batch_id, file).await?
                }
                None => export::export_batch_csv(&ctx.store, batch_id, io::stdout()).await?,
            };
            info!(batch_id, rows, "export written");
        }
        Command::QueueStatus => {
            println!("{}: {} jobs", ctx.queue.name(), ctx.queue.len().await?);
        }
        Command::QueueClear => {
            let removed = ctx.queue.clear().await?;
            println!("{}: removed {} jobs", ctx.queue.name(), removed);
        }
    }

    Ok(())
}
