use crate::processor::{ItemProcessor, ProcessOutcome};
use crate::queue::SqliteTaskQueue;
use anyhow::Result;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Claim one due job and run it. Returns false when the queue had nothing due.
#[instrument(skip_all)]
pub async fn run_next_job(
    queue: &SqliteTaskQueue,
    processor: &ItemProcessor,
    lease: Duration,
) -> Result<bool> {
    let Some(job) = queue.claim_next(lease).await? else {
        return Ok(false);
    };
    let item_id = job.task.item_id;
    match processor.process(item_id).await {
        // The job stays leased; it comes back once the lease lapses, by which
        // time the other delivery has finished or its claim has lapsed too.
        Ok(ProcessOutcome::InFlight) => {
            info!(job_id = job.id, item_id, "item in flight elsewhere; leaving job leased");
        }
        Ok(outcome) => {
            queue.complete(&job).await?;
            info!(job_id = job.id, item_id, ?outcome, "job finished");
        }
        Err(err) => {
            warn!(
                ?err,
                job_id = job.id,
                item_id,
                attempt = job.attempt,
                "job failed"
            );
            queue.fail(&job).await?;
        }
    }
    Ok(true)
}
