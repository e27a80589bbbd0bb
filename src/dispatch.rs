use crate::db::{self, Pool};
use crate::model::ProcessItem;
use crate::queue::{RetryPolicy, TaskQueue};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Item ids that were handed to the queue, those the queue refused, and the
/// batches whose transaction failed and were rolled back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub queued: Vec<i64>,
    pub failed: Vec<i64>,
    pub failed_batches: Vec<i64>,
}

/// Moves PENDING items onto the work queue, one transaction per batch.
#[derive(Clone)]
pub struct Dispatcher {
    store: Pool,
    queue: Arc<dyn TaskQueue>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(store: Pool, queue: Arc<dyn TaskQueue>, retry: RetryPolicy) -> Self {
        Self {
            store,
            queue,
            retry,
        }
    }

    /// An item is marked QUEUED only if the queue accepted its task. Items
    /// whose enqueue failed stay PENDING and can be dispatched again. A batch
    /// whose store transaction fails is rolled back, reported in
    /// `failed_batches`, and the remaining batches are still dispatched.
    #[instrument(skip_all, fields(batches = batch_ids.len()))]
    pub async fn queue_batches(
        &self,
        batch_ids: &[i64],
        sender: Option<&str>,
    ) -> Result<DispatchOutcome> {
        let mut outcome = DispatchOutcome::default();
        for &batch_id in batch_ids {
            if let Err(err) = self.queue_batch(batch_id, sender, &mut outcome).await {
                error!(batch_id, ?err, "batch dispatch failed; items left PENDING");
                outcome.failed_batches.push(batch_id);
            }
        }
        info!(
            queued = outcome.queued.len(),
            failed = outcome.failed.len(),
            failed_batches = outcome.failed_batches.len(),
            "dispatch finished"
        );
        Ok(outcome)
    }

    async fn queue_batch(
        &self,
        batch_id: i64,
        sender: Option<&str>,
        outcome: &mut DispatchOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        // First write: holds the store lock until commit.
        if !db::stamp_batch_sent_tx(&mut tx, batch_id, sender, now).await? {
            warn!(batch_id, "batch not found; skipping");
            return Ok(());
        }

        let pending = db::pending_item_ids_tx(&mut tx, batch_id).await?;
        let mut queued = Vec::with_capacity(pending.len());
        for item_id in pending {
            match self.queue.enqueue(ProcessItem { item_id }, &self.retry).await {
                Ok(_) => queued.push(item_id),
                Err(err) => {
                    warn!(batch_id, item_id, %err, "failed to enqueue item");
                    outcome.failed.push(item_id);
                }
            }
        }

        db::mark_items_queued_tx(&mut tx, batch_id, &queued, now).await?;
        tx.commit().await?;
        outcome.queued.extend(queued);
        Ok(())
    }
}
