use crate::amex::{normalize_error_code, MerchantRegistry, PartnerResponse};
use crate::db::{self, ItemClaim, ItemError, ItemResult, Pool};
use crate::model::{ItemAction, ItemStatus};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Default claim hold; matches the default queue lease.
pub const DEFAULT_CLAIM_HOLD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The item was not QUEUED; a duplicate or stale delivery.
    Skipped,
    /// Another delivery holds a live claim and is talking to the partner.
    InFlight,
    /// The item cannot be sent as stored and was set to ERROR.
    Rejected,
    Done,
    /// The partner reported an error.
    Error,
}

/// Worker-side handler for one `ProcessItem` task.
#[derive(Clone)]
pub struct ItemProcessor {
    store: Pool,
    registry: Arc<dyn MerchantRegistry>,
    claim_hold: Duration,
}

impl ItemProcessor {
    pub fn new(store: Pool, registry: Arc<dyn MerchantRegistry>) -> Self {
        Self {
            store,
            registry,
            claim_hold: DEFAULT_CLAIM_HOLD,
        }
    }

    /// How long a claim keeps other deliveries away from an item whose call
    /// has not finished. Should cover the longest partner call.
    pub fn with_claim_hold(mut self, hold: Duration) -> Self {
        self.claim_hold = hold;
        self
    }

    /// Send one item to the partner and record the answer.
    ///
    /// The item is claimed with a short committed write and no store lock is
    /// held during the partner call. The result is written only if the item is
    /// still QUEUED. A failed call releases the claim and returns `Err`,
    /// leaving the item QUEUED for the queue's retry policy.
    #[instrument(skip_all, fields(item_id = item_id))]
    pub async fn process(&self, item_id: i64) -> Result<ProcessOutcome> {
        let item = match db::claim_queued_item(&self.store, item_id, Utc::now(), self.claim_hold).await? {
            ItemClaim::Claimed(item) => item,
            ItemClaim::InFlight => {
                info!("item is claimed by another delivery");
                return Ok(ProcessOutcome::InFlight);
            }
            ItemClaim::NotQueued => {
                warn!("item is not queued; nothing to do");
                return Ok(ProcessOutcome::Skipped);
            }
        };

        let call = match (item.action(), item.start_date, item.end_date) {
            (Some(ItemAction::Add), Some(start), Some(end)) => {
                self.registry
                    .add_merchant(&item.mid, &item.merchant_slug, start, end)
                    .await
            }
            (Some(ItemAction::Delete), _, _) => {
                self.registry
                    .delete_merchant(&item.mid, &item.merchant_slug)
                    .await
            }
            _ => {
                warn!(action = %item.action_code, "item cannot be sent; marking as error");
                if !db::mark_item_rejected(&self.store, item_id, Utc::now()).await? {
                    warn!("item settled elsewhere before it was rejected");
                    return Ok(ProcessOutcome::Skipped);
                }
                return Ok(ProcessOutcome::Rejected);
            }
        };
        let submission = match call {
            Ok(submission) => submission,
            Err(err) => {
                if let Err(release_err) = db::release_item_claim(&self.store, item_id).await {
                    warn!(?release_err, "failed to release item claim");
                }
                return Err(err.into());
            }
        };

        let (status, error) = match &submission.response {
            PartnerResponse::Success { .. } => (ItemStatus::Done, None),
            PartnerResponse::Failure {
                code,
                kind,
                description,
                ..
            } => (
                ItemStatus::Error,
                Some(ItemError {
                    code: normalize_error_code(code),
                    kind: kind.clone(),
                    description: description.clone(),
                }),
            ),
        };
        let result = ItemResult {
            status,
            response: submission.response.raw().clone(),
            request_timestamp: submission.sent_at,
            error,
        };
        if !db::record_item_result(&self.store, item_id, &result, Utc::now()).await? {
            warn!(status = status.label(), "item settled elsewhere; result not recorded");
            return Ok(ProcessOutcome::Skipped);
        }

        info!(http_status = submission.status, status = status.label(), "item processed");
        Ok(match status {
            ItemStatus::Done => ProcessOutcome::Done,
            _ => ProcessOutcome::Error,
        })
    }
}
