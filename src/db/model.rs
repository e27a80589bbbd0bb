//! View models and write payloads used by the repository.
//!
//! Keep these focused on what queries return or persist. Business rules live in
//! the dispatcher and processor.

use crate::model::{Batch, Item, ItemStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Batch listing row with counts and the derived `processed` flag.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch: Batch,
    pub item_count: i64,
    /// Items still PENDING or QUEUED.
    pub open_count: i64,
}

impl BatchSummary {
    pub fn processed(&self) -> bool {
        self.open_count == 0
    }
}

/// Result of trying to claim an item for a partner call.
#[derive(Debug, Clone)]
pub enum ItemClaim {
    Claimed(Item),
    /// Still QUEUED, but another delivery holds a live claim.
    InFlight,
    /// Missing, or already past QUEUED.
    NotQueued,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ItemFilter {
    pub batch_id: Option<i64>,
    pub status: Option<ItemStatus>,
}

/// Partner-reported error copied onto an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub code: String,
    pub kind: String,
    pub description: String,
}

/// Fields written back once a signed call has completed.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub status: ItemStatus,
    pub response: Value,
    pub request_timestamp: DateTime<Utc>,
    pub error: Option<ItemError>,
}
