use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Processing status of a batch item. Stored as an integer column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ItemStatus {
    Pending,
    Queued,
    Done,
    Error,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Queued,
        ItemStatus::Done,
        ItemStatus::Error,
    ];

    pub fn code(&self) -> i64 {
        match self {
            ItemStatus::Pending => 1,
            ItemStatus::Queued => 2,
            ItemStatus::Done => 3,
            ItemStatus::Error => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ItemStatus::Pending),
            2 => Some(ItemStatus::Queued),
            3 => Some(ItemStatus::Done),
            4 => Some(ItemStatus::Error),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "Pending",
            ItemStatus::Queued => "Queued",
            ItemStatus::Done => "Done",
            ItemStatus::Error => "Error",
        }
    }

    /// Parse a status name as typed by an operator (`pending`, `QUEUED`, ...).
    pub fn parse_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.label().eq_ignore_ascii_case(name.trim()))
    }
}

/// Requested merchant action. `Update` exists in the stored domain but no
/// upload can produce it and the processor rejects it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ItemAction {
    Add,
    Delete,
    Update,
}

impl ItemAction {
    pub fn code(&self) -> &'static str {
        match self {
            ItemAction::Add => "A",
            ItemAction::Delete => "D",
            ItemAction::Update => "U",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(ItemAction::Add),
            "D" => Some(ItemAction::Delete),
            "U" => Some(ItemAction::Update),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ItemAction::Add => "Add",
            ItemAction::Delete => "Delete",
            ItemAction::Update => "Update",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub file_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub sender: Option<String>,
    pub date_sent: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub batch_id: i64,
    pub mid: String,
    /// Raw action code as stored; see [`Item::action`].
    pub action_code: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub merchant_slug: String,
    pub provider_slug: String,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request_timestamp: Option<DateTime<Utc>>,
    pub response: Option<Value>,
    pub error_code: Option<String>,
    pub error_type: Option<String>,
    pub error_description: Option<String>,
}

impl Item {
    pub fn action(&self) -> Option<ItemAction> {
        ItemAction::from_code(&self.action_code)
    }
}

/// A validated upload row, ready to be inserted as a PENDING item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub mid: String,
    pub action: ItemAction,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub merchant_slug: String,
    pub provider_slug: String,
}

/// The unit of work carried by the task queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessItem {
    pub item_id: i64,
}
