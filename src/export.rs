//! CSV export of a batch's items for operators.

use crate::db::{self, ItemFilter, Pool};
use crate::model::Item;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::io::Write;
use tracing::instrument;

pub const EXPORT_COLUMNS: [&str; 13] = [
    "batch_file_name",
    "mid",
    "start_date",
    "end_date",
    "merchant_slug",
    "provider_slug",
    "status",
    "action",
    "created",
    "updated",
    "error_code",
    "error_type",
    "error_description",
];

const DATETIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

fn fmt_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn fmt_datetime(at: DateTime<Utc>) -> String {
    at.format(DATETIME_FORMAT).to_string()
}

fn export_row(file_name: &str, item: &Item) -> [String; 13] {
    let action = item
        .action()
        .map(|a| a.label().to_string())
        .unwrap_or_else(|| item.action_code.clone());
    [
        file_name.to_string(),
        item.mid.clone(),
        fmt_date(item.start_date),
        fmt_date(item.end_date),
        item.merchant_slug.clone(),
        item.provider_slug.clone(),
        item.status.label().to_string(),
        action,
        fmt_datetime(item.created_at),
        fmt_datetime(item.updated_at),
        item.error_code.clone().unwrap_or_default(),
        item.error_type.clone().unwrap_or_default(),
        item.error_description.clone().unwrap_or_default(),
    ]
}

/// Write every item of a batch as CSV. Returns the number of rows written.
#[instrument(skip_all, fields(batch_id = batch_id))]
pub async fn export_batch_csv<W: Write>(pool: &Pool, batch_id: i64, writer: W) -> Result<usize> {
    let batch = db::fetch_batch(pool, batch_id)
        .await?
        .ok_or_else(|| anyhow!("batch {} not found", batch_id))?;
    let items = db::list_items(
        pool,
        ItemFilter {
            batch_id: Some(batch_id),
            status: None,
        },
    )
    .await?;

    let mut out = csv::Writer::from_writer(writer);
    out.write_record(EXPORT_COLUMNS)?;
    for item in &items {
        out.write_record(export_row(&batch.file_name, item))?;
    }
    out.flush()?;
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ItemError, ItemResult};
    use crate::model::{ItemAction, ItemStatus, NewItem};
    use chrono::TimeZone;
    use serde_json::json;
    use sqlx::SqlitePool;

    #[tokio::test]
    async fn renders_labels_and_formats() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let rows = [
            NewItem {
                mid: "4548436161".into(),
                action: ItemAction::Add,
                start_date: NaiveDate::from_ymd_opt(2021, 1, 1),
                end_date: NaiveDate::from_ymd_opt(2999, 12, 31),
                merchant_slug: "bink_test_merchant".into(),
                provider_slug: "amex".into(),
            },
            NewItem {
                mid: "123".into(),
                action: ItemAction::Delete,
                start_date: None,
                end_date: None,
                merchant_slug: "wasabi-club".into(),
                provider_slug: "amex".into(),
            },
        ];
        let batch_id = db::create_batch_with_items(&pool, "mids.csv", &rows).await.unwrap();
        let items = db::list_items(&pool, ItemFilter::default()).await.unwrap();

        let sent = Utc.with_ymd_and_hms(2021, 2, 13, 12, 14, 42).unwrap();
        let mut tx = pool.begin().await.unwrap();
        db::mark_items_queued_tx(&mut tx, batch_id, &[items[1].id], sent)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        db::record_item_result(
            &pool,
            items[1].id,
            &ItemResult {
                status: ItemStatus::Error,
                response: json!({"error_code": "1040012"}),
                request_timestamp: sent,
                error: Some(ItemError {
                    code: "1040012".into(),
                    kind: "Invalid request".into(),
                    description: "Merchant ID already registered, updated, or deleted.".into(),
                }),
            },
            sent,
        )
        .await
        .unwrap();

        let mut buf = Vec::new();
        let written = export_batch_csv(&pool, batch_id, &mut buf).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], EXPORT_COLUMNS.join(","));
        assert!(lines[1].starts_with("mids.csv,4548436161,2021-01-01,2999-12-31,bink_test_merchant,amex,Pending,Add,"));
        assert!(lines[1].ends_with(",,,"));
        assert!(lines[2].starts_with("mids.csv,123,,,wasabi-club,amex,Error,Delete,"));
        assert!(lines[2].contains(",13/02/2021 12:14:42,1040012,Invalid request,"));
        assert!(lines[2].ends_with("\"Merchant ID already registered, updated, or deleted.\""));
    }

    #[tokio::test]
    async fn unknown_batch_is_an_error() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        assert!(export_batch_csv(&pool, 1, Vec::new()).await.is_err());
    }
}
