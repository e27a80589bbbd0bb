use super::model::{BatchSummary, ItemClaim, ItemFilter, ItemResult};
use crate::model::{Batch, Item, ItemStatus, NewItem};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'c> = Transaction<'c, Sqlite>;

/// SQLite caps bound parameters per statement; stay well below it.
const BIND_CHUNK: usize = 500;

const ITEM_COLUMNS: &str = "id, batch_id, mid, action, start_date, end_date, merchant_slug, \
     provider_slug, status, created_at, updated_at, request_timestamp, response, error_code, \
     error_type, error_description";

pub async fn init_pool(database_url: &str, busy_timeout: Duration) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability, applied to every pooled connection.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations/store").run(pool).await?;
    Ok(())
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    Ok(Batch {
        id: row.try_get("id")?,
        file_name: row.try_get("file_name")?,
        uploaded_at: row.try_get("uploaded_at")?,
        sender: row.try_get("sender")?,
        date_sent: row.try_get("date_sent")?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let id: i64 = row.try_get("id")?;
    let status_code: i64 = row.try_get("status")?;
    let status = ItemStatus::from_code(status_code)
        .ok_or_else(|| anyhow!("item {} has unknown status {}", id, status_code))?;
    let response = row
        .try_get::<Option<String>, _>("response")?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .with_context(|| format!("item {} has a malformed stored response", id))?;

    Ok(Item {
        id,
        batch_id: row.try_get("batch_id")?,
        mid: row.try_get("mid")?,
        action_code: row.try_get("action")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        merchant_slug: row.try_get("merchant_slug")?,
        provider_slug: row.try_get("provider_slug")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        request_timestamp: row.try_get("request_timestamp")?,
        response,
        error_code: row.try_get("error_code")?,
        error_type: row.try_get("error_type")?,
        error_description: row.try_get("error_description")?,
    })
}

/// Persist a batch and all of its rows as PENDING items in one transaction.
#[instrument(skip_all, fields(file_name = %file_name, rows = items.len()))]
pub async fn create_batch_with_items(
    pool: &Pool,
    file_name: &str,
    items: &[NewItem],
) -> Result<i64> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let batch_id: i64 =
        sqlx::query("INSERT INTO batches (file_name, uploaded_at) VALUES (?, ?) RETURNING id")
            .bind(file_name)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?
            .get("id");

    for chunk in items.chunks(BIND_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO batch_items (batch_id, mid, action, start_date, end_date, \
             merchant_slug, provider_slug, status, created_at, updated_at) ",
        );
        qb.push_values(chunk, |mut row, item| {
            row.push_bind(batch_id)
                .push_bind(item.mid.clone())
                .push_bind(item.action.code())
                .push_bind(item.start_date)
                .push_bind(item.end_date)
                .push_bind(item.merchant_slug.clone())
                .push_bind(item.provider_slug.clone())
                .push_bind(ItemStatus::Pending.code())
                .push_bind(now)
                .push_bind(now);
        });
        qb.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;
    Ok(batch_id)
}

#[instrument(skip_all)]
pub async fn fetch_batch(pool: &Pool, batch_id: i64) -> Result<Option<Batch>> {
    let row = sqlx::query(
        "SELECT id, file_name, uploaded_at, sender, date_sent FROM batches WHERE id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(batch_from_row).transpose()
}

/// All batches, newest upload first, with item counts.
#[instrument(skip_all)]
pub async fn list_batches(pool: &Pool) -> Result<Vec<BatchSummary>> {
    let rows = sqlx::query(
        "SELECT b.id, b.file_name, b.uploaded_at, b.sender, b.date_sent, \
                COUNT(i.id) AS item_count, \
                COALESCE(SUM(CASE WHEN i.status IN (?, ?) THEN 1 ELSE 0 END), 0) AS open_count \
         FROM batches b \
         LEFT JOIN batch_items i ON i.batch_id = b.id \
         GROUP BY b.id \
         ORDER BY b.uploaded_at DESC, b.id DESC",
    )
    .bind(ItemStatus::Pending.code())
    .bind(ItemStatus::Queued.code())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(BatchSummary {
                batch: batch_from_row(row)?,
                item_count: row.try_get("item_count")?,
                open_count: row.try_get("open_count")?,
            })
        })
        .collect()
}

/// A batch is processed once none of its items is PENDING or QUEUED.
#[instrument(skip_all)]
pub async fn batch_processed(pool: &Pool, batch_id: i64) -> Result<bool> {
    let open: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM batch_items WHERE batch_id = ? AND status IN (?, ?)",
    )
    .bind(batch_id)
    .bind(ItemStatus::Pending.code())
    .bind(ItemStatus::Queued.code())
    .fetch_one(pool)
    .await?;
    Ok(open == 0)
}

#[instrument(skip_all)]
pub async fn fetch_item(pool: &Pool, item_id: i64) -> Result<Option<Item>> {
    let sql = format!("SELECT {} FROM batch_items WHERE id = ?", ITEM_COLUMNS);
    let row = sqlx::query(&sql).bind(item_id).fetch_optional(pool).await?;
    row.as_ref().map(item_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_items(pool: &Pool, filter: ItemFilter) -> Result<Vec<Item>> {
    let sql = format!("SELECT {} FROM batch_items WHERE 1 = 1", ITEM_COLUMNS);
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(sql);
    if let Some(batch_id) = filter.batch_id {
        qb.push(" AND batch_id = ").push_bind(batch_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.code());
    }
    qb.push(" ORDER BY id ASC");
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(item_from_row).collect()
}

/// Stamp dispatch metadata on a batch. Being the first write of the dispatch
/// transaction, it also takes the database write lock for the rest of it.
/// Returns false when the batch does not exist.
#[instrument(skip_all)]
pub async fn stamp_batch_sent_tx(
    tx: &mut Tx<'_>,
    batch_id: i64,
    sender: Option<&str>,
    sent_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query("UPDATE batches SET sender = COALESCE(?, sender), date_sent = ? WHERE id = ?")
        .bind(sender)
        .bind(sent_at)
        .bind(batch_id)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn pending_item_ids_tx(tx: &mut Tx<'_>, batch_id: i64) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM batch_items WHERE batch_id = ? AND status = ? ORDER BY id ASC",
    )
    .bind(batch_id)
    .bind(ItemStatus::Pending.code())
    .fetch_all(&mut **tx)
    .await?;
    Ok(ids)
}

/// Move the given PENDING items of a batch to QUEUED. Returns rows updated.
#[instrument(skip_all, fields(batch_id = batch_id, count = item_ids.len()))]
pub async fn mark_items_queued_tx(
    tx: &mut Tx<'_>,
    batch_id: i64,
    item_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<u64> {
    let mut updated = 0;
    for chunk in item_ids.chunks(BIND_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE batch_items SET status = ");
        qb.push_bind(ItemStatus::Queued.code())
            .push(", updated_at = ")
            .push_bind(now)
            .push(" WHERE batch_id = ")
            .push_bind(batch_id)
            .push(" AND status = ")
            .push_bind(ItemStatus::Pending.code())
            .push(" AND id IN (");
        let mut ids = qb.separated(", ");
        for id in chunk {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        updated += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(updated)
}

/// Take a per-item claim on a QUEUED item for `hold`.
///
/// The claim is a single committed statement, so no lock is held while the
/// caller talks to the partner. A second caller is refused until the claim is
/// released or `hold` has passed.
#[instrument(skip_all, fields(item_id = item_id))]
pub async fn claim_queued_item(
    pool: &Pool,
    item_id: i64,
    now: DateTime<Utc>,
    hold: Duration,
) -> Result<ItemClaim> {
    let now_ms = now.timestamp_millis();
    let hold_ms = i64::try_from(hold.as_millis()).unwrap_or(i64::MAX);
    let sql = format!(
        "UPDATE batch_items SET claimed_until = ?, updated_at = ? \
         WHERE id = ? AND status = ? AND (claimed_until IS NULL OR claimed_until <= ?) \
         RETURNING {}",
        ITEM_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(now_ms.saturating_add(hold_ms))
        .bind(now)
        .bind(item_id)
        .bind(ItemStatus::Queued.code())
        .bind(now_ms)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = row {
        return Ok(ItemClaim::Claimed(item_from_row(&row)?));
    }

    let status: Option<i64> = sqlx::query_scalar("SELECT status FROM batch_items WHERE id = ?")
        .bind(item_id)
        .fetch_optional(pool)
        .await?;
    Ok(match status {
        Some(code) if code == ItemStatus::Queued.code() => ItemClaim::InFlight,
        _ => ItemClaim::NotQueued,
    })
}

/// Drop a claim without changing the item, so a retry can take it again.
#[instrument(skip_all, fields(item_id = item_id))]
pub async fn release_item_claim(pool: &Pool, item_id: i64) -> Result<()> {
    sqlx::query("UPDATE batch_items SET claimed_until = NULL WHERE id = ? AND status = ?")
        .bind(item_id)
        .bind(ItemStatus::Queued.code())
        .execute(pool)
        .await
        .context("failed to release item claim")?;
    Ok(())
}

/// Set ERROR without touching any other processing field. Returns false if
/// the item was no longer QUEUED.
#[instrument(skip_all, fields(item_id = item_id))]
pub async fn mark_item_rejected(pool: &Pool, item_id: i64, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE batch_items SET status = ?, updated_at = ?, claimed_until = NULL \
         WHERE id = ? AND status = ?",
    )
    .bind(ItemStatus::Error.code())
    .bind(now)
    .bind(item_id)
    .bind(ItemStatus::Queued.code())
    .execute(pool)
    .await
    .context("failed to persist rejected item")?;
    Ok(res.rows_affected() == 1)
}

/// Persist the outcome of a signed call: status, response, request timestamp
/// and, only when present, the error fields. Only a QUEUED item is written;
/// returns false when another delivery already settled it.
#[instrument(skip_all, fields(item_id = item_id))]
pub async fn record_item_result(
    pool: &Pool,
    item_id: i64,
    result: &ItemResult,
    now: DateTime<Utc>,
) -> Result<bool> {
    let response = serde_json::to_string(&result.response)?;
    let res = match &result.error {
        Some(err) => {
            sqlx::query(
                "UPDATE batch_items SET status = ?, response = ?, request_timestamp = ?, \
                 error_code = ?, error_type = ?, error_description = ?, updated_at = ?, \
                 claimed_until = NULL WHERE id = ? AND status = ?",
            )
            .bind(result.status.code())
            .bind(response)
            .bind(result.request_timestamp)
            .bind(&err.code)
            .bind(&err.kind)
            .bind(&err.description)
            .bind(now)
            .bind(item_id)
            .bind(ItemStatus::Queued.code())
            .execute(pool)
            .await
        }
        None => {
            sqlx::query(
                "UPDATE batch_items SET status = ?, response = ?, request_timestamp = ?, \
                 updated_at = ?, claimed_until = NULL WHERE id = ? AND status = ?",
            )
            .bind(result.status.code())
            .bind(response)
            .bind(result.request_timestamp)
            .bind(now)
            .bind(item_id)
            .bind(ItemStatus::Queued.code())
            .execute(pool)
            .await
        }
    }
    .context("failed to persist item result")?;
    Ok(res.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemAction;
    use chrono::NaiveDate;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn add_row(mid: &str) -> NewItem {
        NewItem {
            mid: mid.into(),
            action: ItemAction::Add,
            start_date: NaiveDate::from_ymd_opt(2021, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2999, 12, 31),
            merchant_slug: "bink_test_merchant".into(),
            provider_slug: "amex".into(),
        }
    }

    #[test]
    fn prepare_url_passes_memory_and_other_schemes() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_url_normalizes_file_paths() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("store.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let normalized = prepare_sqlite_url(&url);
        assert_eq!(normalized, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn create_batch_persists_pending_items() {
        let pool = setup_pool().await;
        let batch_id = create_batch_with_items(&pool, "mids.csv", &[add_row("1"), add_row("2")])
            .await
            .unwrap();

        let batch = fetch_batch(&pool, batch_id).await.unwrap().unwrap();
        assert_eq!(batch.file_name, "mids.csv");
        assert!(batch.sender.is_none());
        assert!(batch.date_sent.is_none());

        let items = list_items(
            &pool,
            ItemFilter {
                batch_id: Some(batch_id),
                status: Some(ItemStatus::Pending),
            },
        )
        .await
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].mid, "1");
        assert_eq!(items[0].action(), Some(ItemAction::Add));
        assert_eq!(items[0].start_date, NaiveDate::from_ymd_opt(2021, 1, 1));
        assert!(items[0].response.is_none());
        assert!(!batch_processed(&pool, batch_id).await.unwrap());
    }

    #[tokio::test]
    async fn queued_marking_only_moves_pending_rows() {
        let pool = setup_pool().await;
        let batch_id = create_batch_with_items(&pool, "mids.csv", &[add_row("1"), add_row("2")])
            .await
            .unwrap();

        let mut tx = pool.begin().await.unwrap();
        assert!(stamp_batch_sent_tx(&mut tx, batch_id, Some("ops@example.com"), Utc::now())
            .await
            .unwrap());
        let ids = pending_item_ids_tx(&mut tx, batch_id).await.unwrap();
        assert_eq!(ids.len(), 2);
        let updated = mark_items_queued_tx(&mut tx, batch_id, &ids[..1], Utc::now())
            .await
            .unwrap();
        assert_eq!(updated, 1);
        tx.commit().await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        // Already QUEUED rows are not touched a second time.
        let updated = mark_items_queued_tx(&mut tx, batch_id, &ids, Utc::now())
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert!(pending_item_ids_tx(&mut tx, batch_id).await.unwrap().is_empty());
        tx.commit().await.unwrap();

        let batch = fetch_batch(&pool, batch_id).await.unwrap().unwrap();
        assert_eq!(batch.sender.as_deref(), Some("ops@example.com"));
        assert!(batch.date_sent.is_some());
    }

    #[tokio::test]
    async fn stamp_reports_missing_batch() {
        let pool = setup_pool().await;
        let mut tx = pool.begin().await.unwrap();
        assert!(!stamp_batch_sent_tx(&mut tx, 404, None, Utc::now()).await.unwrap());
    }

    async fn queued_item(pool: &Pool) -> i64 {
        let batch_id = create_batch_with_items(pool, "mids.csv", &[add_row("1")])
            .await
            .unwrap();
        let item_id = list_items(pool, ItemFilter::default()).await.unwrap()[0].id;
        let mut tx = pool.begin().await.unwrap();
        mark_items_queued_tx(&mut tx, batch_id, &[item_id], Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        item_id
    }

    #[tokio::test]
    async fn claim_requires_queued_status() {
        let pool = setup_pool().await;
        create_batch_with_items(&pool, "mids.csv", &[add_row("1")])
            .await
            .unwrap();
        let item_id = list_items(&pool, ItemFilter::default()).await.unwrap()[0].id;
        let hold = Duration::from_secs(60);

        let claim = claim_queued_item(&pool, item_id, Utc::now(), hold).await.unwrap();
        assert!(matches!(claim, ItemClaim::NotQueued));
        let claim = claim_queued_item(&pool, 404, Utc::now(), hold).await.unwrap();
        assert!(matches!(claim, ItemClaim::NotQueued));
    }

    #[tokio::test]
    async fn live_claim_refuses_a_second_caller_until_it_lapses() {
        let pool = setup_pool().await;
        let item_id = queued_item(&pool).await;
        let hold = Duration::from_secs(60);
        let now = Utc::now();

        match claim_queued_item(&pool, item_id, now, hold).await.unwrap() {
            ItemClaim::Claimed(item) => assert_eq!(item.status, ItemStatus::Queued),
            other => panic!("expected a claim, got {:?}", other),
        }
        let again = claim_queued_item(&pool, item_id, now, hold).await.unwrap();
        assert!(matches!(again, ItemClaim::InFlight));

        let later = now + chrono::Duration::seconds(61);
        let lapsed = claim_queued_item(&pool, item_id, later, hold).await.unwrap();
        assert!(matches!(lapsed, ItemClaim::Claimed(_)));
    }

    #[tokio::test]
    async fn released_claim_can_be_taken_again() {
        let pool = setup_pool().await;
        let item_id = queued_item(&pool).await;
        let hold = Duration::from_secs(60);

        claim_queued_item(&pool, item_id, Utc::now(), hold).await.unwrap();
        release_item_claim(&pool, item_id).await.unwrap();
        let claim = claim_queued_item(&pool, item_id, Utc::now(), hold).await.unwrap();
        assert!(matches!(claim, ItemClaim::Claimed(_)));
    }

    #[tokio::test]
    async fn result_is_written_once() {
        let pool = setup_pool().await;
        let item_id = queued_item(&pool).await;
        let result = ItemResult {
            status: ItemStatus::Done,
            response: serde_json::json!({"status": "ok"}),
            request_timestamp: Utc::now(),
            error: None,
        };

        assert!(record_item_result(&pool, item_id, &result, Utc::now()).await.unwrap());
        assert!(!record_item_result(&pool, item_id, &result, Utc::now()).await.unwrap());
        assert!(!mark_item_rejected(&pool, item_id, Utc::now()).await.unwrap());
        let item = fetch_item(&pool, item_id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Done);
    }

    #[tokio::test]
    async fn list_batches_derives_processed_flag() {
        let pool = setup_pool().await;
        let empty = create_batch_with_items(&pool, "empty.csv", &[]).await.unwrap();
        let open = create_batch_with_items(&pool, "open.csv", &[add_row("1")])
            .await
            .unwrap();

        let batches = list_batches(&pool).await.unwrap();
        assert_eq!(batches.len(), 2);
        let by_id = |id: i64| batches.iter().find(|b| b.batch.id == id).unwrap();
        assert!(by_id(empty).processed());
        assert_eq!(by_id(open).item_count, 1);
        assert!(!by_id(open).processed());
    }
}
