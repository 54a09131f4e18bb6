use super::model::{ControlPatch, ImagePage, ImageStats, Patch};
use crate::model::{pending_handle, ApiLimits, ControlRecord, ImageRecord, SyncStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

/// The existence check could not be answered; the item is neither present nor absent.
#[derive(Debug, Error)]
#[error("image lookup failed for {photo_id}: {source}")]
pub struct LookupError {
    pub photo_id: String,
    #[source]
    pub source: sqlx::Error,
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("connect to {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask for the file to be created. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Resume page for a run: one past the last fully processed page, or 1.
pub fn resolve_start_page(record: Option<&ControlRecord>) -> i64 {
    match record.and_then(|r| r.last_processed_page) {
        Some(page) if page >= 0 => page + 1,
        _ => 1,
    }
}

fn parse_json_column<T: serde::de::DeserializeOwned>(
    row: &SqliteRow,
    column: &str,
) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| serde_json::from_str(&s).with_context(|| format!("decode {column}")))
        .transpose()
}

fn control_from_row(row: &SqliteRow) -> Result<ControlRecord> {
    let status: Option<String> = row.try_get("last_known_status")?;
    Ok(ControlRecord {
        sync_type: row.try_get("sync_type")?,
        last_processed_page: row.try_get("last_processed_page")?,
        current_sync_page: row.try_get("current_sync_page")?,
        current_execution_arn: row.try_get("current_execution_arn")?,
        last_known_status: status
            .as_deref()
            .map(SyncStatus::parse)
            .unwrap_or(SyncStatus::Idle),
        api_limits: parse_json_column(row, "api_limits")?,
        last_run_stats: parse_json_column(row, "last_run_stats")?,
        last_sync_timestamp: row.try_get("last_sync_timestamp")?,
        last_updated_timestamp: row.try_get("last_updated_timestamp")?,
    })
}

#[instrument(skip_all, fields(sync_type = %sync_type))]
pub async fn get_sync_control(pool: &Pool, sync_type: &str) -> Result<Option<ControlRecord>> {
    let row = sqlx::query("SELECT * FROM sync_control WHERE sync_type = ?")
        .bind(sync_type)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(control_from_row).transpose()
}

fn push_patch<T>(qb: &mut QueryBuilder<'static, Sqlite>, column: &str, patch: &Patch<T>)
where
    T: Clone + Send + sqlx::Encode<'static, Sqlite> + sqlx::Type<Sqlite> + 'static,
{
    match patch {
        Patch::Unchanged => {}
        Patch::Set(value) => {
            qb.push(", ").push(column).push(" = ").push_bind(value.clone());
        }
        Patch::Remove => {
            qb.push(", ").push(column).push(" = NULL");
        }
    }
}

async fn ensure_row(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    sync_type: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_control (sync_type, last_updated_timestamp) VALUES (?, ?) \
         ON CONFLICT(sync_type) DO NOTHING",
    )
    .bind(sync_type)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Apply a partial update, creating the record if missing.
/// `last_updated_timestamp` is stamped even when the patch is empty.
#[instrument(skip_all, fields(sync_type = %sync_type))]
pub async fn update_sync_control(pool: &Pool, sync_type: &str, patch: &ControlPatch) -> Result<()> {
    let now = Utc::now();
    let status = patch.last_known_status.try_map(|s| Ok::<_, anyhow::Error>(s.as_str().to_string()))?;
    let api_limits = patch.api_limits.try_map(serde_json::to_string)?;
    let last_run_stats = patch.last_run_stats.try_map(serde_json::to_string)?;

    let mut qb: QueryBuilder<'static, Sqlite> =
        QueryBuilder::new("UPDATE sync_control SET last_updated_timestamp = ");
    qb.push_bind(now);
    push_patch(&mut qb, "last_processed_page", &patch.last_processed_page);
    push_patch(&mut qb, "current_sync_page", &patch.current_sync_page);
    push_patch(&mut qb, "current_execution_arn", &patch.current_execution_arn);
    push_patch(&mut qb, "last_known_status", &status);
    push_patch(&mut qb, "api_limits", &api_limits);
    push_patch(&mut qb, "last_run_stats", &last_run_stats);
    push_patch(&mut qb, "last_sync_timestamp", &patch.last_sync_timestamp);
    qb.push(" WHERE sync_type = ").push_bind(sync_type.to_string());

    let mut tx = pool.begin().await?;
    ensure_row(&mut tx, sync_type, now).await?;
    qb.build().execute(&mut *tx).await?;
    tx.commit().await?;
    debug!(?patch, "control record updated");
    Ok(())
}

/// Record progress on `page`. A complete page also advances the resume cursor,
/// which never moves backwards.
#[instrument(skip_all, fields(sync_type = %sync_type, page = page, complete = complete))]
pub async fn record_checkpoint(
    pool: &Pool,
    sync_type: &str,
    page: i64,
    api_limits: Option<&ApiLimits>,
    complete: bool,
) -> Result<()> {
    let now = Utc::now();
    let limits = api_limits.map(serde_json::to_string).transpose()?;

    let mut tx = pool.begin().await?;
    ensure_row(&mut tx, sync_type, now).await?;
    sqlx::query(
        "UPDATE sync_control SET \
           current_sync_page = ?, \
           last_sync_timestamp = ?, \
           last_updated_timestamp = ?, \
           api_limits = COALESCE(?, api_limits), \
           last_processed_page = CASE WHEN ? \
             THEN MAX(COALESCE(last_processed_page, 0), ?) \
             ELSE last_processed_page END \
         WHERE sync_type = ?",
    )
    .bind(page)
    .bind(now)
    .bind(now)
    .bind(limits)
    .bind(complete)
    .bind(page)
    .bind(sync_type)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Conditional write moving the record to RUNNING unless it is already
/// RUNNING or STOPPING. The winner's record carries a fresh pending handle
/// until the launched execution's handle replaces it; losers get `None`.
#[instrument(skip_all, fields(sync_type = %sync_type))]
pub async fn claim_for_start(pool: &Pool, sync_type: &str) -> Result<Option<String>> {
    let now = Utc::now();
    let marker = pending_handle();
    let mut tx = pool.begin().await?;
    ensure_row(&mut tx, sync_type, now).await?;
    let res = sqlx::query(
        "UPDATE sync_control SET last_known_status = 'RUNNING', current_execution_arn = ?, \
           last_updated_timestamp = ? \
         WHERE sync_type = ? \
           AND COALESCE(last_known_status, 'IDLE') NOT IN ('RUNNING', 'STOPPING')",
    )
    .bind(&marker)
    .bind(now)
    .bind(sync_type)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok((res.rows_affected() == 1).then_some(marker))
}

/// Move status and handle together, but only if the record still holds
/// `from`. Returns whether the write applied.
#[instrument(skip_all, fields(sync_type = %sync_type, to = %to.0))]
pub async fn transition_control(
    pool: &Pool,
    sync_type: &str,
    from: (SyncStatus, Option<&str>),
    to: (SyncStatus, Option<&str>),
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sync_control SET last_known_status = ?, current_execution_arn = ?, \
           last_updated_timestamp = ? \
         WHERE sync_type = ? \
           AND COALESCE(last_known_status, 'IDLE') = ? \
           AND current_execution_arn IS ?",
    )
    .bind(to.0.as_str())
    .bind(to.1)
    .bind(Utc::now())
    .bind(sync_type)
    .bind(from.0.as_str())
    .bind(from.1)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all, fields(photo_id = %photo_id))]
pub async fn image_exists(pool: &Pool, photo_id: &str) -> Result<bool, LookupError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM images WHERE photo_id = ?")
        .bind(photo_id)
        .fetch_optional(pool)
        .await
        .map_err(|source| LookupError {
            photo_id: photo_id.to_string(),
            source,
        })?;
    Ok(found.is_some())
}

fn image_from_row(row: &SqliteRow) -> Result<ImageRecord> {
    let payload: String = row.try_get("payload")?;
    Ok(ImageRecord {
        photo_id: row.try_get("photo_id")?,
        category: row.try_get("category")?,
        object_key: row.try_get("object_key")?,
        public_url: row.try_get("public_url")?,
        byte_size: row.try_get("byte_size")?,
        content_type: row.try_get("content_type")?,
        synced_at: row.try_get("synced_at")?,
        payload: serde_json::from_str(&payload).context("decode image payload")?,
    })
}

/// Idempotent overwrite of the metadata item.
#[instrument(skip_all, fields(photo_id = %image.photo_id))]
pub async fn put_image(pool: &Pool, image: &ImageRecord) -> Result<()> {
    let payload = serde_json::to_string(&image.payload)?;
    sqlx::query(
        "INSERT INTO images (photo_id, category, object_key, public_url, byte_size, content_type, synced_at, payload) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(photo_id) DO UPDATE SET \
           category = excluded.category, \
           object_key = excluded.object_key, \
           public_url = excluded.public_url, \
           byte_size = excluded.byte_size, \
           content_type = excluded.content_type, \
           synced_at = excluded.synced_at, \
           payload = excluded.payload",
    )
    .bind(&image.photo_id)
    .bind(&image.category)
    .bind(&image.object_key)
    .bind(&image.public_url)
    .bind(image.byte_size)
    .bind(&image.content_type)
    .bind(image.synced_at)
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(photo_id = %photo_id))]
pub async fn get_image(pool: &Pool, photo_id: &str) -> Result<Option<ImageRecord>> {
    let row = sqlx::query("SELECT * FROM images WHERE photo_id = ?")
        .bind(photo_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(image_from_row).transpose()
}

/// Key-ordered page of images after `after`. `last_key` is set only when more rows follow.
#[instrument(skip_all)]
pub async fn scan_images(pool: &Pool, after: Option<&str>, limit: u32) -> Result<ImagePage> {
    let limit = i64::from(limit.max(1));
    let rows = sqlx::query(
        "SELECT * FROM images WHERE (? IS NULL OR photo_id > ?) ORDER BY photo_id LIMIT ?",
    )
    .bind(after)
    .bind(after)
    .bind(limit + 1)
    .fetch_all(pool)
    .await?;

    let has_more = rows.len() as i64 > limit;
    let items = rows
        .iter()
        .take(limit as usize)
        .map(image_from_row)
        .collect::<Result<Vec<_>>>()?;
    let last_key = if has_more {
        items.last().map(|i| i.photo_id.clone())
    } else {
        None
    };
    Ok(ImagePage { items, last_key })
}

#[instrument(skip_all)]
pub async fn image_stats(pool: &Pool) -> Result<ImageStats> {
    let (count, total_bytes): (i64, i64) =
        sqlx::query_as("SELECT COUNT(*), COALESCE(SUM(byte_size), 0) FROM images")
            .fetch_one(pool)
            .await?;
    Ok(ImageStats { count, total_bytes })
}
