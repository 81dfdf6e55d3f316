use anyhow::Context;
use chrono::{DateTime, Utc};
use models::{BucketConfig, BucketDescriptor, ReindexActive};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::triggers::{Trigger, TriggerRegistry};

// Every JSON-ish column is stored as serialized JSON text.
const CREATE_BUCKETS_CONFIG: &str = "\
CREATE TABLE IF NOT EXISTS buckets_config (
    name TEXT PRIMARY KEY,
    index TEXT NOT NULL,
    pre TEXT NOT NULL,
    post TEXT NOT NULL,
    options TEXT NOT NULL,
    reindex_active TEXT,
    mtime TIMESTAMPTZ NOT NULL DEFAULT now()
);";

// Upgrades a relation created before reindexing existed.
const ENSURE_REINDEX_COLUMN: &str =
    "ALTER TABLE buckets_config ADD COLUMN IF NOT EXISTS reindex_active TEXT;";

const SELECT_DESCRIPTOR: &str = "\
SELECT name, index, pre, post, options, reindex_active, mtime
FROM buckets_config WHERE name = $1";

/// A loaded bucket: its descriptor plus pre/post triggers resolved against
/// the registry. Snapshots are immutable and shared through the cache.
pub struct BucketSnapshot {
    pub desc: BucketDescriptor,
    pub pre: Vec<(String, Trigger)>,
    pub post: Vec<(String, Trigger)>,
}

impl BucketSnapshot {
    /// Resolve a descriptor's trigger names into a snapshot.
    pub fn resolve(desc: BucketDescriptor, registry: &TriggerRegistry) -> Result<Arc<Self>> {
        let pre = registry.resolve(&desc.pre)?;
        let post = registry.resolve(&desc.post)?;
        Ok(Arc::new(BucketSnapshot { desc, pre, post }))
    }
}

/// Idempotent bootstrap of the catalog relation.
#[tracing::instrument(err, skip_all)]
pub async fn init(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_BUCKETS_CONFIG).execute(pool).await?;
    sqlx::query(ENSURE_REINDEX_COLUMN).execute(pool).await?;
    Ok(())
}

/// Load a bucket descriptor row, optionally locking it for update so
/// concurrent schema evolutions of one bucket serialize on the row lock.
pub async fn load(
    txn: &mut Transaction<'static, Postgres>,
    name: &str,
    for_update: bool,
) -> Result<Option<BucketDescriptor>> {
    let sql = if for_update {
        format!("{} FOR UPDATE", SELECT_DESCRIPTOR)
    } else {
        SELECT_DESCRIPTOR.to_string()
    };
    let row = sqlx::query(&sql).bind(name).fetch_optional(&mut **txn).await?;
    row.map(|row| descriptor_from_row(&row)).transpose()
}

pub async fn list(pool: &PgPool) -> Result<Vec<BucketDescriptor>> {
    let rows = sqlx::query("SELECT name, index, pre, post, options, reindex_active, mtime FROM buckets_config ORDER BY name")
        .fetch_all(pool)
        .await?;
    rows.iter().map(descriptor_from_row).collect()
}

/// Insert the descriptor row for a new bucket. A primary-key violation
/// means the bucket already exists.
pub async fn insert(
    txn: &mut Transaction<'static, Postgres>,
    name: &str,
    config: &BucketConfig,
) -> Result<()> {
    let result = sqlx::query(
        "INSERT INTO buckets_config (name, index, pre, post, options, mtime)
         VALUES ($1, $2, $3, $4, $5, now())",
    )
    .bind(name)
    .bind(to_json(&config.index)?)
    .bind(to_json(&config.pre)?)
    .bind(to_json(&config.post)?)
    .bind(to_json(&config.options)?)
    .execute(&mut **txn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) => match Error::from(err) {
            Error::UniqueAttribute(_) => Err(Error::BucketExists(name.to_string())),
            other => Err(other),
        },
    }
}

/// Overwrite the descriptor row of an existing bucket.
pub async fn update(
    txn: &mut Transaction<'static, Postgres>,
    name: &str,
    config: &BucketConfig,
    reindex_active: &ReindexActive,
) -> Result<()> {
    let reindex: Option<String> = if reindex_active.0.is_empty() {
        None
    } else {
        Some(to_json(reindex_active)?)
    };
    sqlx::query(
        "UPDATE buckets_config
         SET index = $2, pre = $3, post = $4, options = $5, reindex_active = $6, mtime = now()
         WHERE name = $1",
    )
    .bind(name)
    .bind(to_json(&config.index)?)
    .bind(to_json(&config.pre)?)
    .bind(to_json(&config.post)?)
    .bind(to_json(&config.options)?)
    .bind(reindex)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

/// Persist only the reindex bookkeeping, after a backfill pass drains.
pub async fn update_reindex_active(
    txn: &mut Transaction<'static, Postgres>,
    name: &str,
    reindex_active: &ReindexActive,
) -> Result<()> {
    let reindex: Option<String> = if reindex_active.0.is_empty() {
        None
    } else {
        Some(to_json(reindex_active)?)
    };
    sqlx::query("UPDATE buckets_config SET reindex_active = $2, mtime = now() WHERE name = $1")
        .bind(name)
        .bind(reindex)
        .execute(&mut **txn)
        .await?;
    Ok(())
}

/// Delete the descriptor row. Returns false when no such bucket exists.
pub async fn delete(txn: &mut Transaction<'static, Postgres>, name: &str) -> Result<bool> {
    let done = sqlx::query("DELETE FROM buckets_config WHERE name = $1")
        .bind(name)
        .execute(&mut **txn)
        .await?;
    Ok(done.rows_affected() > 0)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .context("serializing bucket descriptor")
        .map_err(Error::Internal)
}

fn from_json<T: serde::de::DeserializeOwned>(bucket: &str, column: &str, text: &str) -> Result<T> {
    serde_json::from_str(text)
        .with_context(|| format!("parsing stored {} of bucket {}", column, bucket))
        .map_err(Error::Internal)
}

fn descriptor_from_row(row: &PgRow) -> Result<BucketDescriptor> {
    let name: String = row.try_get("name")?;
    let index = from_json(&name, "index", &row.try_get::<String, _>("index")?)?;
    let pre = from_json(&name, "pre", &row.try_get::<String, _>("pre")?)?;
    let post = from_json(&name, "post", &row.try_get::<String, _>("post")?)?;
    let options = from_json(&name, "options", &row.try_get::<String, _>("options")?)?;
    let reindex_active = match row.try_get::<Option<String>, _>("reindex_active")? {
        Some(text) => from_json(&name, "reindex_active", &text)?,
        None => ReindexActive::default(),
    };
    let mtime: DateTime<Utc> = row.try_get("mtime")?;

    Ok(BucketDescriptor {
        name,
        index,
        pre,
        post,
        options,
        reindex_active,
        mtime,
    })
}
