//! Object operations: the per-request handlers and the row-level cores
//! they share with `batch`.

pub mod batch;
pub mod del;
pub mod delete_many;
pub mod find;
pub mod get;
pub mod put;
pub mod reindex;
pub mod row;
pub mod update;

use futures::future::BoxFuture;
use models::{ColumnValue, IndexType};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Postgres, Row};

use crate::catalog::{self, BucketSnapshot};
use crate::error::{Error, Result};
use crate::pipeline::{EtagCondition, Request};
use crate::sql::{compile_filter, FilterArg};
use crate::triggers::{run_triggers, TriggerScope};

/// Load the request's bucket snapshot, honoring the caller's cache bypass.
/// A miss reads the descriptor on the request's own session and admits the
/// resolved snapshot to the cache.
pub(crate) fn load_bucket(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        if !req.opts.no_bucket_cache {
            if let Some(snapshot) = req.store.cache().get(&name) {
                req.bucket = Some(snapshot);
                return Ok(());
            }
        }
        let snapshot = load_snapshot(req, &name).await?;
        req.bucket = Some(snapshot);
        Ok(())
    })
}

/// Read and resolve a descriptor on the request's session, admitting it to
/// the cache.
pub(crate) async fn load_snapshot(
    req: &mut Request,
    name: &str,
) -> Result<std::sync::Arc<BucketSnapshot>> {
    let txn = req.txn.as_mut().expect("request transaction is installed");
    let desc = catalog::load(txn, name, false)
        .await?
        .ok_or_else(|| Error::BucketNotFound(name.to_string()))?;
    let snapshot = BucketSnapshot::resolve(desc, req.store.triggers())?;
    req.store.cache().put(name, snapshot.clone());
    Ok(snapshot)
}

/// `SELECT … FOR UPDATE` on the request's key, serializing concurrent
/// writers and capturing the previous row for etag checks and triggers.
///
/// If the row's `_rver` is ahead of the loaded descriptor, a concurrent
/// schema evolution outran the cache: shoot the entry down and reload.
pub(crate) fn row_lock(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let bucket = req.bucket_name.clone();
        let key = req.key.clone().expect("write request carries a key");

        let sql = format!("SELECT * FROM {} WHERE _key = $1 FOR UPDATE", bucket);
        let txn = req.txn.as_mut().expect("request transaction is installed");
        let row = sqlx::query(&sql)
            .bind(&key)
            .fetch_optional(&mut **txn)
            .await?;
        req.previous = row.map(|row| row::record_from_row(&bucket, &row)).transpose()?;

        let stale = match &req.previous {
            Some(previous) => match previous.rver {
                Some(rver) => rver > req.bucket().desc.options.version as i64,
                None => false,
            },
            None => false,
        };
        if stale {
            tracing::debug!(%bucket, "row version ahead of cached descriptor; reloading");
            req.store.cache().invalidate(&bucket);
            let snapshot = load_snapshot(req, &bucket).await?;
            req.bucket = Some(snapshot);
        }
        Ok(())
    })
}

/// Enforce the caller's etag precondition against the locked previous row.
pub(crate) fn check_etag(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let conflict = || Error::EtagConflict {
            bucket: req.bucket_name.clone(),
            key: req.key.clone().unwrap_or_default(),
        };
        match (&req.opts.etag, &req.previous) {
            (EtagCondition::Unspecified, _) => Ok(()),
            (EtagCondition::Absent, None) => Ok(()),
            (EtagCondition::Absent, Some(_)) => Err(conflict()),
            (EtagCondition::Match(_), None) => Err(conflict()),
            (EtagCondition::Match(expected), Some(previous)) => {
                if previous.etag == *expected {
                    Ok(())
                } else {
                    Err(conflict())
                }
            }
        }
    })
}

pub(crate) fn run_pre_triggers(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let snapshot = req.bucket.clone().expect("bucket snapshot is loaded");
        if snapshot.pre.is_empty() {
            return Ok(());
        }
        let scope = TriggerScope {
            bucket: &req.bucket_name,
            schema: &snapshot.desc.index,
            id: req.previous.as_ref().map(|previous| previous.id),
            key: req.key.as_deref(),
            value: req.value.as_ref(),
            headers: &req.opts.headers,
            update: req.previous.is_some(),
        };
        run_triggers(
            &snapshot.pre,
            scope,
            req.txn.as_mut().expect("request transaction is installed"),
        )
        .await
    })
}

pub(crate) fn run_post_triggers(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let snapshot = req.bucket.clone().expect("bucket snapshot is loaded");
        if snapshot.post.is_empty() {
            return Ok(());
        }
        let scope = TriggerScope {
            bucket: &req.bucket_name,
            schema: &snapshot.desc.index,
            id: req.row_id,
            key: req.key.as_deref(),
            value: req.value.as_ref(),
            headers: &req.opts.headers,
            update: req.previous.is_some(),
        };
        run_triggers(
            &snapshot.post,
            scope,
            req.txn.as_mut().expect("request transaction is installed"),
        )
        .await
    })
}

/// Parse the request's filter string into its AST.
pub(crate) fn parse_filter(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let raw = req
            .filter
            .as_deref()
            .ok_or_else(|| Error::InvalidQuery("request carries no filter".to_string()))?;
        req.parsed = Some(filter::parse(raw)?);
        Ok(())
    })
}

/// Decorate and compile the parsed filter against the loaded bucket.
pub(crate) fn build_where(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let parsed = req.parsed.as_ref().expect("filter is parsed");
        let compiled = compile_filter(&req.bucket().desc, parsed)?;
        req.where_clause = Some(compiled);
        Ok(())
    })
}

/// The bind-time cast appended to a placeholder targeting a column of this
/// type. Scalars with native sqlx encodings need none; INET/CIDR and array
/// columns bind as canonical text and are cast server-side.
pub(crate) fn bind_cast(ty: IndexType) -> String {
    match ty {
        IndexType::String | IndexType::Number | IndexType::Boolean => String::new(),
        IndexType::Ip => "::inet".to_string(),
        IndexType::Subnet => "::cidr".to_string(),
        array => format!("::{}", array.pg_type().to_lowercase()),
    }
}

/// Bind one projected column value.
pub(crate) fn bind_column<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &ColumnValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        ColumnValue::Text(s) => query.bind(s.clone()),
        ColumnValue::Int(n) => query.bind(*n),
        ColumnValue::Bool(b) => query.bind(*b),
        ColumnValue::Inet(_) | ColumnValue::Cidr(_) => query.bind(value.scalar_text()),
        ColumnValue::Array(..) => query.bind(value.array_literal()),
    }
}

/// Bind one compiled filter argument.
pub(crate) fn bind_filter_arg<'q>(
    query: Query<'q, Postgres, PgArguments>,
    arg: &FilterArg,
) -> Query<'q, Postgres, PgArguments> {
    match arg {
        FilterArg::Text(s) => query.bind(s.clone()),
        FilterArg::Int(n) => query.bind(*n),
        FilterArg::Bool(b) => query.bind(*b),
    }
}

/// Fetch a single object row by key, without locking.
pub(crate) async fn fetch_row_by_key(
    req: &mut Request,
    bucket: &str,
    key: &str,
) -> Result<Option<sqlx::postgres::PgRow>> {
    let sql = format!("SELECT * FROM {} WHERE _key = $1", bucket);
    let txn = req.txn.as_mut().expect("request transaction is installed");
    Ok(sqlx::query(&sql)
        .bind(key)
        .fetch_optional(&mut **txn)
        .await?)
}

/// The `_rver` of a fetched row, tolerating relations which predate the
/// column.
pub(crate) fn row_rver(row: &sqlx::postgres::PgRow) -> Option<i64> {
    row.try_get("_rver").unwrap_or(None)
}
