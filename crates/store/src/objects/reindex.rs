use futures::future::BoxFuture;

use crate::catalog;
use crate::error::Result;
use crate::objects::{self, row};
use crate::pipeline::{Handler, OpResult, Pipeline, Request, TxnMode};

/// Rows backfilled per call when the caller does not size the page.
pub const DEFAULT_PAGE: u64 = 100;

/// reindexObjects: backfill a page of rows whose `_rver` trails the bucket
/// version, re-projecting every indexed field from `_value`. Once a pass
/// comes up short the backfill has drained, and the drained versions are
/// cleared from `reindex_active`.
pub const PIPELINE: Pipeline = Pipeline {
    name: "reindexObjects",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

const HANDLERS: &[(&str, Handler)] = &[
    ("loadBucketFresh", load_bucket_fresh),
    ("backfillPage", backfill_page),
];

// Reindexing always works from the stored descriptor, not the cache: the
// whole point is that the schema just moved.
fn load_bucket_fresh(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let snapshot = objects::load_snapshot(req, &name).await?;
        req.bucket = Some(snapshot);
        Ok(())
    })
}

fn backfill_page(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let snapshot = req.bucket.clone().expect("bucket snapshot is loaded");
        let desc = &snapshot.desc;
        let bucket = req.bucket_name.clone();
        let version = desc.options.version;

        if desc.reindex_active.is_empty() {
            req.result = OpResult::Reindex {
                processed: 0,
                remaining: false,
            };
            return Ok(());
        }

        let budget = req.page_size.unwrap_or(DEFAULT_PAGE).max(1);
        let sql = format!(
            "SELECT * FROM {} WHERE _rver IS NULL OR _rver < $1 LIMIT $2 FOR UPDATE",
            bucket
        );
        let rows = {
            let txn = req.txn.as_mut().expect("request transaction is installed");
            sqlx::query(&sql)
                .bind(version as i64)
                .bind(budget as i64)
                .fetch_all(&mut **txn)
                .await?
        };
        let processed = rows.len() as u64;

        for fetched in &rows {
            let record = row::record_from_row(&bucket, fetched)?;
            let columns = row::index_object(&desc.index, &record.value)?;

            let mut sets = vec!["_rver = $2".to_string()];
            let mut next = 3;
            for (field, spec) in &desc.index {
                if columns.contains_key(field) {
                    sets.push(format!(
                        "{} = ${}{}",
                        field,
                        next,
                        objects::bind_cast(spec.ty)
                    ));
                    next += 1;
                } else {
                    sets.push(format!("{} = NULL", field));
                }
            }
            let update_sql = format!("UPDATE {} SET {} WHERE _key = $1", bucket, sets.join(", "));

            let mut query = sqlx::query(&update_sql)
                .bind(&record.key)
                .bind(version as i64);
            for (field, _) in &desc.index {
                if let Some(column) = columns.get(field) {
                    query = objects::bind_column(query, column);
                }
            }
            let txn = req.txn.as_mut().expect("request transaction is installed");
            query.execute(&mut **txn).await?;
        }

        let remaining = processed == budget;
        if !remaining {
            // The backfill has drained; retire every version it covered.
            let mut active = desc.reindex_active.clone();
            active.clear_through(version);
            let txn = req.txn.as_mut().expect("request transaction is installed");
            catalog::update_reindex_active(txn, &bucket, &active).await?;
            tracing::info!(%bucket, version, "reindex drained");
        }

        tracing::debug!(%bucket, processed, remaining, "reindex page complete");
        req.result = OpResult::Reindex {
            processed,
            remaining,
        };
        Ok(())
    })
}
