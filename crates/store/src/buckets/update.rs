use futures::future::BoxFuture;
use models::diff_index;

use crate::buckets;
use crate::catalog;
use crate::error::{Error, Result};
use crate::pipeline::{Handler, Pipeline, Request, TxnMode};

/// updateBucket: the schema-evolution engine. Validates the incoming
/// descriptor, locks and version-gates the stored one, computes the index
/// diff, then applies the column DDL, index creation, and reindex
/// bookkeeping as one transaction.
pub const PIPELINE: Pipeline = Pipeline {
    name: "updateBucket",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

const HANDLERS: &[(&str, Handler)] = &[
    ("validateConfig", buckets::validate_config),
    ("loadStored", load_stored),
    ("checkVersion", check_version),
    ("ensureReindexColumn", ensure_reindex_column),
    ("computeDiff", compute_diff),
    ("ensureRowVersion", ensure_row_version),
    ("persistDescriptor", persist_descriptor),
    ("dropColumns", drop_columns),
    ("addColumns", add_columns),
    ("createNewIndexes", create_new_indexes),
];

/// Read the stored descriptor under `FOR UPDATE`: concurrent evolutions of
/// one bucket serialize on its catalog row.
fn load_stored(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");
        let stored = catalog::load(txn, &name, true)
            .await?
            .ok_or_else(|| Error::BucketNotFound(name))?;
        req.current_bucket = Some(stored);
        Ok(())
    })
}

/// `options.version` must strictly increase, except that version 0 is
/// legacy and always overwrites.
fn check_version(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let stored = req.current_bucket.as_ref().expect("stored descriptor is loaded");
        let config = req.config.as_ref().expect("bucket request carries a config");

        let current = stored.options.version;
        let proposed = config.options.version;
        if current != 0 && current >= proposed {
            return Err(Error::BucketVersion {
                name: req.bucket_name.clone(),
                current,
                proposed,
            });
        }
        Ok(())
    })
}

// The catalog relation may predate reindex bookkeeping.
fn ensure_reindex_column(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let txn = req.txn.as_mut().expect("request transaction is installed");
        sqlx::query("ALTER TABLE buckets_config ADD COLUMN IF NOT EXISTS reindex_active TEXT")
            .execute(&mut **txn)
            .await?;
        Ok(())
    })
}

fn compute_diff(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let stored = req.current_bucket.as_ref().expect("stored descriptor is loaded");
        let config = req.config.as_ref().expect("bucket request carries a config");

        let diff = diff_index(&stored.index, &config.index);
        if !diff.modified.is_empty() {
            // Changed definitions are recorded but not applied; the stored
            // column type wins. A type change needs a new field name.
            tracing::warn!(
                bucket = %req.bucket_name,
                modified = ?diff.modified,
                "index definitions changed in place; not applied"
            );
        }
        tracing::debug!(
            bucket = %req.bucket_name,
            add = ?diff.add,
            del = ?diff.del,
            "computed index diff"
        );
        req.diff = Some(diff);
        Ok(())
    })
}

/// Make sure the bucket relation carries `_rver` and its index before any
/// rows are stamped with it. Skipped for legacy (version 0) updates and
/// when the caller disabled reindex bookkeeping.
fn ensure_row_version(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let config = req.config.as_ref().expect("bucket request carries a config");
        if req.opts.no_reindex || config.options.version == 0 {
            return Ok(());
        }
        let name = req.bucket_name.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");

        let sql = format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS _rver BIGINT", name);
        sqlx::query(&sql).execute(&mut **txn).await?;
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {}__rver_idx ON {} (_rver)",
            name, name
        );
        sqlx::query(&sql).execute(&mut **txn).await?;
        Ok(())
    })
}

/// Write the new descriptor, extending `reindex_active` with the added
/// fields under the new version so readers treat them as unusable until
/// the backfill drains.
fn persist_descriptor(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let stored = req.current_bucket.as_ref().expect("stored descriptor is loaded");
        let config = req.config.clone().expect("bucket request carries a config");
        let diff = req.diff.as_ref().expect("diff is computed");

        let mut reindex_active = stored.reindex_active.clone();
        if !req.opts.no_reindex && config.options.version > 0 {
            reindex_active.consolidate(config.options.version, diff.add.iter().cloned());
        }

        let txn = req.txn.as_mut().expect("request transaction is installed");
        catalog::update(txn, &name, &config, &reindex_active).await?;
        tracing::info!(
            bucket = %name,
            version = config.options.version,
            "bucket descriptor updated"
        );
        Ok(())
    })
}

fn drop_columns(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let dropped = req.diff.as_ref().expect("diff is computed").del.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");
        for field in &dropped {
            let sql = format!("ALTER TABLE {} DROP COLUMN IF EXISTS {}", name, field);
            tracing::debug!(bucket = %name, %field, "dropping column");
            sqlx::query(&sql).execute(&mut **txn).await?;
        }
        Ok(())
    })
}

fn add_columns(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let config = req.config.clone().expect("bucket request carries a config");
        let added = req.diff.as_ref().expect("diff is computed").add.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");
        for field in &added {
            let spec = config.index.get(field).expect("added field is in the index");
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", name, field, spec.ty.pg_type());
            tracing::debug!(bucket = %name, %field, ty = %spec.ty, "adding column");
            sqlx::query(&sql).execute(&mut **txn).await?;
        }
        Ok(())
    })
}

fn create_new_indexes(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let config = req.config.clone().expect("bucket request carries a config");
        let added = req.diff.as_ref().expect("diff is computed").add.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");
        let fields = config
            .index
            .iter()
            .filter(|(field, _)| added.contains(*field));
        buckets::create_field_indexes(txn, &name, fields).await
    })
}
