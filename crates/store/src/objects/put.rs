use futures::future::BoxFuture;

use crate::error::Result;
use crate::objects::{self, row};
use crate::pipeline::{Handler, OpResult, Pipeline, Request, TxnMode};

/// putObject: lock the key, enforce the etag precondition, run pre
/// triggers, project indexed columns, write the row, run post triggers.
pub const PIPELINE: Pipeline = Pipeline {
    name: "putObject",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

pub(crate) const HANDLERS: &[(&str, Handler)] = &[
    ("loadBucket", objects::load_bucket),
    ("rowLock", objects::row_lock),
    ("checkEtag", objects::check_etag),
    ("preTriggers", objects::run_pre_triggers),
    ("saveObject", save_object),
    ("postTriggers", objects::run_post_triggers),
];

/// Project the value and INSERT or UPDATE under the held row lock, stamping
/// `_etag`, `_mtime`, and (for versioned buckets) `_rver`.
fn save_object(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let snapshot = req.bucket.clone().expect("bucket snapshot is loaded");
        let bucket = req.bucket_name.clone();
        let key = req.key.clone().expect("write request carries a key");
        let value = req.value.clone().expect("write request carries a value");

        let desc = &snapshot.desc;
        let columns = row::index_object(&desc.index, &value)?;
        let etag = row::compute_etag(&bucket, &key, &value);
        let mtime = chrono::Utc::now().timestamp_millis();
        // The `_rver` column exists once reindex bookkeeping has been
        // populated; rows written during a backfill are stamped so the
        // reindexer skips them.
        let rver = (!desc.reindex_active.is_empty()).then(|| desc.options.version as i64);

        let mut sql;
        if req.previous.is_some() {
            // UPDATE: indexed fields absent from the new value go back to
            // NULL explicitly.
            sql = format!("UPDATE {} SET _value = $2, _etag = $3, _mtime = $4", bucket);
            let mut next = 5;
            if rver.is_some() {
                sql.push_str(&format!(", _rver = ${}", next));
                next += 1;
            }
            for (field, spec) in &desc.index {
                if columns.contains_key(field) {
                    sql.push_str(&format!(
                        ", {} = ${}{}",
                        field,
                        next,
                        objects::bind_cast(spec.ty)
                    ));
                    next += 1;
                } else {
                    sql.push_str(&format!(", {} = NULL", field));
                }
            }
            sql.push_str(" WHERE _key = $1 RETURNING _id");
        } else {
            let mut names = vec![
                "_key".to_string(),
                "_value".to_string(),
                "_etag".to_string(),
                "_mtime".to_string(),
            ];
            if rver.is_some() {
                names.push("_rver".to_string());
            }
            let mut placeholders: Vec<String> = (1..=names.len()).map(|n| format!("${}", n)).collect();
            let mut next = names.len() + 1;
            for (field, spec) in &desc.index {
                if columns.contains_key(field) {
                    names.push(field.clone());
                    placeholders.push(format!("${}{}", next, objects::bind_cast(spec.ty)));
                    next += 1;
                }
            }
            sql = format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING _id",
                bucket,
                names.join(", "),
                placeholders.join(", ")
            );
        }

        let mut query = sqlx::query(&sql)
            .bind(&key)
            .bind(value.to_string())
            .bind(&etag)
            .bind(mtime);
        if let Some(rver) = rver {
            query = query.bind(rver);
        }
        for (field, _) in &desc.index {
            if let Some(column) = columns.get(field) {
                query = objects::bind_column(query, column);
            }
        }

        let txn = req.txn.as_mut().expect("request transaction is installed");
        let written = query.fetch_one(&mut **txn).await?;
        let id: i64 = sqlx::Row::try_get(&written, "_id")?;

        tracing::debug!(%bucket, %key, id, %etag, "object written");
        req.row_id = Some(id);
        req.result = OpResult::Etag(etag);
        Ok(())
    })
}
