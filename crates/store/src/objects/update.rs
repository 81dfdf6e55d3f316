use futures::future::BoxFuture;
use models::coerce;

use crate::error::{Error, Result};
use crate::objects::{self, row};
use crate::pipeline::{Handler, OpResult, Pipeline, Request, TxnMode};

/// updateObjects: bulk update of indexed columns on every row matching a
/// filter. `_value` is untouched; `_etag` and `_mtime` are refreshed, with
/// one fresh etag shared by all rows the statement touches.
pub const PIPELINE: Pipeline = Pipeline {
    name: "updateObjects",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

pub(crate) const HANDLERS: &[(&str, Handler)] = &[
    ("loadBucket", objects::load_bucket),
    ("parseFilter", objects::parse_filter),
    ("buildWhere", objects::build_where),
    ("applyUpdate", apply_update),
];

fn apply_update(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let snapshot = req.bucket.clone().expect("bucket snapshot is loaded");
        let compiled = req.where_clause.clone().expect("filter is compiled");
        let fields = req.fields.clone().expect("update request carries fields");
        let bucket = req.bucket_name.clone();
        let schema = &snapshot.desc.index;

        if fields.is_empty() {
            return Err(Error::InvalidQuery(
                "update carries no field assignments".to_string(),
            ));
        }

        // Only indexed columns may be assigned; the JSON is not rewritten.
        let mut assignments = Vec::with_capacity(fields.len());
        for (field, value) in &fields {
            let Some(spec) = schema.get(field) else {
                return Err(Error::NotIndexed(field.clone()));
            };
            assignments.push((field.clone(), spec.ty, coerce(spec.ty, value)?));
        }

        let mtime = chrono::Utc::now().timestamp_millis();
        let stamp = serde_json::json!({ "fields": &fields, "mtime": mtime });
        let etag = row::compute_etag(&bucket, req.filter.as_deref().unwrap_or(""), &stamp);

        // Filter arguments bind first; the SET values follow them.
        let mut placeholder = compiled.args.len();
        let mut next = || {
            placeholder += 1;
            placeholder
        };
        let mut sets = vec![
            format!("_etag = ${}", next()),
            format!("_mtime = ${}", next()),
        ];
        for (field, ty, column) in &assignments {
            match column {
                Some(_) => sets.push(format!(
                    "{} = ${}{}",
                    field,
                    next(),
                    objects::bind_cast(*ty)
                )),
                None => sets.push(format!("{} = NULL", field)),
            }
        }
        let limit = match req.opts.limit {
            Some(_) => format!(" LIMIT ${}", next()),
            None => String::new(),
        };

        let sql = format!(
            "UPDATE {} SET {} WHERE _key IN (SELECT _key FROM {} WHERE {}{})",
            bucket,
            sets.join(", "),
            bucket,
            compiled.clause,
            limit,
        );

        let mut query = sqlx::query(&sql);
        for arg in &compiled.args {
            query = objects::bind_filter_arg(query, arg);
        }
        query = query.bind(&etag).bind(mtime);
        for (_, _, column) in &assignments {
            if let Some(column) = column {
                query = objects::bind_column(query, column);
            }
        }
        if let Some(limit) = req.opts.limit {
            query = query.bind(limit as i64);
        }

        let txn = req.txn.as_mut().expect("request transaction is installed");
        let done = query.execute(&mut **txn).await?;

        tracing::debug!(%bucket, rows = done.rows_affected(), "bulk update applied");
        req.result = OpResult::Count(done.rows_affected());
        Ok(())
    })
}
