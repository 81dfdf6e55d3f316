use futures::future::BoxFuture;
use futures::TryStreamExt;

use crate::error::{Error, Result};
use crate::objects::{self, row};
use crate::pipeline::{Handler, Pipeline, Request, SortOrder, TxnMode};

/// The row limit applied when the caller sets neither `limit` nor
/// `no_limit`.
pub const DEFAULT_LIMIT: u64 = 1000;

/// findObjects: compile the filter, stream matching rows to the response
/// sink, reconstructing each object on the way out. Never retried: rows
/// may already have been delivered.
pub const PIPELINE: Pipeline = Pipeline {
    name: "findObjects",
    mode: TxnMode::ReadOnly,
    retries: 0,
    handlers: HANDLERS,
};

const HANDLERS: &[(&str, Handler)] = &[
    ("loadBucket", objects::load_bucket),
    ("parseFilter", objects::parse_filter),
    ("buildWhere", objects::build_where),
    ("streamRows", stream_rows),
];

/// Attributes accepted for ORDER BY alongside the indexed fields.
const SORTABLE_INTERNAL: &[&str] = &["_id", "_key", "_etag", "_mtime", "_txn_snap"];

fn stream_rows(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let snapshot = req.bucket.clone().expect("bucket snapshot is loaded");
        let compiled = req.where_clause.clone().expect("filter is compiled");
        let opts = req.opts.clone();
        let bucket = req.bucket_name.clone();
        let schema = &snapshot.desc.index;

        let mut select_list = String::from("_id, _key, _value, _etag, _mtime, _txn_snap");
        if !opts.no_count {
            select_list.push_str(", COUNT(*) OVER() AS _count");
        }
        for field in schema.keys() {
            select_list.push_str(", ");
            select_list.push_str(field);
        }
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {}",
            select_list, bucket, compiled.clause
        );

        if !opts.sort.is_empty() {
            let mut order_parts = Vec::with_capacity(opts.sort.len());
            for sort in &opts.sort {
                if !schema.contains_key(&sort.attr)
                    && !SORTABLE_INTERNAL.contains(&sort.attr.as_str())
                {
                    return Err(Error::InvalidQuery(format!(
                        "cannot sort on unindexed attribute {}",
                        sort.attr
                    )));
                }
                let direction = match sort.order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                order_parts.push(format!("{} {}", sort.attr, direction));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_parts.join(", "));
        }

        let limit = match (opts.limit, opts.no_limit) {
            (Some(limit), _) => Some(limit),
            (None, false) => Some(DEFAULT_LIMIT),
            (None, true) => None,
        };
        let mut placeholder = compiled.args.len();
        if limit.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" LIMIT ${}", placeholder));
        }
        if opts.offset.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" OFFSET ${}", placeholder));
        }

        let mut query = sqlx::query(&sql);
        for arg in &compiled.args {
            query = objects::bind_filter_arg(query, arg);
        }
        if let Some(limit) = limit {
            query = query.bind(limit as i64);
        }
        if let Some(offset) = opts.offset {
            query = query.bind(offset as i64);
        }

        let sender = req.rows.clone().expect("find request carries a row sink");
        let txn = req.txn.as_mut().expect("request transaction is installed");
        let mut rows = query.fetch(&mut **txn);
        while let Some(fetched) = rows.try_next().await? {
            let object =
                row::object_from_row(&bucket, schema, &opts.ignore, !opts.no_count, &fetched)?;
            if sender.send(Ok(object)).await.is_err() {
                tracing::debug!(%bucket, "find consumer went away; stopping early");
                break;
            }
        }
        Ok(())
    })
}
