use futures::future::BoxFuture;

use crate::error::Result;
use crate::objects;
use crate::pipeline::{Handler, OpResult, Pipeline, Request, TxnMode};

/// deleteMany: bulk delete of every row matching a filter, with the same
/// compilation and index restrictions as updateObjects.
pub const PIPELINE: Pipeline = Pipeline {
    name: "deleteMany",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

pub(crate) const HANDLERS: &[(&str, Handler)] = &[
    ("loadBucket", objects::load_bucket),
    ("parseFilter", objects::parse_filter),
    ("buildWhere", objects::build_where),
    ("applyDelete", apply_delete),
];

fn apply_delete(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let compiled = req.where_clause.clone().expect("filter is compiled");
        let bucket = req.bucket_name.clone();

        let limit = match req.opts.limit {
            Some(_) => format!(" LIMIT ${}", compiled.args.len() + 1),
            None => String::new(),
        };
        let sql = format!(
            "DELETE FROM {} WHERE _key IN (SELECT _key FROM {} WHERE {}{})",
            bucket, bucket, compiled.clause, limit,
        );

        let mut query = sqlx::query(&sql);
        for arg in &compiled.args {
            query = objects::bind_filter_arg(query, arg);
        }
        if let Some(limit) = req.opts.limit {
            query = query.bind(limit as i64);
        }

        let txn = req.txn.as_mut().expect("request transaction is installed");
        let done = query.execute(&mut **txn).await?;

        tracing::debug!(%bucket, rows = done.rows_affected(), "bulk delete applied");
        req.result = OpResult::Count(done.rows_affected());
        Ok(())
    })
}
