use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::objects;
use crate::pipeline::{Handler, Pipeline, Request, TxnMode};

/// delObject: same shape as putObject, with the write replaced by DELETE.
/// The missing-row case fails before the etag check runs.
pub const PIPELINE: Pipeline = Pipeline {
    name: "delObject",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

pub(crate) const HANDLERS: &[(&str, Handler)] = &[
    ("loadBucket", objects::load_bucket),
    ("rowLock", objects::row_lock),
    ("requirePrevious", require_previous),
    ("checkEtag", objects::check_etag),
    ("preTriggers", objects::run_pre_triggers),
    ("deleteRow", delete_row),
    ("postTriggers", objects::run_post_triggers),
];

fn require_previous(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        match &req.previous {
            Some(_) => Ok(()),
            None => Err(Error::ObjectNotFound {
                bucket: req.bucket_name.clone(),
                key: req.key.clone().unwrap_or_default(),
            }),
        }
    })
}

fn delete_row(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let bucket = req.bucket_name.clone();
        let key = req.key.clone().expect("write request carries a key");
        let previous = req.previous.as_ref().expect("previous row is loaded");
        req.row_id = Some(previous.id);

        let sql = format!("DELETE FROM {} WHERE _key = $1", bucket);
        let txn = req.txn.as_mut().expect("request transaction is installed");
        sqlx::query(&sql).bind(&key).execute(&mut **txn).await?;

        tracing::debug!(%bucket, %key, "object deleted");
        Ok(())
    })
}
