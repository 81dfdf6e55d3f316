use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::objects::{self, row};
use crate::pipeline::{Handler, OpResult, Pipeline, Request, TxnMode};

/// getObject: a read-only fetch of one key, reconstructed through the
/// bucket's schema.
pub const PIPELINE: Pipeline = Pipeline {
    name: "getObject",
    mode: TxnMode::ReadOnly,
    retries: 2,
    handlers: HANDLERS,
};

const HANDLERS: &[(&str, Handler)] = &[
    ("loadBucket", objects::load_bucket),
    ("fetchObject", fetch_object),
];

fn fetch_object(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let bucket = req.bucket_name.clone();
        let key = req.key.clone().expect("read request carries a key");

        let fetched = objects::fetch_row_by_key(req, &bucket, &key).await?;
        let Some(fetched) = fetched else {
            return Err(Error::ObjectNotFound { bucket, key });
        };

        // A row written under a newer schema than the cached descriptor
        // means the cache is stale: shoot it down and reload.
        let stale = match objects::row_rver(&fetched) {
            Some(rver) => rver > req.bucket().desc.options.version as i64,
            None => false,
        };
        if stale {
            tracing::debug!(%bucket, "row version ahead of cached descriptor; reloading");
            req.store.cache().invalidate(&bucket);
            let snapshot = objects::load_snapshot(req, &bucket).await?;
            req.bucket = Some(snapshot);
        }

        let snapshot = req.bucket.clone().expect("bucket snapshot is loaded");
        let object = row::object_from_row(
            &bucket,
            &snapshot.desc.index,
            &req.opts.ignore,
            false,
            &fetched,
        )?;
        req.result = OpResult::Object(object);
        Ok(())
    })
}
