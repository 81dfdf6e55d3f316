use futures::future::BoxFuture;

use crate::catalog;
use crate::error::{Error, Result};
use crate::pipeline::{Handler, OpResult, Pipeline, Request, TxnMode};

/// getBucket: read the stored descriptor, bypassing the cache so callers
/// observe reindex bookkeeping as it stands.
pub const PIPELINE: Pipeline = Pipeline {
    name: "getBucket",
    mode: TxnMode::ReadOnly,
    retries: 2,
    handlers: HANDLERS,
};

const HANDLERS: &[(&str, Handler)] = &[("fetchDescriptor", fetch_descriptor)];

fn fetch_descriptor(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");
        let desc = catalog::load(txn, &name, false)
            .await?
            .ok_or_else(|| Error::BucketNotFound(name))?;
        req.result = OpResult::Bucket(desc);
        Ok(())
    })
}
