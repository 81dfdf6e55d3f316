use futures::future::BoxFuture;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::objects::{del, delete_many, put, update};
use crate::pipeline::{self, OpResult, Pipeline, Request, RequestOptions, TxnMode};

/// One entry of a batch operation.
#[derive(Clone, Debug)]
pub enum BatchEntry {
    Put {
        bucket: String,
        key: String,
        value: serde_json::Value,
        options: RequestOptions,
    },
    Update {
        bucket: String,
        fields: BTreeMap<String, serde_json::Value>,
        filter: String,
        options: RequestOptions,
    },
    Delete {
        bucket: String,
        key: String,
        options: RequestOptions,
    },
    DeleteMany {
        bucket: String,
        filter: String,
        options: RequestOptions,
    },
}

/// The per-entry outcome of a committed batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchResult {
    Etag(String),
    Count(u64),
    Deleted,
}

/// batch: an atomic sequence of write entries sharing one transaction.
/// Each entry runs the same handler chain as its standalone operation; the
/// first failure rolls back everything.
pub const PIPELINE: Pipeline = Pipeline {
    name: "batch",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: &[("executeBatch", execute_batch)],
};

fn execute_batch(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let entries = req.batch.take().expect("batch request carries entries");
        let mut results = Vec::with_capacity(entries.len());

        for (position, entry) in entries.into_iter().enumerate() {
            let (mut sub, handlers) = match entry {
                BatchEntry::Put {
                    bucket,
                    key,
                    value,
                    options,
                } => {
                    let mut sub = Request::new(req.store.clone(), bucket);
                    sub.key = Some(key);
                    sub.value = Some(value);
                    sub.opts = options;
                    (sub, put::HANDLERS)
                }
                BatchEntry::Update {
                    bucket,
                    fields,
                    filter,
                    options,
                } => {
                    let mut sub = Request::new(req.store.clone(), bucket);
                    sub.fields = Some(fields);
                    sub.filter = Some(filter);
                    sub.opts = options;
                    (sub, update::HANDLERS)
                }
                BatchEntry::Delete {
                    bucket,
                    key,
                    options,
                } => {
                    let mut sub = Request::new(req.store.clone(), bucket);
                    sub.key = Some(key);
                    sub.opts = options;
                    (sub, del::HANDLERS)
                }
                BatchEntry::DeleteMany {
                    bucket,
                    filter,
                    options,
                } => {
                    let mut sub = Request::new(req.store.clone(), bucket);
                    sub.filter = Some(filter);
                    sub.opts = options;
                    (sub, delete_many::HANDLERS)
                }
            };

            // The batch's single transaction threads through every entry.
            sub.txn = req.txn.take();
            let outcome = pipeline::run_handlers(&mut sub, handlers).await;
            req.txn = sub.txn.take();
            if let Err(err) = outcome {
                tracing::debug!(position, %err, "batch entry failed; rolling back");
                return Err(err);
            }

            results.push(match sub.result {
                OpResult::Etag(etag) => BatchResult::Etag(etag),
                OpResult::Count(count) => BatchResult::Count(count),
                _ => BatchResult::Deleted,
            });
        }

        req.result = OpResult::Batch(results);
        Ok(())
    })
}
