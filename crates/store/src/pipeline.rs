//! The staged request executor. Every operation is materialized as a
//! `Request` threaded through a fixed, named sequence of handlers. The
//! executor begins the transaction, runs each handler in order, and then
//! commits (write pipelines) or rolls back (read pipelines and any error).

use futures::future::BoxFuture;
use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::BucketSnapshot;
use crate::error::{Error, Result};
use crate::objects::batch::BatchEntry;
use crate::objects::row::{ObjectRecord, StoredObject};
use crate::sql::CompiledFilter;
use crate::Store;

/// How a filter result set is ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Clone, Debug)]
pub struct SortKey {
    pub attr: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn ascending(attr: impl Into<String>) -> Self {
        SortKey {
            attr: attr.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(attr: impl Into<String>) -> Self {
        SortKey {
            attr: attr.into(),
            order: SortOrder::Descending,
        }
    }
}

/// The etag precondition of a write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EtagCondition {
    /// No precondition; the write always proceeds.
    #[default]
    Unspecified,
    /// The row must not exist (a caller-supplied `null` etag).
    Absent,
    /// The row must exist with exactly this etag.
    Match(String),
}

/// Caller options, shared across operations the way the wire protocol
/// passes them. Fields irrelevant to an operation are ignored by it.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub etag: EtagCondition,
    pub headers: BTreeMap<String, String>,
    /// Bypass the descriptor cache when loading the bucket.
    pub no_bucket_cache: bool,
    /// Skip reindex bookkeeping during updateBucket.
    pub no_reindex: bool,
    pub sort: Vec<SortKey>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Lift the default row limit of findObjects.
    pub no_limit: bool,
    /// Skip the COUNT(*) OVER() window in findObjects.
    pub no_count: bool,
    /// Indexed fields excluded from column overlay during reconstruction.
    pub ignore: Vec<String>,
    /// Per-request deadline; overrides the store's configured default.
    pub timeout: Option<Duration>,
}

/// The completed result of a pipeline, read by the public operation.
#[derive(Default)]
pub enum OpResult {
    #[default]
    None,
    Etag(String),
    Object(StoredObject),
    Count(u64),
    Bucket(models::BucketDescriptor),
    Batch(Vec<crate::objects::batch::BatchResult>),
    Reindex {
        processed: u64,
        remaining: bool,
    },
}

/// The in-flight record of one operation. Handlers read fields set by the
/// caller and earlier handlers, and install their own results.
pub struct Request {
    pub store: Store,
    pub bucket_name: String,
    pub key: Option<String>,
    pub value: Option<serde_json::Value>,
    pub filter: Option<String>,
    /// Indexed-column assignments for updateObjects.
    pub fields: Option<BTreeMap<String, serde_json::Value>>,
    /// Incoming configuration for bucket operations.
    pub config: Option<models::BucketConfig>,
    /// Entries of a batch operation.
    pub batch: Option<Vec<BatchEntry>>,
    /// Row budget for reindexObjects.
    pub page_size: Option<u64>,
    pub opts: RequestOptions,

    /// The request's database session. Present for the lifetime of the
    /// handler chain; taken back by the executor for commit or rollback.
    pub txn: Option<Transaction<'static, Postgres>>,

    // Fields installed by handlers.
    pub bucket: Option<Arc<BucketSnapshot>>,
    pub previous: Option<ObjectRecord>,
    /// Row id of the written row, for post triggers.
    pub row_id: Option<i64>,
    pub parsed: Option<filter::Filter>,
    pub where_clause: Option<CompiledFilter>,
    /// The stored descriptor a schema evolution is diffed against.
    pub current_bucket: Option<models::BucketDescriptor>,
    pub diff: Option<models::IndexDiff>,
    /// Response sink for streamed findObjects rows.
    pub rows: Option<tokio::sync::mpsc::Sender<Result<StoredObject>>>,
    pub result: OpResult,
}

impl Request {
    pub fn new(store: Store, bucket_name: impl Into<String>) -> Self {
        Request {
            store,
            bucket_name: bucket_name.into(),
            key: None,
            value: None,
            filter: None,
            fields: None,
            config: None,
            batch: None,
            page_size: None,
            opts: RequestOptions::default(),
            txn: None,
            bucket: None,
            previous: None,
            row_id: None,
            parsed: None,
            where_clause: None,
            current_bucket: None,
            diff: None,
            rows: None,
            result: OpResult::None,
        }
    }

    /// The loaded bucket snapshot. Valid after the load-bucket handler.
    pub fn bucket(&self) -> &BucketSnapshot {
        self.bucket.as_deref().expect("bucket snapshot is loaded")
    }
}

/// A pipeline handler: a named function over the borrowed request.
pub type Handler = for<'r> fn(&'r mut Request) -> BoxFuture<'r, Result<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnMode {
    /// Rolled back at the end regardless of success, releasing locks early.
    ReadOnly,
    /// Committed on success, rolled back on error.
    ReadWrite,
}

/// A named, fixed sequence of handlers.
pub struct Pipeline {
    pub name: &'static str,
    pub mode: TxnMode,
    /// Transient failures re-run the whole pipeline this many extra times.
    /// Streaming pipelines must not retry: rows may already be delivered.
    pub retries: u32,
    pub handlers: &'static [(&'static str, Handler)],
}

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Run a handler sequence over an already-prepared request. Shared by the
/// executor and by batch, which threads one transaction through the
/// sub-pipelines of its entries.
pub(crate) async fn run_handlers(
    req: &mut Request,
    handlers: &[(&'static str, Handler)],
) -> Result<()> {
    for (name, handler) in handlers {
        tracing::trace!(handler = name, "invoking");
        handler(req).await?;
    }
    Ok(())
}

/// Execute a pipeline, retrying transient failures with a fresh request.
/// Retries happen here, outside the pipeline; no partial handler state is
/// carried across attempts.
pub async fn run<F>(pipeline: &Pipeline, make_request: F) -> Result<Request>
where
    F: Fn() -> Request,
{
    let mut attempt = 0;
    loop {
        match execute(pipeline, make_request()).await {
            Err(err) if err.is_transient() && attempt < pipeline.retries => {
                attempt += 1;
                tracing::warn!(
                    pipeline = pipeline.name,
                    %err,
                    attempt,
                    "transient failure; retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            outcome => return outcome,
        }
    }
}

/// One attempt: begin, run handlers in order, then settle the transaction.
#[tracing::instrument(err, skip_all, fields(pipeline = pipeline.name, bucket = %req.bucket_name))]
pub async fn execute(pipeline: &Pipeline, mut req: Request) -> Result<Request> {
    let deadline = req.opts.timeout.or(req.store.default_timeout());

    let mut txn = req.store.pool().begin().await?;
    if pipeline.mode == TxnMode::ReadOnly {
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *txn)
            .await?;
    }
    req.txn = Some(txn);

    let outcome = {
        let chain = run_handlers(&mut req, pipeline.handlers);
        match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, chain).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(Error::Deadline),
            },
            None => chain.await,
        }
    };

    let Some(txn) = req.txn.take() else {
        // The deadline dropped the chain while a sub-pipeline held the
        // transaction; it rolled back when dropped.
        return outcome.map(|()| req);
    };
    match outcome {
        Ok(()) if pipeline.mode == TxnMode::ReadWrite => {
            txn.commit().await?;
            Ok(req)
        }
        Ok(()) => {
            // Read-only work releases its locks without publishing anything.
            txn.rollback().await?;
            Ok(req)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::warn!(%rollback_err, "rollback after pipeline failure");
            }
            Err(err)
        }
    }
}
