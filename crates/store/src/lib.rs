//! A schema-aware JSON object store over PostgreSQL.
//!
//! Clients create named buckets whose records are JSON objects identified
//! by a string key. A bucket declares indexed fields, projected from the
//! JSON into typed columns, so filter queries compile to indexed SQL
//! instead of scans. Bucket schemas are versioned, with online reindexing
//! of existing rows when the schema grows.

mod buckets;
mod cache;
mod catalog;
mod error;
mod objects;
mod pipeline;
mod sql;
mod triggers;

pub use error::{Error, Result};
pub use models::{
    BucketConfig, BucketDescriptor, BucketOptions, FieldIndex, IndexType, ReindexActive,
};
pub use objects::batch::{BatchEntry, BatchResult};
pub use objects::row::StoredObject;
pub use pipeline::{EtagCondition, RequestOptions, SortKey, SortOrder};
pub use triggers::{Trigger, TriggerCookie, TriggerRegistry};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{OpResult, Request};

/// Store configuration.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "Config::default_pool_max_connections")]
    pub pool_max_connections: u32,
    #[serde(default = "Config::default_bucket_cache_size")]
    pub bucket_cache_size: usize,
    /// Default per-request deadline. Callers may override per request.
    #[serde(default, with = "humantime_serde")]
    pub query_timeout: Option<Duration>,
}

impl Config {
    pub fn new(database_url: impl Into<String>) -> Self {
        Config {
            database_url: database_url.into(),
            pool_max_connections: Self::default_pool_max_connections(),
            bucket_cache_size: Self::default_bucket_cache_size(),
            query_timeout: None,
        }
    }

    fn default_pool_max_connections() -> u32 {
        8
    }

    fn default_bucket_cache_size() -> usize {
        100
    }
}

/// Builds a `Store`, registering named triggers before any bucket can
/// reference them.
pub struct Builder {
    config: Config,
    triggers: TriggerRegistry,
}

impl Builder {
    pub fn trigger(mut self, name: impl Into<String>, trigger: Trigger) -> Self {
        self.triggers.register(name, trigger);
        self
    }

    /// Connect the pool, bootstrap the catalog relation, and return the
    /// store handle.
    pub async fn connect(self) -> Result<Store> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.pool_max_connections)
            .connect(&self.config.database_url)
            .await?;
        self.with_pool(pool).await
    }

    /// Like `connect`, over a pool the caller already holds.
    pub async fn with_pool(self, pool: PgPool) -> Result<Store> {
        catalog::init(&pool).await?;
        Ok(Store {
            inner: Arc::new(Inner {
                cache: cache::BucketCache::new(self.config.bucket_cache_size),
                triggers: self.triggers,
                config: self.config,
                pool,
            }),
        })
    }
}

struct Inner {
    pool: PgPool,
    cache: cache::BucketCache,
    triggers: TriggerRegistry,
    config: Config,
}

/// The store handle. Cheap to clone; all operations take `&self`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

/// Progress of one reindexObjects call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReindexStatus {
    /// Rows backfilled by this call.
    pub processed: u64,
    /// Whether another call is needed to drain the backfill.
    pub remaining: bool,
}

impl Store {
    pub fn builder(config: Config) -> Builder {
        Builder {
            config,
            triggers: TriggerRegistry::default(),
        }
    }

    /// Connect with no registered triggers.
    pub async fn connect(config: Config) -> Result<Self> {
        Self::builder(config).connect().await
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    pub(crate) fn cache(&self) -> &cache::BucketCache {
        &self.inner.cache
    }

    pub(crate) fn triggers(&self) -> &TriggerRegistry {
        &self.inner.triggers
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.inner.config.query_timeout
    }

    /// Create a bucket: validate the configuration, persist its descriptor,
    /// and build the backing relation and indexes.
    pub async fn create_bucket(&self, name: &str, config: BucketConfig) -> Result<()> {
        pipeline::run(&buckets::create::PIPELINE, || {
            let mut req = Request::new(self.clone(), name);
            req.config = Some(config.clone());
            req
        })
        .await?;
        Ok(())
    }

    /// Evolve a bucket's schema. The stored descriptor row is locked, the
    /// version gate enforced, and column/index DDL applied along with
    /// reindex bookkeeping (unless `opts.no_reindex`).
    pub async fn update_bucket(
        &self,
        name: &str,
        config: BucketConfig,
        opts: RequestOptions,
    ) -> Result<()> {
        pipeline::run(&buckets::update::PIPELINE, || {
            let mut req = Request::new(self.clone(), name);
            req.config = Some(config.clone());
            req.opts = opts.clone();
            req
        })
        .await?;
        self.inner.cache.invalidate(name);
        Ok(())
    }

    /// Read a bucket's stored descriptor, including in-flight reindex
    /// bookkeeping.
    pub async fn get_bucket(&self, name: &str) -> Result<BucketDescriptor> {
        let req = pipeline::run(&buckets::get::PIPELINE, || {
            Request::new(self.clone(), name)
        })
        .await?;
        match req.result {
            OpResult::Bucket(desc) => Ok(desc),
            _ => unreachable!("getBucket installs a descriptor result"),
        }
    }

    /// Delete a bucket and drop its backing relation and rows.
    pub async fn del_bucket(&self, name: &str) -> Result<()> {
        pipeline::run(&buckets::del::PIPELINE, || {
            Request::new(self.clone(), name)
        })
        .await?;
        self.inner.cache.invalidate(name);
        Ok(())
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketDescriptor>> {
        catalog::list(self.pool()).await
    }

    /// Write an object, returning its new etag. `opts.etag` carries the
    /// optimistic-concurrency precondition.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: serde_json::Value,
        opts: RequestOptions,
    ) -> Result<String> {
        let req = pipeline::run(&objects::put::PIPELINE, || {
            let mut req = Request::new(self.clone(), bucket);
            req.key = Some(key.to_string());
            req.value = Some(value.clone());
            req.opts = opts.clone();
            req
        })
        .await?;
        match req.result {
            OpResult::Etag(etag) => Ok(etag),
            _ => unreachable!("putObject installs an etag result"),
        }
    }

    /// Read one object by key.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        opts: RequestOptions,
    ) -> Result<StoredObject> {
        let req = pipeline::run(&objects::get::PIPELINE, || {
            let mut req = Request::new(self.clone(), bucket);
            req.key = Some(key.to_string());
            req.opts = opts.clone();
            req
        })
        .await?;
        match req.result {
            OpResult::Object(object) => Ok(object),
            _ => unreachable!("getObject installs an object result"),
        }
    }

    /// Delete one object by key, honoring the etag precondition.
    pub async fn del_object(&self, bucket: &str, key: &str, opts: RequestOptions) -> Result<()> {
        pipeline::run(&objects::del::PIPELINE, || {
            let mut req = Request::new(self.clone(), bucket);
            req.key = Some(key.to_string());
            req.opts = opts.clone();
            req
        })
        .await?;
        Ok(())
    }

    /// Query a bucket with an LDAP-style filter, streaming reconstructed
    /// objects as rows arrive. Compilation and database errors surface as
    /// the stream's first (and only) error item.
    pub fn find_objects(
        &self,
        bucket: &str,
        filter_str: &str,
        opts: RequestOptions,
    ) -> ReceiverStream<Result<StoredObject>> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let store = self.clone();
        let bucket = bucket.to_string();
        let filter_str = filter_str.to_string();

        tokio::spawn(async move {
            let sink = tx.clone();
            let outcome = pipeline::run(&objects::find::PIPELINE, || {
                let mut req = Request::new(store.clone(), bucket.clone());
                req.filter = Some(filter_str.clone());
                req.opts = opts.clone();
                req.rows = Some(tx.clone());
                req
            })
            .await;
            if let Err(err) = outcome {
                let _ = sink.send(Err(err)).await;
            }
        });
        ReceiverStream::new(rx)
    }

    /// Bulk-update indexed columns (not the stored JSON) on every row
    /// matching the filter. Returns the number of rows touched.
    pub async fn update_objects(
        &self,
        bucket: &str,
        fields: std::collections::BTreeMap<String, serde_json::Value>,
        filter_str: &str,
        opts: RequestOptions,
    ) -> Result<u64> {
        let req = pipeline::run(&objects::update::PIPELINE, || {
            let mut req = Request::new(self.clone(), bucket);
            req.fields = Some(fields.clone());
            req.filter = Some(filter_str.to_string());
            req.opts = opts.clone();
            req
        })
        .await?;
        match req.result {
            OpResult::Count(count) => Ok(count),
            _ => unreachable!("updateObjects installs a count result"),
        }
    }

    /// Bulk-delete every row matching the filter. Returns the number of
    /// rows deleted.
    pub async fn delete_many(
        &self,
        bucket: &str,
        filter_str: &str,
        opts: RequestOptions,
    ) -> Result<u64> {
        let req = pipeline::run(&objects::delete_many::PIPELINE, || {
            let mut req = Request::new(self.clone(), bucket);
            req.filter = Some(filter_str.to_string());
            req.opts = opts.clone();
            req
        })
        .await?;
        match req.result {
            OpResult::Count(count) => Ok(count),
            _ => unreachable!("deleteMany installs a count result"),
        }
    }

    /// Run a sequence of write entries atomically in one transaction.
    pub async fn batch(&self, entries: Vec<BatchEntry>) -> Result<Vec<BatchResult>> {
        let req = pipeline::run(&objects::batch::PIPELINE, || {
            let mut req = Request::new(self.clone(), "batch");
            req.batch = Some(entries.clone());
            req
        })
        .await?;
        match req.result {
            OpResult::Batch(results) => Ok(results),
            _ => unreachable!("batch installs its results"),
        }
    }

    /// Backfill up to `count` rows whose projections trail the bucket
    /// version. Call until `remaining` is false; the drained versions are
    /// then cleared from `reindex_active` and the filterable set grows.
    pub async fn reindex_objects(&self, bucket: &str, count: u64) -> Result<ReindexStatus> {
        let req = pipeline::run(&objects::reindex::PIPELINE, || {
            let mut req = Request::new(self.clone(), bucket);
            req.page_size = Some(count);
            req
        })
        .await?;
        self.inner.cache.invalidate(bucket);
        match req.result {
            OpResult::Reindex {
                processed,
                remaining,
            } => Ok(ReindexStatus {
                processed,
                remaining,
            }),
            _ => unreachable!("reindexObjects installs its status"),
        }
    }

    /// Liveness probe. A deep ping round-trips a query through the pool.
    pub async fn ping(&self, deep: bool) -> Result<()> {
        if deep {
            sqlx::query("SELECT name FROM buckets_config LIMIT 1")
                .fetch_optional(self.pool())
                .await?;
        }
        Ok(())
    }

    /// Drop one bucket's descriptor from the cache. The next request reads
    /// it fresh from the catalog.
    pub fn invalidate_bucket(&self, name: &str) {
        self.inner.cache.invalidate(name);
    }
}
