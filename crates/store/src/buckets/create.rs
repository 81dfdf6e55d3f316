use futures::future::BoxFuture;

use crate::buckets;
use crate::catalog;
use crate::error::Result;
use crate::pipeline::{Handler, Pipeline, Request, TxnMode};

/// createBucket: validate, persist the descriptor, and build the backing
/// relation with its indexes, all in one transaction.
pub const PIPELINE: Pipeline = Pipeline {
    name: "createBucket",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

const HANDLERS: &[(&str, Handler)] = &[
    ("validateConfig", buckets::validate_config),
    ("insertConfig", insert_config),
    ("createTable", create_table),
    ("createIndexes", create_indexes),
];

fn insert_config(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let config = req.config.clone().expect("bucket request carries a config");
        let txn = req.txn.as_mut().expect("request transaction is installed");
        catalog::insert(txn, &name, &config).await
    })
}

fn create_table(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let config = req.config.clone().expect("bucket request carries a config");

        // `_rver` is deliberately absent here; the schema-evolution engine
        // adds it the first time reindex bookkeeping is needed.
        let mut columns = vec![
            "_id BIGSERIAL".to_string(),
            "_key TEXT PRIMARY KEY".to_string(),
            "_value TEXT NOT NULL".to_string(),
            "_etag CHAR(32) NOT NULL".to_string(),
            "_mtime BIGINT NOT NULL".to_string(),
            "_txn_snap BIGINT".to_string(),
        ];
        for (field, spec) in &config.index {
            columns.push(format!("{} {}", field, spec.ty.pg_type()));
        }

        let txn = req.txn.as_mut().expect("request transaction is installed");
        let sql = format!("CREATE TABLE {} ({})", name, columns.join(", "));
        sqlx::query(&sql).execute(&mut **txn).await?;

        let sql = format!("CREATE UNIQUE INDEX {}__id_idx ON {} (_id)", name, name);
        sqlx::query(&sql).execute(&mut **txn).await?;

        tracing::info!(bucket = %name, version = config.options.version, "bucket created");
        Ok(())
    })
}

fn create_indexes(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let config = req.config.clone().expect("bucket request carries a config");
        let txn = req.txn.as_mut().expect("request transaction is installed");
        buckets::create_field_indexes(txn, &name, config.index.iter()).await
    })
}
