use futures::future::BoxFuture;

use crate::catalog;
use crate::error::{Error, Result};
use crate::pipeline::{Handler, Pipeline, Request, TxnMode};

/// delBucket: remove the descriptor row and drop the backing relation.
pub const PIPELINE: Pipeline = Pipeline {
    name: "delBucket",
    mode: TxnMode::ReadWrite,
    retries: 2,
    handlers: HANDLERS,
};

const HANDLERS: &[(&str, Handler)] = &[
    ("deleteConfig", delete_config),
    ("dropTable", drop_table),
];

fn delete_config(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");
        if !catalog::delete(txn, &name).await? {
            return Err(Error::BucketNotFound(name));
        }
        Ok(())
    })
}

fn drop_table(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let name = req.bucket_name.clone();
        let txn = req.txn.as_mut().expect("request transaction is installed");
        let sql = format!("DROP TABLE {}", name);
        sqlx::query(&sql).execute(&mut **txn).await?;
        tracing::info!(bucket = %name, "bucket deleted");
        Ok(())
    })
}
