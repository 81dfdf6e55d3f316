//! Bucket catalog operations: create, update (schema evolution), get, and
//! delete, each a handler pipeline over the shared request record.

pub mod create;
pub mod del;
pub mod get;
pub mod update;

use futures::future::BoxFuture;
use models::FieldIndex;
use sqlx::{Postgres, Transaction};

use crate::error::Result;
use crate::pipeline::Request;

/// Validate the incoming configuration: bucket and field names, and that
/// every named trigger resolves against the registry.
pub(crate) fn validate_config(req: &mut Request) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let config = req.config.as_ref().expect("bucket request carries a config");
        config.validate(&req.bucket_name)?;
        req.store.triggers().resolve(&config.pre)?;
        req.store.triggers().resolve(&config.post)?;
        Ok(())
    })
}

pub(crate) fn index_name(bucket: &str, field: &str) -> String {
    format!("{}_{}_idx", bucket, field)
}

/// DDL for one field's index: GIN for array columns, BTREE otherwise,
/// partial over non-NULL values. Unique fields get a UNIQUE btree index
/// instead.
pub(crate) fn create_index_sql(bucket: &str, field: &str, spec: &FieldIndex) -> String {
    if spec.unique {
        format!(
            "CREATE UNIQUE INDEX {} ON {} ({})",
            index_name(bucket, field),
            bucket,
            field
        )
    } else {
        format!(
            "CREATE INDEX {} ON {} USING {} ({}) WHERE {} IS NOT NULL",
            index_name(bucket, field),
            bucket,
            spec.ty.index_method(),
            field,
            field
        )
    }
}

pub(crate) async fn create_field_indexes<'f>(
    txn: &mut Transaction<'static, Postgres>,
    bucket: &str,
    fields: impl Iterator<Item = (&'f String, &'f FieldIndex)>,
) -> Result<()> {
    for (field, spec) in fields {
        let sql = create_index_sql(bucket, field, spec);
        tracing::debug!(%bucket, %field, "creating index");
        sqlx::query(&sql).execute(&mut **txn).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use models::IndexType;

    #[test]
    fn index_ddl() {
        let plain = FieldIndex {
            ty: IndexType::Number,
            unique: false,
        };
        insta::assert_snapshot!(
            create_index_sql("people", "age", &plain),
            @"CREATE INDEX people_age_idx ON people USING BTREE (age) WHERE age IS NOT NULL");

        let array = FieldIndex {
            ty: IndexType::StringArray,
            unique: false,
        };
        insta::assert_snapshot!(
            create_index_sql("people", "tags", &array),
            @"CREATE INDEX people_tags_idx ON people USING GIN (tags) WHERE tags IS NOT NULL");

        let unique = FieldIndex {
            ty: IndexType::String,
            unique: true,
        };
        insta::assert_snapshot!(
            create_index_sql("people", "email", &unique),
            @"CREATE UNIQUE INDEX people_email_idx ON people (email)");
    }
}
