use ipnetwork::IpNetwork;
use models::{coerce, uncoerce, ColumnValue, FieldIndex, IndexType};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A raw object row, as read back under `FOR UPDATE` on the write path.
#[derive(Clone, Debug)]
pub struct ObjectRecord {
    pub id: i64,
    pub key: String,
    pub value: serde_json::Value,
    pub etag: String,
    pub mtime: i64,
    pub txn_snap: Option<i64>,
    pub rver: Option<i64>,
}

/// An object returned to the caller: the reconstructed JSON value plus the
/// row's system fields.
#[derive(Clone, Debug, serde::Serialize)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(rename = "_id")]
    pub id: i64,
    #[serde(rename = "_etag")]
    pub etag: String,
    #[serde(rename = "_mtime")]
    pub mtime: i64,
    #[serde(rename = "_txn_snap", skip_serializing_if = "Option::is_none")]
    pub txn_snap: Option<i64>,
    /// Total matching rows, from `COUNT(*) OVER()`, when requested.
    #[serde(rename = "_count", skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

/// The opaque entity tag of a write: a stable hash of the bucket, key, and
/// serialized value. Unchanged writes produce unchanged etags.
pub fn compute_etag(bucket: &str, key: &str, value: &serde_json::Value) -> String {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(bucket.as_bytes());
    payload.push(0);
    payload.extend_from_slice(key.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.to_string().as_bytes());
    format!("{:032x}", xxhash_rust::xxh3::xxh3_128(&payload))
}

/// Project an object's indexed fields into typed column values. Fields the
/// object lacks (or holds as JSON null) are omitted and their columns stay
/// NULL.
pub fn index_object(
    schema: &BTreeMap<String, FieldIndex>,
    value: &serde_json::Value,
) -> Result<BTreeMap<String, ColumnValue>> {
    let mut columns = BTreeMap::new();
    for (field, spec) in schema {
        let Some(field_value) = value.get(field) else {
            continue;
        };
        match coerce(spec.ty, field_value)? {
            Some(column) => {
                columns.insert(field.clone(), column);
            }
            None => continue,
        }
    }
    Ok(columns)
}

/// Decode one projected column from a fetched row, by its declared type.
pub fn decode_column(row: &PgRow, field: &str, ty: IndexType) -> Result<Option<ColumnValue>> {
    let value = match ty {
        IndexType::String => row
            .try_get::<Option<String>, _>(field)?
            .map(ColumnValue::Text),
        IndexType::Number => row.try_get::<Option<i64>, _>(field)?.map(ColumnValue::Int),
        IndexType::Boolean => row
            .try_get::<Option<bool>, _>(field)?
            .map(ColumnValue::Bool),
        IndexType::Ip => row
            .try_get::<Option<IpNetwork>, _>(field)?
            .map(ColumnValue::Inet),
        IndexType::Subnet => row
            .try_get::<Option<IpNetwork>, _>(field)?
            .map(ColumnValue::Cidr),
        array => {
            let elem = array.element();
            let items: Option<Vec<ColumnValue>> = match elem {
                IndexType::String => row
                    .try_get::<Option<Vec<String>>, _>(field)?
                    .map(|v| v.into_iter().map(ColumnValue::Text).collect()),
                IndexType::Number => row
                    .try_get::<Option<Vec<i64>>, _>(field)?
                    .map(|v| v.into_iter().map(ColumnValue::Int).collect()),
                IndexType::Boolean => row
                    .try_get::<Option<Vec<bool>>, _>(field)?
                    .map(|v| v.into_iter().map(ColumnValue::Bool).collect()),
                IndexType::Ip => row
                    .try_get::<Option<Vec<IpNetwork>>, _>(field)?
                    .map(|v| v.into_iter().map(ColumnValue::Inet).collect()),
                IndexType::Subnet => row
                    .try_get::<Option<Vec<IpNetwork>>, _>(field)?
                    .map(|v| v.into_iter().map(ColumnValue::Cidr).collect()),
                _ => unreachable!("element() returns scalars"),
            };
            items.map(|items| ColumnValue::Array(elem, items))
        }
    };
    Ok(value)
}

/// Reconstruct an object from its row: parse `_value`, then overlay each
/// indexed column not in `ignore`. A NULL column deletes the key; a non-NULL
/// column overwrites the JSON unless the JSON already holds an array there.
pub fn reconstruct(
    bucket: &str,
    schema: &BTreeMap<String, FieldIndex>,
    ignore: &[String],
    key: String,
    raw_value: &str,
    columns: BTreeMap<String, Option<ColumnValue>>,
    id: i64,
    etag: String,
    mtime: i64,
    txn_snap: Option<i64>,
    count: Option<i64>,
) -> Result<StoredObject> {
    let mut value: serde_json::Value = serde_json::from_str(raw_value)
        .map_err(|err| Error::Internal(anyhow::anyhow!("parsing _value of {}/{}: {}", bucket, key, err)))?;

    for field in schema.keys() {
        if ignore.iter().any(|ignored| ignored == field) {
            continue;
        }
        match columns.get(field).and_then(|column| column.as_ref()) {
            None => {
                if let Some(object) = value.as_object_mut() {
                    object.remove(field);
                }
            }
            Some(column) => {
                let keep_existing = value.get(field).map_or(false, |v| v.is_array());
                if !keep_existing {
                    if let Some(object) = value.as_object_mut() {
                        object.insert(field.clone(), uncoerce(column));
                    }
                }
            }
        }
    }

    Ok(StoredObject {
        bucket: bucket.to_string(),
        key,
        value,
        id,
        etag,
        mtime,
        txn_snap,
        count,
    })
}

/// Decode a full result row (system columns, optional `_count`, and every
/// projected column) into a `StoredObject`.
pub fn object_from_row(
    bucket: &str,
    schema: &BTreeMap<String, FieldIndex>,
    ignore: &[String],
    with_count: bool,
    row: &PgRow,
) -> Result<StoredObject> {
    let key: String = row.try_get("_key")?;
    let raw_value: String = row.try_get("_value")?;
    let id: i64 = row.try_get("_id")?;
    let etag: String = row.try_get("_etag")?;
    let mtime: i64 = row.try_get("_mtime")?;
    let txn_snap: Option<i64> = row.try_get("_txn_snap")?;
    let count: Option<i64> = if with_count {
        Some(row.try_get("_count")?)
    } else {
        None
    };

    let mut columns = BTreeMap::new();
    for (field, spec) in schema {
        columns.insert(field.clone(), decode_column(row, field, spec.ty)?);
    }
    reconstruct(
        bucket, schema, ignore, key, &raw_value, columns, id, etag, mtime, txn_snap, count,
    )
}

/// Decode the write path's `FOR UPDATE` row.
pub fn record_from_row(bucket: &str, row: &PgRow) -> Result<ObjectRecord> {
    let key: String = row.try_get("_key")?;
    let raw_value: String = row.try_get("_value")?;
    let value = serde_json::from_str(&raw_value).map_err(|err| {
        Error::Internal(anyhow::anyhow!("parsing _value of {}/{}: {}", bucket, key, err))
    })?;
    Ok(ObjectRecord {
        id: row.try_get("_id")?,
        key,
        value,
        etag: row.try_get("_etag")?,
        mtime: row.try_get("_mtime")?,
        txn_snap: row.try_get("_txn_snap")?,
        rver: row.try_get("_rver").unwrap_or(None),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use models::FieldIndex;
    use serde_json::json;

    fn schema(fields: &[(&str, IndexType)]) -> BTreeMap<String, FieldIndex> {
        fields
            .iter()
            .map(|(name, ty)| {
                (
                    name.to_string(),
                    FieldIndex {
                        ty: *ty,
                        unique: false,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn etag_is_stable_and_value_sensitive() {
        let a = compute_etag("people", "p1", &json!({"age": 30}));
        let b = compute_etag("people", "p1", &json!({"age": 30}));
        let c = compute_etag("people", "p1", &json!({"age": 31}));
        let d = compute_etag("people", "p2", &json!({"age": 30}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn index_object_projects_present_fields() {
        let schema = schema(&[
            ("age", IndexType::Number),
            ("name", IndexType::String),
            ("tags", IndexType::StringArray),
        ]);
        let columns = index_object(
            &schema,
            &json!({"name": "a", "age": 30, "extra": true}),
        )
        .unwrap();

        assert_eq!(columns.get("age"), Some(&ColumnValue::Int(30)));
        assert_eq!(
            columns.get("name"),
            Some(&ColumnValue::Text("a".to_string()))
        );
        // Absent fields stay NULL.
        assert!(!columns.contains_key("tags"));
        // Unindexed fields are not projected.
        assert!(!columns.contains_key("extra"));
    }

    #[test]
    fn index_object_rejects_bad_values() {
        let schema = schema(&[("age", IndexType::Number)]);
        let err = index_object(&schema, &json!({"age": "unknown"})).unwrap_err();
        assert_eq!(err.code(), "InvalidIndexType");
    }

    #[test]
    fn reconstruct_round_trips_projection() {
        let schema = schema(&[("age", IndexType::Number), ("name", IndexType::String)]);
        let value = json!({"name": "a", "age": 30, "note": "kept"});
        let columns = index_object(&schema, &value)
            .unwrap()
            .into_iter()
            .map(|(field, column)| (field, Some(column)))
            .collect();

        let object = reconstruct(
            "people",
            &schema,
            &[],
            "p1".to_string(),
            &value.to_string(),
            columns,
            1,
            "etag".to_string(),
            1_700_000_000_000,
            None,
            None,
        )
        .unwrap();
        assert_eq!(object.value, value);
    }

    #[test]
    fn reconstruct_null_column_deletes_key() {
        let schema = schema(&[("age", IndexType::Number)]);
        let mut columns = BTreeMap::new();
        columns.insert("age".to_string(), None);

        let object = reconstruct(
            "people",
            &schema,
            &[],
            "p1".to_string(),
            r#"{"age": 30, "name": "a"}"#,
            columns,
            1,
            "etag".to_string(),
            1,
            None,
            None,
        )
        .unwrap();
        assert_eq!(object.value, json!({"name": "a"}));
    }

    #[test]
    fn reconstruct_column_overwrites_unless_json_array() {
        let schema = schema(&[
            ("age", IndexType::Number),
            ("tags", IndexType::StringArray),
        ]);
        let mut columns = BTreeMap::new();
        // Column disagrees with JSON; the column wins.
        columns.insert("age".to_string(), Some(ColumnValue::Int(31)));
        // JSON already holds an array; it is preserved.
        columns.insert(
            "tags".to_string(),
            Some(ColumnValue::Array(
                IndexType::String,
                vec![ColumnValue::Text("projected".to_string())],
            )),
        );

        let object = reconstruct(
            "people",
            &schema,
            &[],
            "p1".to_string(),
            r#"{"age": 30, "tags": ["original"]}"#,
            columns,
            1,
            "etag".to_string(),
            1,
            None,
            None,
        )
        .unwrap();
        assert_eq!(object.value, json!({"age": 31, "tags": ["original"]}));
    }

    #[test]
    fn reconstruct_honors_ignore_list() {
        let schema = schema(&[("age", IndexType::Number)]);
        let mut columns = BTreeMap::new();
        columns.insert("age".to_string(), Some(ColumnValue::Int(99)));

        let object = reconstruct(
            "people",
            &schema,
            &["age".to_string()],
            "p1".to_string(),
            r#"{"age": 30}"#,
            columns,
            1,
            "etag".to_string(),
            1,
            None,
            None,
        )
        .unwrap();
        assert_eq!(object.value, json!({"age": 30}));
    }
}
