use crate::types::IndexType;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

lazy_static! {
    // A bucket name is a letter followed by up to 62 word characters,
    // so it can be embedded as a relation name without quoting.
    pub static ref BUCKET_NAME_RE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,62}$").unwrap();
    // Indexed field names become column names. A leading underscore is
    // reserved for system columns.
    pub static ref FIELD_NAME_RE: Regex = Regex::new(r"^[a-z][a-z0-9_]*$").unwrap();
}

/// Bucket names which are reserved for the store itself.
pub const RESERVED_BUCKETS: &[&str] = &["moray", "search"];

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is not a valid bucket name")]
    InvalidBucketName(String),
    #[error("invalid bucket config: {0}")]
    InvalidBucketConfig(String),
}

pub type Result<Ok> = std::result::Result<Ok, ValidationError>;

/// The index declaration of one bucket field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldIndex {
    #[serde(rename = "type")]
    pub ty: IndexType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
}

/// Bucket options. `version` is monotonically non-decreasing across
/// updates, with 0 treated as "legacy / always overwrite".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketOptions {
    #[serde(default)]
    pub version: u64,
}

/// Fields whose backing columns are still being backfilled, grouped by the
/// bucket version which introduced them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReindexActive(pub BTreeMap<u64, BTreeSet<String>>);

impl ReindexActive {
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|fields| fields.is_empty())
    }

    /// Whether any version still lists `field` as backfilling.
    pub fn contains_field(&self, field: &str) -> bool {
        self.0.values().any(|fields| fields.contains(field))
    }

    /// All fields still backfilling, across every version.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.values().flatten().map(String::as_str)
    }

    /// Merge `add` into the set for `version`, preserving set semantics.
    pub fn consolidate(&mut self, version: u64, add: impl IntoIterator<Item = String>) {
        let entry = self.0.entry(version).or_default();
        entry.extend(add);
        if entry.is_empty() {
            self.0.remove(&version);
        }
    }

    /// Drop every version at or below `version`, after its backfill drains.
    pub fn clear_through(&mut self, version: u64) {
        self.0.retain(|v, _| *v > version);
    }
}

/// The client-supplied definition of a bucket: its indexed fields, ordered
/// pre/post trigger names, and options. `pre` and `post` are names resolved
/// against the store's trigger registry when the bucket is loaded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    #[serde(default)]
    pub index: BTreeMap<String, FieldIndex>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<String>,
    #[serde(default)]
    pub options: BucketOptions,
}

impl BucketConfig {
    /// Parse a free-form JSON bucket configuration, mapping shape errors
    /// (non-object index, unknown field keys, unknown types, non-boolean
    /// unique, non-integer version) to `InvalidBucketConfig`.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| ValidationError::InvalidBucketConfig(err.to_string()))
    }

    /// Validate the bucket name and field names of this configuration.
    pub fn validate(&self, name: &str) -> Result<()> {
        validate_bucket_name(name)?;
        for field in self.index.keys() {
            if !FIELD_NAME_RE.is_match(field) {
                return Err(ValidationError::InvalidBucketConfig(format!(
                    "{} is not a valid indexed field name",
                    field
                )));
            }
        }
        Ok(())
    }
}

pub fn validate_bucket_name(name: &str) -> Result<()> {
    if !BUCKET_NAME_RE.is_match(name) || RESERVED_BUCKETS.contains(&name) {
        return Err(ValidationError::InvalidBucketName(name.to_string()));
    }
    Ok(())
}

/// The persisted schema and metadata of a bucket, as stored in the
/// `buckets_config` relation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketDescriptor {
    pub name: String,
    pub index: BTreeMap<String, FieldIndex>,
    pub pre: Vec<String>,
    pub post: Vec<String>,
    pub options: BucketOptions,
    #[serde(default)]
    pub reindex_active: ReindexActive,
    pub mtime: DateTime<Utc>,
}

impl BucketDescriptor {
    pub fn config(&self) -> BucketConfig {
        BucketConfig {
            index: self.index.clone(),
            pre: self.pre.clone(),
            post: self.post.clone(),
            options: self.options,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn parse(v: serde_json::Value) -> serde_json::Value {
        match BucketConfig::from_value(v) {
            Ok(cfg) => serde_json::to_value(&cfg).unwrap(),
            Err(err) => serde_json::Value::String(err.to_string()),
        }
    }

    #[test]
    fn config_round_trip() {
        insta::assert_json_snapshot!(
            parse(json!({
                "index": {
                    "age": {"type": "number"},
                    "email": {"type": "string", "unique": true},
                },
                "pre": ["audit"],
                "options": {"version": 2},
            })),
            @r###"
        {
          "index": {
            "age": {
              "type": "number"
            },
            "email": {
              "type": "string",
              "unique": true
            }
          },
          "pre": [
            "audit"
          ],
          "options": {
            "version": 2
          }
        }
        "###
        );
    }

    #[test]
    fn config_shape_errors() {
        // Non-object index.
        assert!(parse(json!({"index": 42})).is_string());
        // Unknown key under a field's sub-object.
        assert!(parse(json!({"index": {"a": {"type": "string", "stored": true}}})).is_string());
        // Unknown type tag.
        assert!(parse(json!({"index": {"a": {"type": "uuid"}}})).is_string());
        // Non-boolean unique.
        assert!(parse(json!({"index": {"a": {"type": "string", "unique": "yes"}}})).is_string());
        // Non-integer version.
        assert!(parse(json!({"options": {"version": "two"}})).is_string());
        assert!(parse(json!({"options": {"version": -1}})).is_string());
    }

    #[test]
    fn bucket_name_rules() {
        assert!(validate_bucket_name("people").is_ok());
        assert!(validate_bucket_name("p2_x").is_ok());
        // Exactly 63 characters is accepted; 64 is rejected.
        let name63 = "a".repeat(63);
        let name64 = "a".repeat(64);
        assert!(validate_bucket_name(&name63).is_ok());
        assert!(validate_bucket_name(&name64).is_err());

        assert!(validate_bucket_name("1people").is_err());
        assert!(validate_bucket_name("has-dash").is_err());
        assert!(validate_bucket_name("").is_err());
        assert!(validate_bucket_name("moray").is_err());
        assert!(validate_bucket_name("search").is_err());
    }

    #[test]
    fn field_name_rules() {
        let cfg = BucketConfig::from_value(json!({
            "index": {"_mtime": {"type": "number"}},
        }))
        .unwrap();
        insta::assert_snapshot!(
            cfg.validate("people").unwrap_err(),
            @"invalid bucket config: _mtime is not a valid indexed field name");
    }

    #[test]
    fn reindex_active_consolidation() {
        let mut active = ReindexActive::default();
        active.consolidate(2, ["name".to_string(), "addr".to_string()]);
        active.consolidate(2, ["name".to_string()]); // no duplicates
        active.consolidate(3, ["zip".to_string()]);

        assert!(active.contains_field("name"));
        assert!(!active.contains_field("age"));
        assert_eq!(active.fields().count(), 3);

        active.clear_through(2);
        assert!(!active.contains_field("name"));
        assert!(active.contains_field("zip"));
        active.clear_through(3);
        assert!(active.is_empty());
    }

    #[test]
    fn reindex_active_serde_uses_version_keys() {
        let mut active = ReindexActive::default();
        active.consolidate(2, ["name".to_string()]);
        insta::assert_json_snapshot!(active, @r###"
        {
          "2": [
            "name"
          ]
        }
        "###);

        let parsed: ReindexActive =
            serde_json::from_value(json!({"2": ["name"]})).unwrap();
        assert_eq!(parsed, active);
    }
}
