mod bucket;
mod diff;
mod types;

pub use bucket::{
    validate_bucket_name, BucketConfig, BucketDescriptor, BucketOptions, FieldIndex,
    ReindexActive, ValidationError, BUCKET_NAME_RE, FIELD_NAME_RE, RESERVED_BUCKETS,
};
pub use diff::{diff_index, IndexDiff};
pub use types::{
    canonical_ip, coerce, parse_subnet, string_form, uncoerce, ColumnValue, CoercionError,
    IndexType,
};
