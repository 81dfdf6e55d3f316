/// The stable error taxonomy surfaced by every store operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("bucket {0} already exists")]
    BucketExists(String),

    #[error("bucket {name} version {current} is not less than {proposed}")]
    BucketVersion {
        name: String,
        current: u64,
        proposed: u64,
    },

    #[error("{0} is not a valid bucket name")]
    InvalidBucketName(String),

    #[error("invalid bucket config: {0}")]
    InvalidBucketConfig(String),

    #[error("trigger {0} is not registered")]
    NotFunction(String),

    #[error(transparent)]
    InvalidIndexType(#[from] models::CoercionError),

    #[error("invalid filter: {0}")]
    InvalidQuery(String),

    #[error("filter requires an index on {0}")]
    NotIndexed(String),

    #[error("etag conflict on {bucket}/{key}")]
    EtagConflict { bucket: String, key: String },

    #[error("{bucket}/{key} does not exist")]
    ObjectNotFound { bucket: String, key: String },

    #[error("unique attribute constraint violated: {0}")]
    UniqueAttribute(String),

    #[error("trigger {name} failed")]
    Trigger {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("request deadline exceeded")]
    Deadline,

    #[error("database error")]
    Database(#[source] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<Ok> = std::result::Result<Ok, Error>;

impl Error {
    /// A stable machine-readable name for the error kind, for wire layers
    /// and callers which dispatch on it.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BucketNotFound(_) => "BucketNotFound",
            Error::BucketExists(_) => "BucketExists",
            Error::BucketVersion { .. } => "BucketVersion",
            Error::InvalidBucketName(_) => "InvalidBucketName",
            Error::InvalidBucketConfig(_) => "InvalidBucketConfig",
            Error::NotFunction(_) => "NotFunction",
            Error::InvalidIndexType(_) => "InvalidIndexType",
            Error::InvalidQuery(_) => "InvalidQuery",
            Error::NotIndexed(_) => "NotIndexed",
            Error::EtagConflict { .. } => "EtagConflict",
            Error::ObjectNotFound { .. } => "ObjectNotFound",
            Error::UniqueAttribute(_) => "UniqueAttributeError",
            Error::Trigger { .. } => "Trigger",
            Error::Deadline => "Deadline",
            Error::Database(_) => "Database",
            Error::Internal(_) => "Internal",
        }
    }

    /// Transient errors may be retried by re-running the whole pipeline;
    /// everything else is fatal for the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Deadline => true,
            Error::Database(err) => is_transient_db(err),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.code().as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION) {
                return Error::UniqueAttribute(db.message().to_string());
            }
        }
        Error::Database(err)
    }
}

impl From<models::ValidationError> for Error {
    fn from(err: models::ValidationError) -> Self {
        match err {
            models::ValidationError::InvalidBucketName(name) => Error::InvalidBucketName(name),
            models::ValidationError::InvalidBucketConfig(msg) => Error::InvalidBucketConfig(msg),
        }
    }
}

impl From<filter::ParseError> for Error {
    fn from(err: filter::ParseError) -> Self {
        Error::InvalidQuery(err.to_string())
    }
}

const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

fn is_transient_db(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        other => matches!(
            other
                .as_database_error()
                .and_then(|db| db.code())
                .as_deref(),
            Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED)
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let cases = [
            (Error::BucketNotFound("b".into()), "BucketNotFound"),
            (Error::NotIndexed("name".into()), "NotIndexed"),
            (
                Error::EtagConflict {
                    bucket: "b".into(),
                    key: "k".into(),
                },
                "EtagConflict",
            ),
            (Error::UniqueAttribute("email".into()), "UniqueAttributeError"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn validation_errors_map_into_taxonomy() {
        let err: Error = models::ValidationError::InvalidBucketName("1x".into()).into();
        assert_eq!(err.code(), "InvalidBucketName");

        let err: Error = filter::ParseError::ApproxUnsupported.into();
        assert_eq!(err.code(), "InvalidQuery");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Deadline.is_transient());
        assert!(!Error::BucketNotFound("b".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
