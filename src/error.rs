use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("offset {offset} is outside an archive of {size} bytes")]
    InvalidOffset { offset: u64, size: u64 },
    #[error("failed to map archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("table {0} does not exist")]
    MissingTable(crate::TableName),
    #[error("malformed range header {0:?}")]
    MalformedRangeHeader(String),
    #[error("invalid lookup request: {0}")]
    InvalidQuery(String),
    #[error("invalid YAML in configuration: {0}")]
    Catalog(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tile encoding failed: {0}")]
    Encode(#[from] mvt::Error),
}

impl Error {
    /// True for failures caused by the client's request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedRangeHeader(_) | Error::InvalidOffset { .. } | Error::InvalidQuery(_)
        )
    }
}
