use thiserror::Error;

pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("corrupt record payload: {0}")]
    CorruptPayload(String),
    #[error("{backend} backend does not support {operation}")]
    UnsupportedOperation {
        backend: &'static str,
        operation: &'static str,
    },
    #[error("upstream round trip failed: {0}")]
    Upstream(String),
    #[error("bucket pool for {0} is closed")]
    PoolClosed(String),
}

impl CacheError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::UnsupportedOperation { backend, operation }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }
}
