use thiserror::Error;

/// Crate-wide error type.
///
/// Every fallible public entry point returns `Result<T, Error>`; internal
/// invariants that can never legitimately fail use `debug_assert!` instead of
/// a panic or an error variant.
#[derive(Error, Debug)]
pub enum Error {
    #[error("vector has dimension {found}, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("external id {0:?} already exists")]
    DuplicateId(String),

    #[error("shard {0} is not resident and no store is configured")]
    ShardNotLoaded(String),

    #[error("shard {0} has no value in the store")]
    ShardMissing(String),

    #[error("storage operation failed")]
    StorageFailure(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("bad magic number in shard file")]
    BadMagic,

    #[error("unsupported shard file version {0}")]
    UnsupportedVersion(u32),

    #[error("shard file truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("open called without either a store or a dimension")]
    NotOpenable,
}

impl Error {
    /// Wrap an opaque store-backend error as [`Error::StorageFailure`].
    pub fn storage<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::StorageFailure(Box::new(source))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
