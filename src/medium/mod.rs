use std::{future::Future, pin::Pin};

pub mod memory;
pub mod redis;

pub use memory::MemoryMedium;
pub use redis::{DocumentMode, RedisMedium, RedisOptions};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug)]
pub enum MediumError {
    NotFound { key: String },
    Unavailable(String),
    Command(String),
    Protocol(String),
}

impl std::fmt::Display for MediumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::Unavailable(e) => write!(f, "medium unavailable: {e}"),
            Self::Command(e) => write!(f, "medium rejected command: {e}"),
            Self::Protocol(e) => write!(f, "medium protocol error: {e}"),
        }
    }
}

impl std::error::Error for MediumError {}

impl From<std::io::Error> for MediumError {
    fn from(value: std::io::Error) -> Self {
        Self::Unavailable(value.to_string())
    }
}

/// Whole-document key/value storage.
///
/// Documents are opaque serialized strings; the medium never looks inside them.
pub trait Medium: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn ping(&self) -> BoxFuture<'_, Result<(), MediumError>>;

    fn put<'a>(&'a self, key: &'a str, document: String) -> BoxFuture<'a, Result<(), MediumError>>;

    /// Fails with [`MediumError::NotFound`] when nothing is stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<String, MediumError>>;

    /// Fails with [`MediumError::NotFound`] when nothing was removed.
    fn delete_one<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), MediumError>>;

    /// Returns how many of `keys` were actually removed.
    fn delete_many<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, MediumError>>;

    /// Keys starting with `prefix`, in no particular order.
    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, MediumError>>;
}
