use std::io;

use thiserror::Error;

use stratadb_lib::{ObjectId, PayloadError};

/// Errors from the metadata store.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),
    #[error("object {0} is not registered")]
    UnknownObject(ObjectId),
    #[error("corrupt metadata row in `{tree}`: {source}")]
    Codec {
        tree: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("metadata store unavailable: {0}")]
    Unavailable(#[from] sled::Error),
}

/// Errors from downloading or uploading physical objects.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{} object(s) could not be fetched: {missing:?}", missing.len())]
    Failed { missing: Vec<ObjectId> },
    #[error("no external object handler registered for protocol `{0}`")]
    UnknownProtocol(String),
    #[error("object {0} has no payload and no external location")]
    ObjectNotFound(ObjectId),
    #[error("failed to build fetch thread pool: {0}")]
    Pool(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from the cache manager.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("working set of {required} bytes exceeds the cache size of {cache_size} bytes")]
    CacheTooSmall { required: u64, cache_size: u64 },
    #[error("eviction cannot free {required} bytes (only {freeable} reclaimable); pinned by {pinned} object(s)")]
    InsufficientReclaimable {
        required: u64,
        freeable: u64,
        pinned: usize,
    },
    #[error("{} object(s) absent after fetch: {missing:?}", missing.len())]
    FetchIncomplete { missing: Vec<ObjectId> },
}

/// Change-log conflation violations. Fatal for the commit that produced the
/// log.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChangeLogError {
    #[error("malformed change log: key {0} inserted but already present")]
    DuplicateInsert(String),
    #[error("malformed change log: key {0} deleted twice")]
    DoubleDelete(String),
    #[error("malformed change log: key {0} updated after delete")]
    UpdateAfterDelete(String),
}

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    ChangeLog(#[from] ChangeLogError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ObjectError> = std::result::Result<T, E>;
