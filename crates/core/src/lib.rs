//! The stratadb object manager and layered-query resolver.
//!
//! Versioned tables are stored as immutable content-addressed fragments: a
//! base snapshot plus a chain of single-parent deltas. This crate decides
//! which fragments a read needs, guarantees their local presence under a
//! bounded cache budget, deduplicates downloads across concurrent readers,
//! collapses hot delta chains into cached snapshots, and garbage-collects
//! whatever nothing references.

pub mod apply;
pub mod config;
pub mod error;
pub mod manager;
pub mod meta;
pub mod ostorage;
pub mod remote;
pub mod resolve;
pub mod util;
pub mod write;

pub use config::ObjectManagerConfig;
pub use error::{CacheError, ChangeLogError, FetchError, MetaError, ObjectError, Result};
pub use manager::{EnsuredObjects, ObjectManager};
pub use meta::{
    CacheStatus, MetaStore, ObjectFormat, ObjectLocation, ObjectMeta, SnapCacheEntry, TableKey,
    TableRef,
};
pub use ostorage::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use remote::{ExternalObjectHandler, Fetcher, HandlerRegistry, LocalPeer, ObjectPeer};
pub use resolve::{resolve_table, MaterializationPlan};
pub use write::{ChangeAction, ChangeEntry, ChangeSource};
