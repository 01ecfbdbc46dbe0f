use std::io;

use stratadb_lib::ObjectId;

pub mod fs_object_store;
pub mod memory_object_store;

pub use fs_object_store::FsObjectStore;
pub use memory_object_store::MemoryObjectStore;

/// Byte-addressable storage of fragment payloads, keyed by object id.
///
/// Implementations must make writes atomic at object granularity: a partial
/// write never becomes visible under the object's id. Deleting an absent id
/// is not an error.
pub trait ObjectStore: Send + Sync {
    fn contains(&self, id: &ObjectId) -> bool;
    fn write(&self, id: &ObjectId, bytes: &[u8]) -> io::Result<()>;
    fn read(&self, id: &ObjectId) -> io::Result<Vec<u8>>;
    fn delete(&self, ids: &[ObjectId]) -> io::Result<()>;
    fn size(&self, id: &ObjectId) -> io::Result<u64>;
    fn list_all(&self) -> io::Result<Vec<ObjectId>>;
}
