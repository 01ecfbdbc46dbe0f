use std::collections::HashMap;
use std::io;

use parking_lot::RwLock;
use stratadb_lib::ObjectId;

use super::ObjectStore;

/// In-memory implementation of [`ObjectStore`], for tests and in-process
/// peers.
#[derive(Default)]
pub struct MemoryObjectStore {
    map: RwLock<HashMap<ObjectId, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &ObjectId) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("object {id} does not exist"))
}

impl ObjectStore for MemoryObjectStore {
    fn contains(&self, id: &ObjectId) -> bool {
        self.map.read().contains_key(id)
    }

    fn write(&self, id: &ObjectId, bytes: &[u8]) -> io::Result<()> {
        self.map.write().insert(*id, bytes.to_vec());
        Ok(())
    }

    fn read(&self, id: &ObjectId) -> io::Result<Vec<u8>> {
        self.map.read().get(id).cloned().ok_or_else(|| not_found(id))
    }

    fn delete(&self, ids: &[ObjectId]) -> io::Result<()> {
        let mut map = self.map.write();
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }

    fn size(&self, id: &ObjectId) -> io::Result<u64> {
        self.map
            .read()
            .get(id)
            .map(|b| b.len() as u64)
            .ok_or_else(|| not_found(id))
    }

    fn list_all(&self) -> io::Result<Vec<ObjectId>> {
        Ok(self.map.read().keys().copied().collect())
    }
}
