use std::fs::{self, read_dir};
use std::io;
use std::path::{Path, PathBuf};

use stratadb_lib::ObjectId;
use tempfile::NamedTempFile;

use super::ObjectStore;

/// File-backed object store.
///
/// Objects are fanned out over 256 subdirectories named `00`..`ff` by the
/// first byte of the id, one file per object. Writes go through a temp file
/// and a rename so a crash never leaves a partial payload visible under the
/// object's id.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        for prefix in hex_prefixes() {
            match fs::create_dir(root.join(prefix)) {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => (),
                Err(err) => return Err(err),
            }
        }
        Ok(FsObjectStore { root })
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = hex::encode(id.as_bytes());
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl ObjectStore for FsObjectStore {
    fn contains(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    fn write(&self, id: &ObjectId, bytes: &[u8]) -> io::Result<()> {
        let path = self.object_path(id);
        let tmp = NamedTempFile::new_in(&self.root)?;
        fs::write(tmp.path(), bytes)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read(&self, id: &ObjectId) -> io::Result<Vec<u8>> {
        fs::read(self.object_path(id))
    }

    fn delete(&self, ids: &[ObjectId]) -> io::Result<()> {
        for id in ids {
            match fs::remove_file(self.object_path(id)) {
                Ok(()) => (),
                Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn size(&self, id: &ObjectId) -> io::Result<u64> {
        Ok(fs::metadata(self.object_path(id))?.len())
    }

    fn list_all(&self) -> io::Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for dir_entry in read_dir(&self.root)? {
            let dir = dir_entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(prefix) = dir.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if hex::decode(&prefix).map(|b| b.len() != 1).unwrap_or(true) {
                log::warn!("skipping unexpected directory in object store: {prefix}");
                continue;
            }
            for file_entry in read_dir(&dir)? {
                let file = file_entry?.path();
                let Some(rest) = file.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                match format!("o{prefix}{rest}").parse() {
                    Ok(id) => ids.push(id),
                    Err(err) => log::warn!("skipping unexpected file in object store: {err}"),
                }
            }
        }
        Ok(ids)
    }
}

fn hex_prefixes() -> impl Iterator<Item = String> {
    (0u16..256).map(|b| format!("{b:02x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FsObjectStore, TempDir) {
        let dir = TempDir::with_prefix("objstore_test").unwrap();
        let store = FsObjectStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn write_read_delete() {
        let (store, _dir) = setup();
        let id = ObjectId::random();
        assert!(!store.contains(&id));
        store.write(&id, b"payload").unwrap();
        assert!(store.contains(&id));
        assert_eq!(store.read(&id).unwrap(), b"payload");
        assert_eq!(store.size(&id).unwrap(), 7);
        store.delete(&[id]).unwrap();
        assert!(!store.contains(&id));
        // Deleting again is fine.
        store.delete(&[id]).unwrap();
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::with_prefix("objstore_test").unwrap();
        let id = ObjectId::random();
        {
            let store = FsObjectStore::open(dir.path()).unwrap();
            store.write(&id, b"durable").unwrap();
        }
        let store = FsObjectStore::open(dir.path()).unwrap();
        assert_eq!(store.read(&id).unwrap(), b"durable");
        assert_eq!(store.list_all().unwrap(), vec![id]);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let (store, _dir) = setup();
        let id = ObjectId::random();
        store.write(&id, b"same").unwrap();
        store.write(&id, b"same").unwrap();
        assert_eq!(store.read(&id).unwrap(), b"same");
    }

    #[test]
    fn list_all_spans_prefixes() {
        let (store, _dir) = setup();
        let mut ids: Vec<ObjectId> = (0..16).map(|_| ObjectId::random()).collect();
        for id in &ids {
            store.write(id, b"x").unwrap();
        }
        let mut listed = store.list_all().unwrap();
        listed.sort();
        ids.sort();
        assert_eq!(listed, ids);
    }
}
