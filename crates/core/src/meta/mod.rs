//! The metadata store: durable row-level truth for every object, location,
//! table binding, cache entry, collapsed snapshot and miss-log line.
//!
//! Rows live in memory under per-table locks and write through to sled
//! trees, which are reloaded wholesale on open. All operations are atomic
//! with respect to each other; the cache-status table additionally carries a
//! condvar so readers can wait for an in-flight object to become ready.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use stratadb_lib::{ObjectId, ObjectIndex, TableSchema};

use crate::error::MetaError;
use crate::util::retry_with_backoff;

const TREE_OBJECTS: &str = "objects";
const TREE_LOCATIONS: &str = "object_locations";
const TREE_TABLES: &str = "tables";
const TREE_CACHE: &str = "object_cache_status";
const TREE_SNAP_CACHE: &str = "snap_cache";
const TREE_SNAP_MISSES: &str = "snap_cache_misses";

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BASE_DELAY: Duration = Duration::from_millis(20);

/// Whether a fragment is a standalone snapshot or a delta over its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectFormat {
    #[serde(rename = "SNAP")]
    Snap,
    #[serde(rename = "DIFF")]
    Diff,
}

/// One row of the `objects` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub object_id: ObjectId,
    pub format: ObjectFormat,
    pub parent_id: Option<ObjectId>,
    pub namespace: String,
    pub size: u64,
    pub index: ObjectIndex,
}

/// External retrieval address of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub object_id: ObjectId,
    pub url: String,
    pub protocol: String,
}

/// Cache bookkeeping for an object held in the local physical store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub ready: bool,
    pub refcount: u64,
    pub last_used: SystemTime,
}

/// A collapsed snapshot standing in for the delta chain ending at `diff_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapCacheEntry {
    pub snap_id: ObjectId,
    pub diff_id: ObjectId,
    pub size: u64,
}

/// Identity of a table at an image.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub namespace: String,
    pub repository: String,
    pub image_hash: String,
    pub table_name: String,
}

impl TableKey {
    pub fn new(
        namespace: impl Into<String>,
        repository: impl Into<String>,
        image_hash: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        TableKey {
            namespace: namespace.into(),
            repository: repository.into(),
            image_hash: image_hash.into(),
            table_name: table_name.into(),
        }
    }

    /// The schema-qualified name change sources know the table under.
    pub fn schema_name(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }

    /// The same table at a different image.
    pub fn at_image(&self, image_hash: impl Into<String>) -> Self {
        TableKey {
            image_hash: image_hash.into(),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct TableBinding {
    schema: TableSchema,
    object_id: ObjectId,
}

/// A resolved table binding: what `ensure_objects` takes as input.
#[derive(Clone, Debug, PartialEq)]
pub struct TableRef {
    pub key: TableKey,
    pub schema: TableSchema,
    pub object_id: ObjectId,
}

/// What happened to a cache-status row during a claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// We created the row; the object is ours to prepare.
    Inserted,
    /// The row existed; refcount bumped, readiness as observed.
    Bumped { ready: bool },
}

/// Result of waiting for an object to become ready.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Ready,
    /// The row disappeared; the preparer rolled back or the object was
    /// evicted.
    Absent,
    TimedOut,
}

pub struct MetaStore {
    db: sled::Db,
    t_objects: sled::Tree,
    t_locations: sled::Tree,
    t_tables: sled::Tree,
    t_cache: sled::Tree,
    t_snap_cache: sled::Tree,
    t_snap_misses: sled::Tree,

    objects: RwLock<HashMap<ObjectId, ObjectMeta>>,
    locations: RwLock<HashMap<ObjectId, ObjectLocation>>,
    tables: RwLock<HashMap<TableKey, TableBinding>>,
    cache: Mutex<HashMap<ObjectId, CacheStatus>>,
    cache_ready: Condvar,
    /// diff id -> (snap id, size); the unique key on `diff_id` is what makes
    /// insert-as-lock work.
    snap_cache: Mutex<HashMap<ObjectId, (ObjectId, u64)>>,
    misses: Mutex<Vec<(u64, ObjectId, SystemTime)>>,
    miss_seq: AtomicU64,
}

fn load_tree<K, V>(
    tree: &sled::Tree,
    name: &'static str,
    mut key_of: impl FnMut(&[u8]) -> Option<K>,
) -> Result<HashMap<K, V>, MetaError>
where
    K: std::hash::Hash + Eq,
    V: DeserializeOwned,
{
    let mut map = HashMap::new();
    for entry in tree.iter() {
        let (key, value) = entry?;
        let Some(key) = key_of(&key) else {
            log::warn!("skipping row with unreadable key in `{name}`");
            continue;
        };
        let value = serde_json::from_slice(&value)
            .map_err(|source| MetaError::Codec { tree: name, source })?;
        map.insert(key, value);
    }
    Ok(map)
}

fn object_key(bytes: &[u8]) -> Option<ObjectId> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

impl MetaStore {
    /// Open (or create) the store at `path` and load every table.
    ///
    /// Refcounts are an in-process liveness signal; any non-zero count found
    /// on open is a leak from an abnormal termination and is repaired to
    /// zero.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaError> {
        let db = sled::open(path)?;
        let t_objects = db.open_tree(TREE_OBJECTS)?;
        let t_locations = db.open_tree(TREE_LOCATIONS)?;
        let t_tables = db.open_tree(TREE_TABLES)?;
        let t_cache = db.open_tree(TREE_CACHE)?;
        let t_snap_cache = db.open_tree(TREE_SNAP_CACHE)?;
        let t_snap_misses = db.open_tree(TREE_SNAP_MISSES)?;

        let objects = load_tree(&t_objects, TREE_OBJECTS, object_key)?;
        let locations = load_tree(&t_locations, TREE_LOCATIONS, object_key)?;
        let tables: HashMap<TableKey, TableBinding> =
            load_tree(&t_tables, TREE_TABLES, |k| serde_json::from_slice(k).ok())?;
        let mut cache: HashMap<ObjectId, CacheStatus> =
            load_tree(&t_cache, TREE_CACHE, object_key)?;
        let snap_cache = load_tree(&t_snap_cache, TREE_SNAP_CACHE, object_key)?;

        let mut misses = Vec::new();
        for entry in t_snap_misses.iter() {
            let (key, value) = entry?;
            let seq = u64::from_be_bytes(key.as_ref().try_into().unwrap_or_default());
            let (diff_id, used_time) = serde_json::from_slice(&value)
                .map_err(|source| MetaError::Codec { tree: TREE_SNAP_MISSES, source })?;
            misses.push((seq, diff_id, used_time));
        }
        misses.sort_by_key(|(seq, _, _)| *seq);
        let miss_seq = misses.last().map(|(seq, _, _)| seq + 1).unwrap_or(0);

        let leaked = cache.values().filter(|row| row.refcount > 0).count();
        if leaked > 0 {
            log::warn!("repairing {leaked} leaked refcount(s) left by an unclean shutdown");
            for (id, row) in cache.iter_mut() {
                if row.refcount > 0 {
                    row.refcount = 0;
                    let bytes = serde_json::to_vec(row)
                        .map_err(|source| MetaError::Codec { tree: TREE_CACHE, source })?;
                    t_cache.insert(id.to_string().as_bytes(), bytes)?;
                }
            }
        }

        Ok(MetaStore {
            db,
            t_objects,
            t_locations,
            t_tables,
            t_cache,
            t_snap_cache,
            t_snap_misses,
            objects: RwLock::new(objects),
            locations: RwLock::new(locations),
            tables: RwLock::new(tables),
            cache: Mutex::new(cache),
            cache_ready: Condvar::new(),
            snap_cache: Mutex::new(snap_cache),
            misses: Mutex::new(misses),
            miss_seq: AtomicU64::new(miss_seq),
        })
    }

    /// Durability checkpoint; the commit boundary between phases.
    pub fn flush(&self) -> Result<(), MetaError> {
        self.persist("flush", || self.db.flush().map(|_| ()))
    }

    fn persist(
        &self,
        what: &'static str,
        op: impl FnMut() -> Result<(), sled::Error>,
    ) -> Result<(), MetaError> {
        retry_with_backoff(what, PERSIST_ATTEMPTS, PERSIST_BASE_DELAY, op)
            .map_err(MetaError::Unavailable)
    }

    fn put<V: Serialize>(
        &self,
        tree: &sled::Tree,
        what: &'static str,
        key: &[u8],
        value: &V,
    ) -> Result<(), MetaError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|source| MetaError::Codec { tree: what, source })?;
        self.persist(what, || tree.insert(key, bytes.as_slice()).map(|_| ()))
    }

    fn del(&self, tree: &sled::Tree, what: &'static str, key: &[u8]) -> Result<(), MetaError> {
        self.persist(what, || tree.remove(key).map(|_| ()))
    }

    // ------------------------------------------------------------------
    // objects

    /// Register a single object. Registering the same id again is a no-op;
    /// payloads are immutable so the row cannot change meaning.
    pub fn register_object(&self, meta: ObjectMeta) -> Result<(), MetaError> {
        self.register_objects(vec![meta], None)
    }

    /// Bulk registration, optionally rewriting the namespace (used when
    /// pulling another namespace's objects into our own).
    pub fn register_objects(
        &self,
        metas: Vec<ObjectMeta>,
        namespace: Option<&str>,
    ) -> Result<(), MetaError> {
        let mut objects = self.objects.write();
        for mut meta in metas {
            if let Some(namespace) = namespace {
                meta.namespace = namespace.to_owned();
            }
            if objects.contains_key(&meta.object_id) {
                continue;
            }
            self.put(
                &self.t_objects,
                "register object",
                meta.object_id.to_string().as_bytes(),
                &meta,
            )?;
            objects.insert(meta.object_id, meta);
        }
        Ok(())
    }

    pub fn get_object(&self, id: &ObjectId) -> Option<ObjectMeta> {
        self.objects.read().get(id).cloned()
    }

    pub fn get_object_meta(&self, ids: &[ObjectId]) -> Vec<ObjectMeta> {
        let objects = self.objects.read();
        ids.iter().filter_map(|id| objects.get(id).cloned()).collect()
    }

    pub fn get_existing_objects(&self) -> HashSet<ObjectId> {
        self.objects.read().keys().copied().collect()
    }

    /// The object and all its ancestors, head first, root snapshot last.
    pub fn get_all_required_objects(&self, head: &ObjectId) -> Result<Vec<ObjectId>, MetaError> {
        let objects = self.objects.read();
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut current = *head;
        loop {
            if !seen.insert(current) {
                // A cycle here means corrupt metadata; stop walking.
                log::warn!("object parent chain of {head} contains a cycle at {current}");
                break;
            }
            let meta = objects
                .get(&current)
                .ok_or(MetaError::UnknownObject(current))?;
            path.push(current);
            match meta.parent_id {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(path)
    }

    /// Drop metadata rows (objects and locations) for `ids`.
    pub fn delete_object_meta(&self, ids: &[ObjectId]) -> Result<(), MetaError> {
        let mut objects = self.objects.write();
        let mut locations = self.locations.write();
        for id in ids {
            let key = id.to_string();
            if objects.remove(id).is_some() {
                self.del(&self.t_objects, "delete object", key.as_bytes())?;
            }
            if locations.remove(id).is_some() {
                self.del(&self.t_locations, "delete location", key.as_bytes())?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // locations

    /// Register external locations, skipping objects that already have one.
    pub fn register_object_locations(
        &self,
        new_locations: Vec<ObjectLocation>,
    ) -> Result<(), MetaError> {
        let mut locations = self.locations.write();
        for location in new_locations {
            if locations.contains_key(&location.object_id) {
                continue;
            }
            self.put(
                &self.t_locations,
                "register location",
                location.object_id.to_string().as_bytes(),
                &location,
            )?;
            locations.insert(location.object_id, location);
        }
        Ok(())
    }

    pub fn get_external_object_locations(&self, ids: &[ObjectId]) -> Vec<ObjectLocation> {
        let locations = self.locations.read();
        ids.iter().filter_map(|id| locations.get(id).cloned()).collect()
    }

    // ------------------------------------------------------------------
    // tables

    pub fn register_table(
        &self,
        key: TableKey,
        schema: TableSchema,
        object_id: ObjectId,
    ) -> Result<(), MetaError> {
        let binding = TableBinding { schema, object_id };
        let key_bytes = serde_json::to_vec(&key)
            .map_err(|source| MetaError::Codec { tree: TREE_TABLES, source })?;
        self.put(&self.t_tables, "register table", &key_bytes, &binding)?;
        self.tables.write().insert(key, binding);
        Ok(())
    }

    pub fn get_table(&self, key: &TableKey) -> Option<TableRef> {
        self.tables.read().get(key).map(|binding| TableRef {
            key: key.clone(),
            schema: binding.schema.clone(),
            object_id: binding.object_id,
        })
    }

    /// Distinct head objects referenced by any table binding.
    pub fn all_table_objects(&self) -> HashSet<ObjectId> {
        self.tables.read().values().map(|b| b.object_id).collect()
    }

    // ------------------------------------------------------------------
    // cache status

    /// Upsert cache rows for `ids`: new rows start `(ready=false,
    /// refcount=1)`, existing rows get their refcount bumped and their
    /// last-used time refreshed. An `Inserted` outcome makes the caller the
    /// object's preparer.
    pub fn claim_objects(&self, ids: &[ObjectId]) -> Result<Vec<ClaimOutcome>, MetaError> {
        let now = SystemTime::now();
        let mut cache = self.cache.lock();
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let (outcome, row) = match cache.get_mut(id) {
                Some(row) => {
                    row.refcount += 1;
                    row.last_used = now;
                    (ClaimOutcome::Bumped { ready: row.ready }, row.clone())
                }
                None => {
                    let row = CacheStatus {
                        ready: false,
                        refcount: 1,
                        last_used: now,
                    };
                    cache.insert(*id, row.clone());
                    (ClaimOutcome::Inserted, row)
                }
            };
            self.put(&self.t_cache, "claim object", id.to_string().as_bytes(), &row)?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Decrement refcounts. Rows stay behind at zero as eviction candidates.
    pub fn release_objects(&self, ids: &[ObjectId]) -> Result<(), MetaError> {
        let mut cache = self.cache.lock();
        for id in ids {
            if let Some(row) = cache.get_mut(id) {
                if row.refcount == 0 {
                    log::warn!("releasing {id} which is not claimed");
                } else {
                    row.refcount -= 1;
                }
                self.put(
                    &self.t_cache,
                    "release object",
                    id.to_string().as_bytes(),
                    row,
                )?;
            }
        }
        Ok(())
    }

    pub fn set_ready(&self, ids: &[ObjectId], ready: bool) -> Result<(), MetaError> {
        let mut cache = self.cache.lock();
        for id in ids {
            if let Some(row) = cache.get_mut(id) {
                row.ready = ready;
                self.put(&self.t_cache, "set ready", id.to_string().as_bytes(), row)?;
            }
        }
        drop(cache);
        self.cache_ready.notify_all();
        Ok(())
    }

    /// Block until `id` is ready, its row disappears, or `timeout` elapses.
    pub fn wait_ready(&self, id: &ObjectId, timeout: Duration) -> ReadyState {
        let deadline = Instant::now() + timeout;
        let mut cache = self.cache.lock();
        loop {
            match cache.get(id) {
                None => return ReadyState::Absent,
                Some(row) if row.ready => return ReadyState::Ready,
                Some(_) => {
                    if self
                        .cache_ready
                        .wait_until(&mut cache, deadline)
                        .timed_out()
                    {
                        return ReadyState::TimedOut;
                    }
                }
            }
        }
    }

    /// Remove rows for `ids` whose refcount is zero; returns the ids
    /// actually removed. The check-and-remove is atomic, so a concurrent
    /// claim either sees the row and pins it or finds it gone and re-inserts.
    pub fn remove_cache_rows_if_idle(&self, ids: &[ObjectId]) -> Result<Vec<ObjectId>, MetaError> {
        let mut cache = self.cache.lock();
        let mut removed = Vec::new();
        for id in ids {
            if cache.get(id).is_some_and(|row| row.refcount == 0) {
                cache.remove(id);
                self.del(&self.t_cache, "evict cache row", id.to_string().as_bytes())?;
                removed.push(*id);
            }
        }
        drop(cache);
        if !removed.is_empty() {
            self.cache_ready.notify_all();
        }
        Ok(removed)
    }

    pub fn cache_rows(&self) -> Vec<(ObjectId, CacheStatus)> {
        self.cache
            .lock()
            .iter()
            .map(|(id, row)| (*id, row.clone()))
            .collect()
    }

    pub fn get_cache_status(&self, id: &ObjectId) -> Option<CacheStatus> {
        self.cache.lock().get(id).cloned()
    }

    /// Backdate or adjust a row's last-used time.
    pub fn set_last_used(&self, id: &ObjectId, at: SystemTime) -> Result<(), MetaError> {
        let mut cache = self.cache.lock();
        if let Some(row) = cache.get_mut(id) {
            row.last_used = at;
            self.put(&self.t_cache, "set last used", id.to_string().as_bytes(), row)?;
        }
        Ok(())
    }

    /// Space held by the cache: ready objects (sized via the object tree)
    /// plus collapsed snapshots (sized via their cache entries).
    pub fn cache_occupancy(&self) -> u64 {
        let objects = self.objects.read();
        let cache = self.cache.lock();
        let from_objects: u64 = cache
            .iter()
            .filter(|(_, row)| row.ready)
            .filter_map(|(id, _)| objects.get(id).map(|m| m.size))
            .sum();
        let from_snaps: u64 = self.snap_cache.lock().values().map(|(_, size)| *size).sum();
        from_objects + from_snaps
    }

    // ------------------------------------------------------------------
    // snap cache

    /// Insert a snap-cache row keyed on `diff_id`. The unique key doubles as
    /// a lock: the winner of a promotion race gets `Ok` and materializes,
    /// losers get `DuplicateRegistration` and reuse the winner's snapshot.
    pub fn try_insert_snap_cache(
        &self,
        diff_id: ObjectId,
        snap_id: ObjectId,
    ) -> Result<(), MetaError> {
        let mut snap_cache = self.snap_cache.lock();
        if snap_cache.contains_key(&diff_id) {
            return Err(MetaError::DuplicateRegistration(diff_id.to_string()));
        }
        self.put(
            &self.t_snap_cache,
            "insert snap cache",
            diff_id.to_string().as_bytes(),
            &(snap_id, 0u64),
        )?;
        snap_cache.insert(diff_id, (snap_id, 0));
        Ok(())
    }

    /// Record the size of a just-materialized snapshot (deferred because the
    /// insert happens before the snapshot exists).
    pub fn update_snap_cache_size(&self, snap_id: &ObjectId, size: u64) -> Result<(), MetaError> {
        let mut snap_cache = self.snap_cache.lock();
        if let Some((diff_id, entry)) = snap_cache
            .iter_mut()
            .find(|(_, (snap, _))| snap == snap_id)
            .map(|(diff, entry)| (*diff, entry))
        {
            entry.1 = size;
            let value = *entry;
            self.put(
                &self.t_snap_cache,
                "update snap cache",
                diff_id.to_string().as_bytes(),
                &value,
            )?;
        }
        Ok(())
    }

    pub fn get_snap_cache_for(&self, diff_id: &ObjectId) -> Option<(ObjectId, u64)> {
        self.snap_cache.lock().get(diff_id).copied()
    }

    pub fn snap_cache_entries(&self) -> Vec<SnapCacheEntry> {
        self.snap_cache
            .lock()
            .iter()
            .map(|(diff_id, (snap_id, size))| SnapCacheEntry {
                snap_id: *snap_id,
                diff_id: *diff_id,
                size: *size,
            })
            .collect()
    }

    /// Drop snap-cache rows whose snapshot was just deleted.
    pub fn remove_snap_cache_by_snap(&self, snaps: &HashSet<ObjectId>) -> Result<(), MetaError> {
        let mut snap_cache = self.snap_cache.lock();
        let dead: Vec<ObjectId> = snap_cache
            .iter()
            .filter(|(_, (snap, _))| snaps.contains(snap))
            .map(|(diff, _)| *diff)
            .collect();
        for diff_id in dead {
            snap_cache.remove(&diff_id);
            self.del(
                &self.t_snap_cache,
                "remove snap cache",
                diff_id.to_string().as_bytes(),
            )?;
        }
        Ok(())
    }

    /// Drop a snap-cache row by its diff key (promotion rollback).
    pub fn remove_snap_cache_entry(&self, diff_id: &ObjectId) -> Result<(), MetaError> {
        let mut snap_cache = self.snap_cache.lock();
        if snap_cache.remove(diff_id).is_some() {
            self.del(
                &self.t_snap_cache,
                "remove snap cache",
                diff_id.to_string().as_bytes(),
            )?;
        }
        Ok(())
    }

    /// Drop snap-cache rows (returning the snap ids) for diffs outside
    /// `live`.
    pub fn prune_snap_cache(
        &self,
        live: &HashSet<ObjectId>,
    ) -> Result<Vec<ObjectId>, MetaError> {
        let mut snap_cache = self.snap_cache.lock();
        let dead: Vec<(ObjectId, ObjectId)> = snap_cache
            .iter()
            .filter(|(diff, _)| !live.contains(diff))
            .map(|(diff, (snap, _))| (*diff, *snap))
            .collect();
        let mut snaps = Vec::new();
        for (diff_id, snap_id) in dead {
            snap_cache.remove(&diff_id);
            self.del(
                &self.t_snap_cache,
                "prune snap cache",
                diff_id.to_string().as_bytes(),
            )?;
            snaps.push(snap_id);
        }
        Ok(snaps)
    }

    // ------------------------------------------------------------------
    // miss log

    pub fn store_snap_cache_miss(
        &self,
        diff_id: ObjectId,
        used_time: SystemTime,
    ) -> Result<(), MetaError> {
        let seq = self.miss_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.put(
            &self.t_snap_misses,
            "store miss",
            &seq.to_be_bytes(),
            &(diff_id, used_time),
        )?;
        self.misses.lock().push((seq, diff_id, used_time));
        Ok(())
    }

    /// Materialization requests for `diff_id` strictly after `cutoff`.
    pub fn recent_snap_cache_misses(&self, diff_id: &ObjectId, cutoff: SystemTime) -> u64 {
        self.misses
            .lock()
            .iter()
            .filter(|(_, diff, used)| diff == diff_id && *used > cutoff)
            .count() as u64
    }

    /// Drop miss rows for diffs outside `live`.
    pub fn prune_miss_log(&self, live: &HashSet<ObjectId>) -> Result<(), MetaError> {
        let mut misses = self.misses.lock();
        let mut kept = Vec::with_capacity(misses.len());
        for (seq, diff_id, used_time) in misses.iter() {
            if live.contains(diff_id) {
                kept.push((*seq, *diff_id, *used_time));
            } else {
                self.del(&self.t_snap_misses, "prune miss", &seq.to_be_bytes())?;
            }
        }
        *misses = kept;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratadb_lib::ObjectIndex;
    use tempfile::TempDir;

    fn object(format: ObjectFormat, parent: Option<ObjectId>, size: u64) -> ObjectMeta {
        ObjectMeta {
            object_id: ObjectId::random(),
            format,
            parent_id: parent,
            namespace: "test".into(),
            size,
            index: ObjectIndex::default(),
        }
    }

    fn open_store() -> (MetaStore, TempDir) {
        let dir = TempDir::with_prefix("metastore_test").unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn objects_survive_reopen() {
        let dir = TempDir::with_prefix("metastore_test").unwrap();
        let snap = object(ObjectFormat::Snap, None, 100);
        let diff = object(ObjectFormat::Diff, Some(snap.object_id), 10);
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.register_object(snap.clone()).unwrap();
            store.register_object(diff.clone()).unwrap();
            store
                .register_object_locations(vec![ObjectLocation {
                    object_id: snap.object_id,
                    url: "s3://bucket/object".into(),
                    protocol: "S3".into(),
                }])
                .unwrap();
            store.flush().unwrap();
        }
        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.get_object(&snap.object_id), Some(snap.clone()));
        assert_eq!(
            store.get_all_required_objects(&diff.object_id).unwrap(),
            vec![diff.object_id, snap.object_id]
        );
        assert_eq!(
            store.get_external_object_locations(&[snap.object_id])[0].protocol,
            "S3"
        );
    }

    #[test]
    fn chain_walk_fails_on_missing_parent() {
        let (store, _dir) = open_store();
        let orphan = object(ObjectFormat::Diff, Some(ObjectId::random()), 10);
        store.register_object(orphan.clone()).unwrap();
        assert!(matches!(
            store.get_all_required_objects(&orphan.object_id),
            Err(MetaError::UnknownObject(_))
        ));
    }

    #[test]
    fn registration_is_idempotent() {
        let (store, _dir) = open_store();
        let snap = object(ObjectFormat::Snap, None, 100);
        store.register_object(snap.clone()).unwrap();
        store.register_object(snap.clone()).unwrap();
        assert_eq!(store.get_existing_objects().len(), 1);

        // Locations don't stack either.
        let loc = |url: &str| ObjectLocation {
            object_id: snap.object_id,
            url: url.into(),
            protocol: "HTTP".into(),
        };
        store.register_object_locations(vec![loc("http://a")]).unwrap();
        store.register_object_locations(vec![loc("http://b")]).unwrap();
        assert_eq!(
            store.get_external_object_locations(&[snap.object_id])[0].url,
            "http://a"
        );
    }

    #[test]
    fn claim_bump_release() {
        let (store, _dir) = open_store();
        let id = ObjectId::random();
        assert_eq!(
            store.claim_objects(&[id]).unwrap(),
            vec![ClaimOutcome::Inserted]
        );
        assert_eq!(
            store.claim_objects(&[id]).unwrap(),
            vec![ClaimOutcome::Bumped { ready: false }]
        );
        store.set_ready(&[id], true).unwrap();
        assert_eq!(
            store.claim_objects(&[id]).unwrap(),
            vec![ClaimOutcome::Bumped { ready: true }]
        );
        let row = store.get_cache_status(&id).unwrap();
        assert_eq!(row.refcount, 3);
        store.release_objects(&[id]).unwrap();
        store.release_objects(&[id]).unwrap();
        store.release_objects(&[id]).unwrap();
        assert_eq!(store.get_cache_status(&id).unwrap().refcount, 0);
    }

    #[test]
    fn idle_rows_can_be_removed_pinned_cannot() {
        let (store, _dir) = open_store();
        let pinned = ObjectId::random();
        let idle = ObjectId::random();
        store.claim_objects(&[pinned, idle]).unwrap();
        store.release_objects(&[idle]).unwrap();
        let removed = store.remove_cache_rows_if_idle(&[pinned, idle]).unwrap();
        assert_eq!(removed, vec![idle]);
        assert!(store.get_cache_status(&pinned).is_some());
    }

    #[test]
    fn refcounts_are_repaired_on_open() {
        let dir = TempDir::with_prefix("metastore_test").unwrap();
        let id = ObjectId::random();
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.claim_objects(&[id]).unwrap();
            store.set_ready(&[id], true).unwrap();
            store.flush().unwrap();
            // Dropped without release: simulated crash while pinned.
        }
        let store = MetaStore::open(dir.path()).unwrap();
        let row = store.get_cache_status(&id).unwrap();
        assert_eq!(row.refcount, 0);
        assert!(row.ready);
    }

    #[test]
    fn snap_cache_insert_is_a_lock() {
        let (store, _dir) = open_store();
        let diff = ObjectId::random();
        let winner = ObjectId::random();
        let loser = ObjectId::random();
        store.try_insert_snap_cache(diff, winner).unwrap();
        assert!(matches!(
            store.try_insert_snap_cache(diff, loser),
            Err(MetaError::DuplicateRegistration(_))
        ));
        store.update_snap_cache_size(&winner, 512).unwrap();
        assert_eq!(store.get_snap_cache_for(&diff), Some((winner, 512)));
    }

    #[test]
    fn miss_log_counts_within_window() {
        let (store, _dir) = open_store();
        let diff = ObjectId::random();
        let other = ObjectId::random();
        let now = SystemTime::now();
        for age in [10, 20, 4000] {
            store
                .store_snap_cache_miss(diff, now - Duration::from_secs(age))
                .unwrap();
        }
        store.store_snap_cache_miss(other, now).unwrap();
        let cutoff = now - Duration::from_secs(3600);
        assert_eq!(store.recent_snap_cache_misses(&diff, cutoff), 2);
        assert_eq!(store.recent_snap_cache_misses(&other, cutoff), 1);
    }

    #[test]
    fn occupancy_counts_ready_objects_and_snaps() {
        let (store, _dir) = open_store();
        let ready = object(ObjectFormat::Snap, None, 100);
        let unready = object(ObjectFormat::Snap, None, 40);
        store.register_object(ready.clone()).unwrap();
        store.register_object(unready.clone()).unwrap();
        store
            .claim_objects(&[ready.object_id, unready.object_id])
            .unwrap();
        store.set_ready(&[ready.object_id], true).unwrap();

        // A collapsed snapshot contributes through its cache entry, not the
        // object tree.
        let snap = ObjectId::random();
        store.try_insert_snap_cache(ObjectId::random(), snap).unwrap();
        store.update_snap_cache_size(&snap, 30).unwrap();

        assert_eq!(store.cache_occupancy(), 130);
    }

    #[test]
    fn table_bindings_round_trip() {
        use stratadb_lib::{ColumnSchema, ColumnType};

        let dir = TempDir::with_prefix("metastore_test").unwrap();
        let key = TableKey::new("ns", "repo", "image1", "fruits");
        let schema = TableSchema::new(vec![ColumnSchema::new(0, "id", ColumnType::Integer, true)]);
        let head = ObjectId::random();
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.register_table(key.clone(), schema.clone(), head).unwrap();
            store.flush().unwrap();
        }
        let store = MetaStore::open(dir.path()).unwrap();
        let table = store.get_table(&key).unwrap();
        assert_eq!(table.object_id, head);
        assert_eq!(table.schema, schema);
        assert_eq!(store.all_table_objects(), HashSet::from([head]));
        assert!(store.get_table(&key.at_image("image2")).is_none());
    }
}
