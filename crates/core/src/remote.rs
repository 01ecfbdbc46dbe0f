//! Moving physical objects between stores: peer-to-peer transfer plus
//! pluggable per-protocol external location handlers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools as _;
use parking_lot::Mutex;
use rayon::prelude::*;

use stratadb_lib::ObjectId;

use crate::error::{FetchError, ObjectError};
use crate::meta::{MetaStore, ObjectLocation, ObjectMeta};
use crate::ostorage::ObjectStore;
use crate::util::pretty_size;

/// A peer holding objects and their metadata: another stratadb instance, in
/// process or behind a transport.
pub trait ObjectPeer: Send + Sync {
    fn get_object_meta(&self, ids: &[ObjectId]) -> Result<Vec<ObjectMeta>, ObjectError>;
    fn get_existing_objects(&self) -> Result<HashSet<ObjectId>, ObjectError>;
    fn read_object(&self, id: &ObjectId) -> Result<Vec<u8>, ObjectError>;
    fn write_object(&self, id: &ObjectId, bytes: &[u8]) -> Result<(), ObjectError>;
}

/// In-process peer over a metadata store and an object store.
pub struct LocalPeer {
    meta: Arc<MetaStore>,
    store: Arc<dyn ObjectStore>,
}

impl LocalPeer {
    pub fn new(meta: Arc<MetaStore>, store: Arc<dyn ObjectStore>) -> Self {
        LocalPeer { meta, store }
    }
}

impl ObjectPeer for LocalPeer {
    fn get_object_meta(&self, ids: &[ObjectId]) -> Result<Vec<ObjectMeta>, ObjectError> {
        Ok(self.meta.get_object_meta(ids))
    }

    fn get_existing_objects(&self) -> Result<HashSet<ObjectId>, ObjectError> {
        Ok(self.meta.get_existing_objects())
    }

    fn read_object(&self, id: &ObjectId) -> Result<Vec<u8>, ObjectError> {
        Ok(self.store.read(id)?)
    }

    fn write_object(&self, id: &ObjectId, bytes: &[u8]) -> Result<(), ObjectError> {
        if self.store.contains(id) {
            return Ok(());
        }
        Ok(self.store.write(id, bytes)?)
    }
}

/// Transfers objects to and from an external location (S3, HTTP, a shared
/// directory). Registered by protocol name; `download` receives `(id, url)`
/// pairs and must leave the payloads in `store`.
pub trait ExternalObjectHandler: Send + Sync {
    fn download_objects(
        &self,
        objects: &[(ObjectId, String)],
        store: &dyn ObjectStore,
    ) -> Result<(), FetchError>;

    /// Returns one URL per uploaded object, in input order.
    fn upload_objects(
        &self,
        objects: &[ObjectId],
        store: &dyn ObjectStore,
    ) -> Result<Vec<String>, FetchError>;
}

/// Protocol name -> handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ExternalObjectHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        protocol: impl Into<String>,
        handler: Arc<dyn ExternalObjectHandler>,
    ) {
        self.handlers.insert(protocol.into(), handler);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ExternalObjectHandler>> {
        self.handlers.get(protocol).cloned()
    }
}

/// Deduplicating object transfer over a bounded thread pool.
pub struct Fetcher {
    registry: HandlerRegistry,
    pool: rayon::ThreadPool,
}

impl Fetcher {
    pub fn new(registry: HandlerRegistry, pool_size: usize) -> Result<Self, FetchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("stratadb-fetch-{i}"))
            .build()
            .map_err(|e| FetchError::Pool(e.to_string()))?;
        Ok(Fetcher { registry, pool })
    }

    /// Fetch `ids` into `store`, skipping objects already present.
    ///
    /// Objects with a registered external location come through their
    /// protocol handler; the rest are pulled from `source`. Fails with
    /// [`FetchError::Failed`] unless every requested id ends up present.
    pub fn download(
        &self,
        source: Option<&dyn ObjectPeer>,
        ids: &[ObjectId],
        locations: &[ObjectLocation],
        store: &dyn ObjectStore,
    ) -> Result<Vec<ObjectId>, FetchError> {
        let mut seen = HashSet::new();
        let to_fetch: Vec<ObjectId> = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id) && !store.contains(id))
            .collect();
        if to_fetch.is_empty() {
            return Ok(to_fetch);
        }

        let location_of: HashMap<ObjectId, &ObjectLocation> =
            locations.iter().map(|l| (l.object_id, l)).collect();
        let external: HashSet<ObjectId> = to_fetch
            .iter()
            .copied()
            .filter(|id| location_of.contains_key(id))
            .collect();
        let by_protocol: HashMap<&str, Vec<(ObjectId, String)>> = to_fetch
            .iter()
            .filter_map(|id| location_of.get(id).map(|l| (l, id)))
            .map(|(location, id)| (location.protocol.as_str(), (*id, location.url.clone())))
            .into_group_map();

        if !by_protocol.is_empty() {
            log::info!(
                "fetching {} object(s) from external locations",
                external.len()
            );
            let groups: Vec<_> = by_protocol.into_iter().collect();
            self.pool.install(|| {
                groups.par_iter().try_for_each(|(protocol, objects)| {
                    let handler = self
                        .registry
                        .get(protocol)
                        .ok_or_else(|| FetchError::UnknownProtocol((*protocol).to_owned()))?;
                    handler.download_objects(objects, store)
                })
            })?;
        }

        let remaining: Vec<ObjectId> = to_fetch
            .iter()
            .copied()
            .filter(|id| !external.contains(id))
            .collect();
        if !remaining.is_empty() {
            let Some(source) = source else {
                // No registered location and no peer: nothing can ever
                // provide these payloads.
                log::warn!(
                    "{} object(s) have no external location and no peer to fetch from",
                    remaining.len()
                );
                return Err(FetchError::ObjectNotFound(remaining[0]));
            };
            log::info!("fetching {} object(s) from peer", remaining.len());
            self.pool.install(|| {
                remaining.par_iter().for_each(|id| {
                    let result = source
                        .read_object(id)
                        .and_then(|bytes| Ok(store.write(id, &bytes)?));
                    if let Err(e) = result {
                        // The presence scan below decides what is actually
                        // missing; another worker may have stored it.
                        log::warn!("failed to fetch {id} from peer: {e}");
                    }
                })
            });
        }

        let missing: Vec<ObjectId> = to_fetch
            .iter()
            .copied()
            .filter(|id| !store.contains(id))
            .collect();
        if !missing.is_empty() {
            return Err(FetchError::Failed { missing });
        }
        Ok(to_fetch)
    }

    /// Push `ids` from `store` to `target`, skipping objects the target
    /// already knows. With a handler name, objects go to the external
    /// location instead and the returned `(id, url, protocol)` rows describe
    /// where they landed.
    pub fn upload(
        &self,
        target: &dyn ObjectPeer,
        ids: &[ObjectId],
        handler: Option<&str>,
        store: &dyn ObjectStore,
        meta: &MetaStore,
    ) -> Result<Vec<ObjectLocation>, ObjectError> {
        let existing = target.get_existing_objects()?;
        let mut seen = HashSet::new();
        let to_push: Vec<ObjectId> = ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id) && !existing.contains(id))
            .collect();
        if to_push.is_empty() {
            log::info!("nothing to upload");
            return Ok(Vec::new());
        }
        let total_size: u64 = meta.get_object_meta(&to_push).iter().map(|m| m.size).sum();
        log::info!(
            "uploading {} object(s), total size {}",
            to_push.len(),
            pretty_size(total_size)
        );

        match handler {
            None => {
                let failed = Mutex::new(Vec::new());
                self.pool.install(|| {
                    to_push.par_iter().for_each(|id| {
                        let result = store
                            .read(id)
                            .map_err(ObjectError::from)
                            .and_then(|bytes| target.write_object(id, &bytes));
                        if let Err(e) = result {
                            log::warn!("failed to upload {id}: {e}");
                            failed.lock().push(*id);
                        }
                    })
                });
                let missing = failed.into_inner();
                if !missing.is_empty() {
                    return Err(FetchError::Failed { missing }.into());
                }
                // Without an explicit location the objects live on the peer.
                Ok(Vec::new())
            }
            Some(protocol) => {
                let handler = self
                    .registry
                    .get(protocol)
                    .ok_or_else(|| FetchError::UnknownProtocol(protocol.to_owned()))?;
                let urls = handler.upload_objects(&to_push, store)?;
                Ok(to_push
                    .into_iter()
                    .zip(urls)
                    .map(|(object_id, url)| ObjectLocation {
                        object_id,
                        url,
                        protocol: protocol.to_owned(),
                    })
                    .collect())
            }
        }
    }
}
