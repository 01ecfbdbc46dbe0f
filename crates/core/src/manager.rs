//! The object manager: resolves what a read needs, pins it, fetches what is
//! missing under the cache budget, collapses hot delta chains, and garbage
//! collects what nothing references.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex};

use stratadb_lib::{
    FragmentPayload, IndexSettings, ObjectId, Quals, Row, TableSchema,
};

use crate::apply::{materialize, StagingTable};
use crate::config::ObjectManagerConfig;
use crate::error::{CacheError, MetaError, Result};
use crate::meta::{
    ClaimOutcome, MetaStore, ObjectLocation, ObjectMeta, ReadyState, TableKey, TableRef,
};
use crate::ostorage::ObjectStore;
use crate::remote::{Fetcher, HandlerRegistry, ObjectPeer};
use crate::resolve::{resolve_table, MaterializationPlan};
use crate::util::{pretty_size, Tracer};
use crate::write::{self, ChangeSource};

/// How many times eviction re-scans when concurrent claims race it out of
/// its selection.
const EVICTION_PASSES: usize = 3;

pub struct ObjectManager {
    config: ObjectManagerConfig,
    meta: Arc<MetaStore>,
    store: Arc<dyn ObjectStore>,
    upstream: Option<Arc<dyn ObjectPeer>>,
    fetcher: Fetcher,
    /// Objects currently being fetched or materialized by some worker in
    /// this process. Guarantees a missing object is downloaded exactly once
    /// under concurrent `ensure_objects` calls.
    inflight: Mutex<HashSet<ObjectId>>,
    inflight_done: Condvar,
    /// Serializes eviction sweeps.
    eviction_lock: Mutex<()>,
}

impl ObjectManager {
    pub fn new(
        config: ObjectManagerConfig,
        meta: Arc<MetaStore>,
        store: Arc<dyn ObjectStore>,
        upstream: Option<Arc<dyn ObjectPeer>>,
        registry: HandlerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let fetcher = Fetcher::new(registry, config.pool_size)?;
        Ok(ObjectManager {
            config,
            meta,
            store,
            upstream,
            fetcher,
            inflight: Mutex::new(HashSet::new()),
            inflight_done: Condvar::new(),
            eviction_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &ObjectManagerConfig {
        &self.config
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Resolve `table` into a materialization plan and make every object in
    /// it locally present and pinned. The returned handle keeps the objects
    /// pinned until dropped.
    pub fn ensure_objects(
        &self,
        table: &TableRef,
        quals: Option<&Quals>,
    ) -> Result<EnsuredObjects<'_>> {
        let mut tracer = Tracer::new();
        log::info!(
            "resolving objects for {}:{}:{}",
            table.key.schema_name(),
            table.key.image_hash,
            table.key.table_name
        );
        let plan = resolve_table(&self.meta, table, quals)?;
        tracer.log("resolve");

        let required = plan.objects.clone();
        log::info!("claiming {} object(s)", required.len());
        let outcomes = self.meta.claim_objects(&required)?;
        tracer.log("claim");

        let mut pinned = required.clone();
        let yielded = (|| {
            self.prepare_claimed(&required, &outcomes)?;
            tracer.log("fetch");
            let swapped = self.maybe_promote(&plan, table, &mut pinned)?;
            tracer.log("promote");
            self.meta.flush()?;
            Ok(match swapped {
                Some(snap) => vec![snap],
                None => required.clone(),
            })
        })();
        let yielded = match yielded {
            Ok(yielded) => yielded,
            Err(e) => {
                self.rollback_claims(&pinned, &required, &outcomes);
                return Err(e);
            }
        };
        tracer.log("yield");
        log::debug!(
            "ensure_objects for {}: {tracer}",
            table.key.table_name
        );

        Ok(EnsuredObjects {
            manager: self,
            schema: table.schema.clone(),
            objects: yielded,
            pinned,
        })
    }

    /// Bring every claimed object into the local store, downloading each
    /// missing one exactly once across concurrent workers.
    fn prepare_claimed(&self, required: &[ObjectId], outcomes: &[ClaimOutcome]) -> Result<()> {
        // Rows we created for objects that are already present (written by
        // the write path, or left over after a crash) just need the flag.
        let ours_present: Vec<ObjectId> = required
            .iter()
            .zip(outcomes)
            .filter(|(id, outcome)| {
                matches!(outcome, ClaimOutcome::Inserted) && self.store.contains(id)
            })
            .map(|(id, _)| *id)
            .collect();
        if !ours_present.is_empty() {
            self.meta.set_ready(&ours_present, true)?;
        }

        loop {
            let missing: Vec<ObjectId> = required
                .iter()
                .copied()
                .filter(|id| !self.store.contains(id))
                .collect();
            if missing.is_empty() {
                break;
            }
            let mine = self.acquire_inflight(&missing);
            if mine.is_empty() {
                // Every missing object is being prepared by someone else;
                // wait for progress and re-check. If the preparer failed we
                // pick the objects up ourselves on the next pass.
                self.wait_inflight(&missing);
                continue;
            }
            let fetched = self.fetch_missing(&mine, required);
            self.release_inflight(&mine);
            fetched?;
        }

        // Everything required is present now.
        self.meta.set_ready(required, true)?;
        self.meta.flush()?;
        Ok(())
    }

    /// Fetch-plan and fetch for the objects this worker owns: check the
    /// budget, evict as needed, download, verify, mark ready.
    fn fetch_missing(&self, mine: &[ObjectId], protected: &[ObjectId]) -> Result<()> {
        let snap_sizes = self.snap_cache_sizes();
        let required_space: u64 = mine
            .iter()
            .map(|id| self.object_size(id, &snap_sizes))
            .sum();
        if required_space > self.config.cache_size {
            return Err(CacheError::CacheTooSmall {
                required: required_space,
                cache_size: self.config.cache_size,
            }
            .into());
        }
        let occupancy = self.meta.cache_occupancy();
        log::info!(
            "need to download {} object(s) ({}), cache occupancy {}/{}",
            mine.len(),
            pretty_size(required_space),
            pretty_size(occupancy),
            pretty_size(self.config.cache_size)
        );
        if required_space + occupancy > self.config.cache_size {
            let target = required_space + occupancy - self.config.cache_size;
            let protected: HashSet<ObjectId> = protected.iter().copied().collect();
            self.evict(Some(target), &protected)?;
        }

        let locations = self.meta.get_external_object_locations(mine);
        self.fetcher
            .download(self.upstream.as_deref(), mine, &locations, self.store.as_ref())?;

        let still_missing: Vec<ObjectId> = mine
            .iter()
            .copied()
            .filter(|id| !self.store.contains(id))
            .collect();
        if !still_missing.is_empty() {
            return Err(CacheError::FetchIncomplete {
                missing: still_missing,
            }
            .into());
        }
        self.meta.set_ready(mine, true)?;
        self.meta.flush()?;
        Ok(())
    }

    /// Undo a failed `ensure_objects`: drop our refcounts and clear any
    /// never-readied rows we created. `pinned` is what we currently hold
    /// (the original claim, or the collapsed snapshot after a swap);
    /// `outcomes` always describes the original `required` claim.
    fn rollback_claims(&self, pinned: &[ObjectId], required: &[ObjectId], outcomes: &[ClaimOutcome]) {
        if let Err(e) = self.meta.release_objects(pinned) {
            log::warn!("failed to release claims during rollback: {e}");
        }
        let ours_unready: Vec<ObjectId> = required
            .iter()
            .zip(outcomes)
            .filter(|(id, outcome)| {
                matches!(outcome, ClaimOutcome::Inserted)
                    && self
                        .meta
                        .get_cache_status(id)
                        .is_some_and(|row| !row.ready)
            })
            .map(|(id, _)| *id)
            .collect();
        match self.meta.remove_cache_rows_if_idle(&ours_unready) {
            Ok(removed) if !removed.is_empty() => {
                log::debug!("rolled back {} unready claim(s)", removed.len())
            }
            Ok(_) => (),
            Err(e) => log::warn!("failed to roll back claims: {e}"),
        }
        let _ = self.meta.flush();
    }

    fn acquire_inflight(&self, ids: &[ObjectId]) -> Vec<ObjectId> {
        let mut inflight = self.inflight.lock();
        ids.iter().copied().filter(|id| inflight.insert(*id)).collect()
    }

    fn release_inflight(&self, ids: &[ObjectId]) {
        let mut inflight = self.inflight.lock();
        for id in ids {
            inflight.remove(id);
        }
        drop(inflight);
        self.inflight_done.notify_all();
    }

    fn wait_inflight(&self, ids: &[ObjectId]) {
        let mut inflight = self.inflight.lock();
        if !ids.iter().any(|id| inflight.contains(id)) {
            return;
        }
        if self
            .inflight_done
            .wait_for(&mut inflight, self.config.stale_claim_grace)
            .timed_out()
        {
            log::warn!("timed out waiting for another worker's fetch; retrying ourselves");
        }
    }

    // ------------------------------------------------------------------
    // eviction

    /// Free at least `required_space` bytes (or everything idle, when
    /// `None`) by deleting unpinned cached objects, cheapest-to-refetch
    /// first. Returns the number of bytes freed.
    pub fn run_eviction(&self, required_space: Option<u64>) -> Result<u64> {
        self.evict(required_space, &HashSet::new())
    }

    fn evict(&self, required_space: Option<u64>, protected: &HashSet<ObjectId>) -> Result<u64> {
        let _sweep = self.eviction_lock.lock();
        log::info!("performing eviction");
        let now = SystemTime::now();
        let snap_sizes = self.snap_cache_sizes();
        let mut freed = 0u64;

        for _pass in 0..EVICTION_PASSES {
            let remaining = match required_space {
                None => None,
                Some(target) if freed >= target => break,
                Some(target) => Some(target - freed),
            };

            let rows = self.meta.cache_rows();
            let pinned = rows.iter().filter(|(_, row)| row.refcount > 0).count();
            let mut candidates: Vec<(ObjectId, f64, u64)> = rows
                .iter()
                .filter(|(id, row)| row.refcount == 0 && !protected.contains(id))
                .filter(|(_, row)| {
                    // Unready rows belong to an in-progress fetch unless they
                    // are old enough to be crash leftovers.
                    row.ready
                        || now
                            .duration_since(row.last_used)
                            .map_or(false, |age| age >= self.config.stale_claim_grace)
                })
                .map(|(id, row)| {
                    let size = self.object_size(id, &snap_sizes);
                    let age = now
                        .duration_since(row.last_used)
                        .unwrap_or_default()
                        .as_secs_f64();
                    (*id, eviction_score(&self.config, size, age), size)
                })
                .collect();

            let selected: Vec<ObjectId> = match remaining {
                None => candidates.iter().map(|(id, _, _)| *id).collect(),
                Some(remaining) => {
                    let freeable: u64 = candidates.iter().map(|(_, _, size)| *size).sum();
                    if freeable < remaining {
                        return Err(CacheError::InsufficientReclaimable {
                            required: remaining,
                            freeable,
                            pinned,
                        }
                        .into());
                    }
                    candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
                    let mut cumulative = 0u64;
                    candidates
                        .iter()
                        .take_while(|(_, _, size)| {
                            let more = cumulative < remaining;
                            cumulative += size;
                            more
                        })
                        .map(|(id, _, _)| *id)
                        .collect()
                }
            };
            if selected.is_empty() {
                break;
            }

            // Atomic per row: anything re-pinned since the scan stays.
            let deleted = self.meta.remove_cache_rows_if_idle(&selected)?;
            freed += deleted
                .iter()
                .map(|id| self.object_size(id, &snap_sizes))
                .sum::<u64>();
            self.store.delete(&deleted)?;
            let deleted_set: HashSet<ObjectId> = deleted.iter().copied().collect();
            self.meta.remove_snap_cache_by_snap(&deleted_set)?;
            log::info!(
                "evicted {} object(s), freed {}",
                deleted.len(),
                pretty_size(freed)
            );
            if required_space.is_none() {
                break;
            }
        }

        if let Some(target) = required_space {
            if freed < target {
                return Err(CacheError::InsufficientReclaimable {
                    required: target - freed,
                    freeable: 0,
                    pinned: self
                        .meta
                        .cache_rows()
                        .iter()
                        .filter(|(_, row)| row.refcount > 0)
                        .count(),
                }
                .into());
            }
        }
        self.meta.flush()?;
        Ok(freed)
    }

    fn snap_cache_sizes(&self) -> HashMap<ObjectId, u64> {
        self.meta
            .snap_cache_entries()
            .into_iter()
            .map(|entry| (entry.snap_id, entry.size))
            .collect()
    }

    /// An object is either registered (sized by its metadata row) or an
    /// ephemeral collapsed snapshot (sized by its cache entry).
    fn object_size(&self, id: &ObjectId, snap_sizes: &HashMap<ObjectId, u64>) -> u64 {
        if let Some(meta) = self.meta.get_object(id) {
            return meta.size;
        }
        if let Some(size) = snap_sizes.get(id) {
            return *size;
        }
        self.store.size(id).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // promotion

    /// Log the miss and, if this chain is hot enough, collapse it into a
    /// cached snapshot. Returns the snapshot to yield instead of the chain,
    /// if promotion happened. Promotion failures are non-fatal: the pinned
    /// chain is always a valid answer.
    fn maybe_promote(
        &self,
        plan: &MaterializationPlan,
        table: &TableRef,
        pinned: &mut Vec<ObjectId>,
    ) -> Result<Option<ObjectId>> {
        let Some(&head) = plan.head_diff() else {
            return Ok(None);
        };
        if plan.filtered {
            // A filtered plan reconstructs a slice, not the table.
            return Ok(None);
        }
        let now = SystemTime::now();
        self.meta.store_snap_cache_miss(head, now)?;
        let cutoff = now - self.config.promote_lookback;
        if self.meta.recent_snap_cache_misses(&head, cutoff) <= self.config.promote_threshold {
            return Ok(None);
        }

        let new_snap = ObjectId::random();
        match self.meta.try_insert_snap_cache(head, new_snap) {
            Ok(()) => {
                log::info!(
                    "collapsing {} diff(s) ending at {head} into snapshot {new_snap}",
                    plan.diffs.len()
                );
                self.meta.claim_objects(&[new_snap])?;
                let mine = self.acquire_inflight(&[new_snap]);
                let built = self.build_collapsed_snap(plan, table, new_snap);
                self.release_inflight(&mine);
                match built {
                    Ok(()) => {
                        self.meta.release_objects(pinned)?;
                        *pinned = vec![new_snap];
                        Ok(Some(new_snap))
                    }
                    Err(e) => {
                        log::warn!("failed to collapse chain at {head}, keeping it: {e}");
                        if let Err(e) = self.meta.remove_snap_cache_entry(&head) {
                            log::warn!("failed to roll back snap cache entry: {e}");
                        }
                        let _ = self.meta.release_objects(&[new_snap]);
                        let _ = self.meta.remove_cache_rows_if_idle(&[new_snap]);
                        Ok(None)
                    }
                }
            }
            Err(MetaError::DuplicateRegistration(_)) => {
                // Another worker won the insert race and is (or has been)
                // materializing; reuse its snapshot once ready.
                let Some((snap_id, _)) = self.meta.get_snap_cache_for(&head) else {
                    return Ok(None);
                };
                self.meta.claim_objects(&[snap_id])?;
                let usable = match self
                    .meta
                    .wait_ready(&snap_id, self.config.stale_claim_grace)
                {
                    ReadyState::Ready => self.store.contains(&snap_id),
                    ReadyState::Absent | ReadyState::TimedOut => false,
                };
                if usable {
                    self.meta.release_objects(pinned)?;
                    *pinned = vec![snap_id];
                    Ok(Some(snap_id))
                } else {
                    log::warn!("cached snapshot {snap_id} never became usable, keeping chain");
                    let _ = self.meta.release_objects(&[snap_id]);
                    Ok(None)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy the base snapshot and replay the chain onto it, yielding a new
    /// physical object outside the object tree (its identity lives in the
    /// snap cache). We cannot know the result size up front, so the budget
    /// is re-checked afterwards with a best-effort sweep.
    fn build_collapsed_snap(
        &self,
        plan: &MaterializationPlan,
        table: &TableRef,
        new_snap: ObjectId,
    ) -> Result<()> {
        let mut payloads = Vec::with_capacity(plan.objects.len());
        for id in &plan.objects {
            payloads.push(FragmentPayload::decode(&self.store.read(id)?)?);
        }
        let staging = materialize(&table.schema, payloads);
        let payload = FragmentPayload::new(staging.to_snapshot_rows());
        let bytes = payload.encode()?;
        self.store.write(&new_snap, &bytes)?;
        self.meta.update_snap_cache_size(&new_snap, bytes.len() as u64)?;
        self.meta.set_ready(&[new_snap], true)?;

        let occupancy = self.meta.cache_occupancy();
        if occupancy > self.config.cache_size {
            let mut protected: HashSet<ObjectId> = plan.objects.iter().copied().collect();
            protected.insert(new_snap);
            if let Err(e) = self.evict(Some(occupancy - self.config.cache_size), &protected) {
                log::warn!("cache over budget after collapsing a chain: {e}");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // transfer and GC

    /// Fetch `ids` into the local store from `source` and registered
    /// external locations, without pinning them.
    pub fn download_objects(
        &self,
        source: Option<&dyn ObjectPeer>,
        ids: &[ObjectId],
    ) -> Result<Vec<ObjectId>> {
        let locations = self.meta.get_external_object_locations(ids);
        Ok(self
            .fetcher
            .download(source, ids, &locations, self.store.as_ref())?)
    }

    /// Push `ids` to a peer (no handler) or an external location (named
    /// handler). Returns and locally registers the locations of externally
    /// placed objects.
    pub fn upload_objects(
        &self,
        target: &dyn ObjectPeer,
        ids: &[ObjectId],
        handler: Option<&str>,
    ) -> Result<Vec<ObjectLocation>> {
        let placed =
            self.fetcher
                .upload(target, ids, handler, self.store.as_ref(), &self.meta)?;
        if !placed.is_empty() {
            self.meta.register_object_locations(placed.clone())?;
        }
        Ok(placed)
    }

    /// Crawl a peer's object tree for the metadata needed to materialize
    /// `heads` locally: the heads themselves plus every ancestor we don't
    /// have yet.
    pub fn extract_recursive_object_meta(
        &self,
        peer: &dyn ObjectPeer,
        heads: &[ObjectId],
    ) -> Result<(HashSet<ObjectId>, Vec<ObjectMeta>)> {
        let existing = self.meta.get_existing_objects();
        let mut distinct: HashSet<ObjectId> = heads
            .iter()
            .copied()
            .filter(|id| !existing.contains(id))
            .collect();
        let mut known: HashSet<ObjectId> = HashSet::new();
        let mut metas = Vec::new();
        loop {
            let new: Vec<ObjectId> = distinct.difference(&known).copied().collect();
            if new.is_empty() {
                break;
            }
            let batch = peer.get_object_meta(&new)?;
            for meta in &batch {
                if let Some(parent) = meta.parent_id {
                    if !existing.contains(&parent) {
                        distinct.insert(parent);
                    }
                }
            }
            metas.extend(batch);
            known.extend(new);
        }
        Ok((distinct, metas))
    }

    /// Delete every object no table binding reaches (directly or through
    /// parents), along with its metadata, locations, cache rows and
    /// snapshot-cache entries. Pinned payloads survive until released.
    pub fn cleanup(&self) -> Result<Vec<ObjectId>> {
        let mut live = self.meta.all_table_objects();
        loop {
            let ids: Vec<ObjectId> = live.iter().copied().collect();
            let new_parents: HashSet<ObjectId> = self
                .meta
                .get_object_meta(&ids)
                .iter()
                .filter_map(|m| m.parent_id)
                .filter(|p| !live.contains(p))
                .collect();
            if new_parents.is_empty() {
                break;
            }
            live.extend(new_parents);
        }

        // Collapsed snapshots for dead chains go; those for live chains stay.
        self.meta.prune_snap_cache(&live)?;
        self.meta.prune_miss_log(&live)?;

        let all = self.meta.get_existing_objects();
        let dead_meta: Vec<ObjectId> = all.difference(&live).copied().collect();
        self.meta.delete_object_meta(&dead_meta)?;

        let kept_snaps: HashSet<ObjectId> = self
            .meta
            .snap_cache_entries()
            .into_iter()
            .map(|entry| entry.snap_id)
            .collect();
        let pinned: HashSet<ObjectId> = self
            .meta
            .cache_rows()
            .into_iter()
            .filter(|(_, row)| row.refcount > 0)
            .map(|(id, _)| id)
            .collect();
        let to_delete: Vec<ObjectId> = self
            .store
            .list_all()?
            .into_iter()
            .filter(|id| !live.contains(id) && !kept_snaps.contains(id) && !pinned.contains(id))
            .collect();
        self.meta.remove_cache_rows_if_idle(&to_delete)?;
        self.store.delete(&to_delete)?;
        self.meta.flush()?;
        log::info!("cleanup deleted {} object(s)", to_delete.len());
        Ok(to_delete)
    }

    // ------------------------------------------------------------------
    // write path

    /// See [`write::record_table_as_delta`].
    pub fn record_table_as_delta(
        &self,
        source: &dyn ChangeSource,
        old_table: &TableRef,
        new_image: &str,
        settings: &IndexSettings,
    ) -> Result<ObjectId> {
        write::record_table_as_delta(
            &self.meta,
            self.store.as_ref(),
            source,
            old_table,
            new_image,
            settings,
        )
    }

    /// See [`write::record_table_as_snapshot`].
    pub fn record_table_as_snapshot(
        &self,
        key: TableKey,
        schema: TableSchema,
        rows: Vec<Row>,
        settings: &IndexSettings,
    ) -> Result<ObjectId> {
        write::record_table_as_snapshot(
            &self.meta,
            self.store.as_ref(),
            key,
            schema,
            rows,
            settings,
        )
    }
}

/// The reuse-probability-times-refetch-cost estimate eviction minimizes:
/// `exp(-decay * age) * max(size, floor)`. Lower scores evict first.
fn eviction_score(config: &ObjectManagerConfig, size: u64, age_secs: f64) -> f64 {
    let time_factor = (-config.eviction_decay * age_secs).exp();
    let size_factor = size.max(config.eviction_floor) as f64;
    time_factor * size_factor
}

/// A scoped pin over one materialization plan. While the handle lives, every
/// object in [`Self::objects`] is present in the local store and safe from
/// eviction; dropping it releases the pins on every exit path.
pub struct EnsuredObjects<'a> {
    manager: &'a ObjectManager,
    schema: TableSchema,
    objects: Vec<ObjectId>,
    pinned: Vec<ObjectId>,
}

impl std::fmt::Debug for EnsuredObjects<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsuredObjects")
            .field("schema", &self.schema)
            .field("objects", &self.objects)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl EnsuredObjects<'_> {
    /// The plan, application order: snapshot first, then deltas oldest to
    /// newest.
    pub fn objects(&self) -> &[ObjectId] {
        &self.objects
    }

    pub fn read_payloads(&self) -> Result<Vec<FragmentPayload>> {
        self.objects
            .iter()
            .map(|id| Ok(FragmentPayload::decode(&self.manager.store.read(id)?)?))
            .collect()
    }

    /// Replay the plan into a staging table.
    pub fn materialize(&self) -> Result<StagingTable> {
        Ok(materialize(&self.schema, self.read_payloads()?))
    }
}

impl Drop for EnsuredObjects<'_> {
    fn drop(&mut self) {
        log::info!("releasing {} object(s)", self.pinned.len());
        if let Err(e) = self.manager.meta.release_objects(&self.pinned) {
            log::warn!("failed to release pinned objects: {e}");
        }
        if let Err(e) = self.manager.meta.flush() {
            log::warn!("failed to flush metadata after release: {e}");
        }
    }
}
