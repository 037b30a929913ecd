//! The Store: identity map with weak caching and explicit retention, the
//! serial processing queue all graph mutation runs on, and write-behind
//! batch persistence.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{EventHub, TimelineEvent};
use crate::item::{ItemKind, TimelineItem};
use crate::persist::{ItemRecord, PersistenceStore, SampleRecord};
use crate::sample::{unix_now, RawObservation, Sample, Timestamp};
use crate::settings::TimelineConfig;

// ============================================================================
// PROCESSING QUEUE
// ============================================================================

type Job = Box<dyn FnOnce() + Send + 'static>;

enum QueueMessage {
    Run(Job),
    Stop,
}

/// The single FIFO cooperative queue. Closures run to completion on one
/// dedicated worker thread; submissions from the worker itself run inline.
struct ProcessingQueue {
    tx: Mutex<Option<Sender<QueueMessage>>>,
    worker_thread: Arc<OnceLock<ThreadId>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    depth: Arc<AtomicUsize>,
}

impl ProcessingQueue {
    fn new() -> Self {
        let (tx, rx) = channel::unbounded::<QueueMessage>();
        let worker_thread: Arc<OnceLock<ThreadId>> = Arc::new(OnceLock::new());
        let depth = Arc::new(AtomicUsize::new(0));

        let thread_slot = worker_thread.clone();
        let worker_depth = depth.clone();
        let worker = thread::Builder::new()
            .name("waytrace-processing".into())
            .spawn(move || {
                let _ = thread_slot.set(thread::current().id());
                while let Ok(message) = rx.recv() {
                    match message {
                        QueueMessage::Run(job) => {
                            job();
                            worker_depth.fetch_sub(1, Ordering::SeqCst);
                        }
                        QueueMessage::Stop => break,
                    }
                }
            })
            .expect("failed to spawn processing worker");

        Self {
            tx: Mutex::new(Some(tx)),
            worker_thread,
            worker: Mutex::new(Some(worker)),
            depth,
        }
    }

    fn on_worker(&self) -> bool {
        self.worker_thread.get() == Some(&thread::current().id())
    }

    fn submit(&self, job: Job) {
        if self.on_worker() {
            // Cooperative re-entry: already serialised, run to completion.
            job();
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            self.depth.fetch_add(1, Ordering::SeqCst);
            if tx.send(QueueMessage::Run(job)).is_err() {
                self.depth.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn submit_and_wait<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> R {
        if self.on_worker() {
            return job();
        }
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.submit(Box::new(move || {
            let _ = ack_tx.send(job());
        }));
        ack_rx
            .recv()
            .expect("processing worker died before completing the closure")
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(QueueMessage::Stop);
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// A consistency violation found by [`Store::verify_integrity`]. These are
/// programmer errors, not recoverable conditions.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct IntegrityError(pub String);

/// Counts of what the store is holding, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub cached_items: usize,
    pub cached_samples: usize,
    pub retained_items: usize,
    pub retained_samples: usize,
    pub dirty_items: usize,
    pub dirty_samples: usize,
    pub queue_depth: usize,
}

#[derive(Default)]
struct StoreInner {
    items: HashMap<Uuid, Weak<TimelineItem>>,
    samples: HashMap<Uuid, Weak<Sample>>,
    retained_items: HashMap<Uuid, Arc<TimelineItem>>,
    retained_samples: HashMap<Uuid, Arc<Sample>>,
    dirty_items: HashMap<Uuid, Arc<TimelineItem>>,
    dirty_samples: HashMap<Uuid, Arc<Sample>>,
    current_item_id: Option<Uuid>,
}

/// Stable UUIDs → live objects. Objects are weakly cached unless retained,
/// dirty (queued for save) or strongly held by a caller.
pub struct Store {
    config: TimelineConfig,
    inner: Mutex<StoreInner>,
    queue: ProcessingQueue,
    events: EventHub,
    persistence: RwLock<Option<Arc<dyn PersistenceStore>>>,
    /// Handle to our own Arc, for closures that outlive the borrow.
    self_ref: Weak<Store>,
}

impl Store {
    pub fn new(config: TimelineConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            inner: Mutex::new(StoreInner::default()),
            queue: ProcessingQueue::new(),
            events: EventHub::new(),
            persistence: RwLock::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn set_persistence(&self, persistence: Arc<dyn PersistenceStore>) {
        *self.persistence.write() = Some(persistence);
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    /// In-memory lookup: retained and dirty sets first, then the weak
    /// cache. Silently `None` when the object is not live.
    pub fn item(&self, id: Uuid) -> Option<Arc<TimelineItem>> {
        let mut inner = self.inner.lock();
        if let Some(item) = inner.retained_items.get(&id) {
            return Some(item.clone());
        }
        if let Some(item) = inner.dirty_items.get(&id) {
            return Some(item.clone());
        }
        let upgraded = inner.items.get(&id).and_then(Weak::upgrade);
        if upgraded.is_none() {
            inner.items.remove(&id);
        }
        upgraded
    }

    pub fn sample(&self, id: Uuid) -> Option<Arc<Sample>> {
        let mut inner = self.inner.lock();
        if let Some(sample) = inner.retained_samples.get(&id) {
            return Some(sample.clone());
        }
        if let Some(sample) = inner.dirty_samples.get(&id) {
            return Some(sample.clone());
        }
        let upgraded = inner.samples.get(&id).and_then(Weak::upgrade);
        if upgraded.is_none() {
            inner.samples.remove(&id);
        }
        upgraded
    }

    /// Lookup that falls through to the persistence collaborator,
    /// rebuilding the item and its samples when found on disk.
    pub fn resolve_item(&self, id: Uuid) -> Option<Arc<TimelineItem>> {
        if let Some(item) = self.item(id) {
            return Some(item);
        }
        let persistence = self.persistence.read().clone()?;
        let record = match persistence.load_item(id) {
            Ok(record) => record?,
            Err(error) => {
                warn!(%id, %error, "failed to load item");
                return None;
            }
        };

        let item = record.rebuild();
        if !item.deleted() {
            match persistence.load_samples_for_item(id) {
                Ok(records) => {
                    let samples: Vec<Arc<Sample>> =
                        records.iter().map(|r| r.rebuild()).collect();
                    let mut inner = self.inner.lock();
                    for sample in &samples {
                        inner.samples.insert(sample.id, Arc::downgrade(sample));
                    }
                    drop(inner);
                    item.add_samples(&samples);
                }
                Err(error) => warn!(%id, %error, "failed to load samples for item"),
            }
        }

        self.inner.lock().items.insert(id, Arc::downgrade(&item));
        debug!(%id, kind = item.kind().name(), "materialised item from persistence");
        Some(item)
    }

    // ========================================================================
    // CREATION
    // ========================================================================

    pub fn create_sample(&self, raw: &RawObservation) -> Arc<Sample> {
        let sample = Arc::new(Sample::from_observation(raw));
        self.register_sample(&sample);
        sample
    }

    pub(crate) fn create_data_gap_sample(&self, date: Timestamp) -> Arc<Sample> {
        let sample = Arc::new(Sample::data_gap_marker(date));
        self.register_sample(&sample);
        sample
    }

    fn register_sample(&self, sample: &Arc<Sample>) {
        let mut inner = self.inner.lock();
        inner.samples.insert(sample.id, Arc::downgrade(sample));
        inner.dirty_samples.insert(sample.id, sample.clone());
        drop(inner);
        self.save_if_overflowing();
    }

    pub fn create_visit(&self, first_sample: &Arc<Sample>) -> Arc<TimelineItem> {
        self.create_item(ItemKind::Visit, first_sample)
    }

    pub fn create_path(&self, first_sample: &Arc<Sample>) -> Arc<TimelineItem> {
        self.create_item(ItemKind::Path, first_sample)
    }

    fn create_item(&self, kind: ItemKind, first_sample: &Arc<Sample>) -> Arc<TimelineItem> {
        let item = TimelineItem::new(kind);
        self.inner
            .lock()
            .items
            .insert(item.id, Arc::downgrade(&item));
        self.events.publish(TimelineEvent::NewItem(item.clone()));
        self.assign_samples(&item, std::slice::from_ref(first_sample));
        debug!(id = %item.id, kind = kind.name(), "created timeline item");
        item
    }

    /// Creates an empty item directly, for callers that assemble their own
    /// sample sets (gap insertion, tests).
    pub(crate) fn create_empty_item(&self, kind: ItemKind) -> Arc<TimelineItem> {
        let item = TimelineItem::new(kind);
        self.inner
            .lock()
            .items
            .insert(item.id, Arc::downgrade(&item));
        self.events.publish(TimelineEvent::NewItem(item.clone()));
        self.mark_item_dirty(&item);
        item
    }

    // ========================================================================
    // SAMPLE OWNERSHIP
    // ========================================================================

    /// Moves samples into `item`, atomically removing each from its
    /// previous owner so no sample ever belongs to two live items.
    pub fn assign_samples(&self, item: &Arc<TimelineItem>, samples: &[Arc<Sample>]) {
        for sample in samples {
            if let Some(owner_id) = sample.item_id() {
                if owner_id != item.id {
                    if let Some(owner) = self.item(owner_id) {
                        owner.remove_samples(std::slice::from_ref(sample));
                        self.mark_item_dirty(&owner);
                    }
                }
            }
        }
        item.add_samples(samples);
        for sample in samples {
            self.mark_sample_dirty(sample);
        }
        self.mark_item_dirty(item);
    }

    /// Detaches samples from their item without a new owner, leaving them
    /// orphaned for the next purge.
    pub(crate) fn orphan_samples(&self, item: &Arc<TimelineItem>, samples: &[Arc<Sample>]) {
        item.remove_samples(samples);
        for sample in samples {
            self.mark_sample_dirty(sample);
        }
        self.mark_item_dirty(item);
    }

    // ========================================================================
    // LINKS
    // ========================================================================

    /// The single link primitive: points `item.next` at `next`, repairing
    /// every affected mirror so link symmetry holds on exit.
    pub(crate) fn set_next(&self, item: &Arc<TimelineItem>, next: Option<&Arc<TimelineItem>>) {
        let next_id = next.map(|n| n.id);
        if let Some(old_id) = item.next_id() {
            if Some(old_id) != next_id {
                if let Some(old) = self.item(old_id) {
                    if old.previous_id() == Some(item.id) {
                        old.set_previous_id(None);
                        self.mark_item_dirty(&old);
                    }
                }
            }
        }
        item.set_next_id(next_id);
        if let Some(next) = next {
            if let Some(old_previous_id) = next.previous_id() {
                if old_previous_id != item.id {
                    if let Some(old_previous) = self.item(old_previous_id) {
                        if old_previous.next_id() == Some(next.id) {
                            old_previous.set_next_id(None);
                            self.mark_item_dirty(&old_previous);
                        }
                    }
                }
            }
            next.set_previous_id(Some(item.id));
            self.mark_item_dirty(next);
        }
        self.mark_item_dirty(item);
    }

    pub(crate) fn set_previous(
        &self,
        item: &Arc<TimelineItem>,
        previous: Option<&Arc<TimelineItem>>,
    ) {
        match previous {
            Some(previous) => self.set_next(previous, Some(item)),
            None => {
                if let Some(old_id) = item.previous_id() {
                    if let Some(old) = self.item(old_id) {
                        if old.next_id() == Some(item.id) {
                            old.set_next_id(None);
                            self.mark_item_dirty(&old);
                        }
                    }
                }
                item.set_previous_id(None);
                self.mark_item_dirty(item);
            }
        }
    }

    pub fn resolve_previous(&self, item: &TimelineItem) -> Option<Arc<TimelineItem>> {
        self.resolve_item(item.previous_id()?)
    }

    pub fn resolve_next(&self, item: &TimelineItem) -> Option<Arc<TimelineItem>> {
        self.resolve_item(item.next_id()?)
    }

    // ========================================================================
    // RETENTION
    // ========================================================================

    /// Pins an item strongly until released.
    pub fn retain_item(&self, item: &Arc<TimelineItem>) {
        self.inner
            .lock()
            .retained_items
            .insert(item.id, item.clone());
    }

    /// Drops the explicit pin. A no-op for objects queued for save, whose
    /// retention lives in the dirty set until the next commit.
    pub fn release_item(&self, id: Uuid) {
        self.inner.lock().retained_items.remove(&id);
    }

    /// Marks which item is actively receiving samples. The merge engine
    /// never consumes the current item; the recorder keeps this up to
    /// date.
    pub(crate) fn set_current_item(&self, id: Option<Uuid>) {
        self.inner.lock().current_item_id = id;
    }

    pub fn current_item_id(&self) -> Option<Uuid> {
        self.inner.lock().current_item_id
    }

    pub fn retain_sample(&self, sample: &Arc<Sample>) {
        self.inner
            .lock()
            .retained_samples
            .insert(sample.id, sample.clone());
    }

    pub fn release_sample(&self, id: Uuid) {
        self.inner.lock().retained_samples.remove(&id);
    }

    // ========================================================================
    // PROCESSING QUEUE
    // ========================================================================

    /// Serialises a mutation closure onto the processing queue. In debug
    /// builds the whole graph is integrity-checked after each closure.
    pub fn process(&self, job: impl FnOnce() + Send + 'static) {
        let store = self.self_ref.upgrade();
        self.queue.submit(Box::new(move || {
            job();
            if let Some(store) = store {
                store.debug_verify();
            }
        }));
    }

    /// Like [`Store::process`] but blocks for the closure's result.
    pub fn process_sync<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> R {
        let store = self.self_ref.upgrade();
        self.queue.submit_and_wait(move || {
            let result = job();
            if let Some(store) = store {
                store.debug_verify();
            }
            result
        })
    }

    fn debug_verify(&self) {
        #[cfg(debug_assertions)]
        if let Err(violation) = self.verify_integrity() {
            panic!("timeline integrity violated after process closure: {violation}");
        }
    }

    // ========================================================================
    // DIRTY TRACKING & SAVE
    // ========================================================================

    pub(crate) fn mark_item_dirty(&self, item: &Arc<TimelineItem>) {
        self.inner.lock().dirty_items.insert(item.id, item.clone());
        self.events
            .publish(TimelineEvent::UpdatedItem(item.clone()));
        self.save_if_overflowing();
    }

    pub(crate) fn mark_sample_dirty(&self, sample: &Arc<Sample>) {
        self.inner
            .lock()
            .dirty_samples
            .insert(sample.id, sample.clone());
        self.save_if_overflowing();
    }

    fn save_if_overflowing(&self) {
        let over = {
            let inner = self.inner.lock();
            inner.dirty_items.len() + inner.dirty_samples.len() >= self.config.save_batch_size
        };
        if over {
            self.save(false);
        }
    }

    /// Hands the dirty set to the persistence collaborator in a single
    /// transaction. `lastSaved` stamps land only after the commit; a failed
    /// batch goes back in the dirty set for the next tick.
    pub fn save(&self, immediate: bool) {
        let Some(persistence) = self.persistence.read().clone() else {
            // Nothing durable attached; dirty objects stay live until
            // their holders drop them.
            let mut inner = self.inner.lock();
            inner.dirty_items.clear();
            inner.dirty_samples.clear();
            return;
        };

        // Drain by value so in-flight writes never alias later mutations.
        let (items, samples) = {
            let mut inner = self.inner.lock();
            if !immediate
                && inner.dirty_items.len() + inner.dirty_samples.len()
                    < self.config.save_batch_size
            {
                return;
            }
            (
                inner.dirty_items.drain().collect::<Vec<_>>(),
                inner.dirty_samples.drain().collect::<Vec<_>>(),
            )
        };
        if items.is_empty() && samples.is_empty() {
            return;
        }

        let item_records: Vec<ItemRecord> = items
            .iter()
            .map(|(_, item)| ItemRecord::from_item(item))
            .collect();
        let sample_records: Vec<SampleRecord> = samples
            .iter()
            .map(|(_, sample)| SampleRecord::from_sample(sample))
            .collect();

        match persistence.save_batch(&item_records, &sample_records) {
            Ok(()) => {
                let now = unix_now();
                for (_, item) in &items {
                    item.set_last_saved(now);
                }
                for (_, sample) in &samples {
                    sample.set_last_saved(now);
                }
                debug!(
                    items = items.len(),
                    samples = samples.len(),
                    "persisted dirty batch"
                );
            }
            Err(error) => {
                warn!(%error, "save batch failed; will retry on next tick");
                let mut inner = self.inner.lock();
                inner.dirty_items.extend(items);
                inner.dirty_samples.extend(samples);
            }
        }
    }

    // ========================================================================
    // PURGE
    // ========================================================================

    /// Hard-deletes tombstoned items older than `keepDeletedItemsFor`, and
    /// destroys samples orphaned by thinning once their item is gone.
    pub fn purge_deleted(&self, now: Timestamp) {
        let cutoff = now - self.config.keep_deleted_items_for;
        let mut purged_items = Vec::new();
        let mut purged_samples = Vec::new();

        {
            let mut inner = self.inner.lock();
            let doomed: Vec<Uuid> = inner
                .items
                .iter()
                .filter_map(|(id, weak)| {
                    let item = weak.upgrade()?;
                    (item.deleted() && item.last_modified() < cutoff).then_some(*id)
                })
                .collect();
            for id in doomed {
                inner.items.remove(&id);
                inner.retained_items.remove(&id);
                inner.dirty_items.remove(&id);
                purged_items.push(id);
            }

            let orphans: Vec<Uuid> = inner
                .samples
                .iter()
                .filter_map(|(id, weak)| {
                    let sample = weak.upgrade()?;
                    sample.item_id().is_none().then_some(*id)
                })
                .collect();
            for id in orphans {
                inner.samples.remove(&id);
                inner.retained_samples.remove(&id);
                inner.dirty_samples.remove(&id);
                purged_samples.push(id);
            }
        }

        if purged_items.is_empty() && purged_samples.is_empty() {
            return;
        }
        if let Some(persistence) = self.persistence.read().clone() {
            if let Err(error) = persistence.delete_items(&purged_items) {
                warn!(%error, "failed to purge deleted items");
            }
            if let Err(error) = persistence.delete_samples(&purged_samples) {
                warn!(%error, "failed to purge orphaned samples");
            }
        }
        debug!(
            items = purged_items.len(),
            samples = purged_samples.len(),
            "purged deleted objects"
        );
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    fn live_items(&self) -> Vec<Arc<TimelineItem>> {
        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for item in inner
            .retained_items
            .values()
            .chain(inner.dirty_items.values())
            .cloned()
            .chain(inner.items.values().filter_map(Weak::upgrade))
        {
            if seen.insert(item.id) {
                items.push(item);
            }
        }
        items
    }

    /// Checks the whole live graph against the structural invariants:
    /// link symmetry, no self-links, sample ownership and ordering, and
    /// empty/unlinked deleted items.
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        for item in self.live_items() {
            if item.deleted() {
                if item.sample_count() != 0 {
                    return Err(IntegrityError(format!(
                        "deleted item {} still holds samples",
                        item.id
                    )));
                }
                if item.previous_id().is_some() || item.next_id().is_some() {
                    return Err(IntegrityError(format!(
                        "deleted item {} still linked",
                        item.id
                    )));
                }
                continue;
            }

            if item.previous_id() == Some(item.id) || item.next_id() == Some(item.id) {
                return Err(IntegrityError(format!("item {} links to itself", item.id)));
            }

            if let Some(next_id) = item.next_id() {
                if let Some(next) = self.item(next_id) {
                    if next.previous_id() != Some(item.id) {
                        return Err(IntegrityError(format!(
                            "link asymmetry: {}.next = {} but {}.previous = {:?}",
                            item.id,
                            next_id,
                            next_id,
                            next.previous_id()
                        )));
                    }
                }
            }
            if let Some(previous_id) = item.previous_id() {
                if let Some(previous) = self.item(previous_id) {
                    if previous.next_id() != Some(item.id) {
                        return Err(IntegrityError(format!(
                            "link asymmetry: {}.previous = {} but {}.next = {:?}",
                            item.id,
                            previous_id,
                            previous_id,
                            previous.next_id()
                        )));
                    }
                }
            }

            let samples = item.samples();
            for pair in samples.windows(2) {
                if pair[0].date > pair[1].date {
                    return Err(IntegrityError(format!(
                        "item {} samples out of order",
                        item.id
                    )));
                }
            }
            for sample in &samples {
                if sample.item_id() != Some(item.id) {
                    return Err(IntegrityError(format!(
                        "sample {} in item {} claims owner {:?}",
                        sample.id,
                        item.id,
                        sample.item_id()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            cached_items: inner.items.len(),
            cached_samples: inner.samples.len(),
            retained_items: inner.retained_items.len(),
            retained_samples: inner.retained_samples.len(),
            dirty_items: inner.dirty_items.len(),
            dirty_samples: inner.dirty_samples.len(),
            queue_depth: self.queue.depth(),
        }
    }

    /// Drains the queue, saves everything still dirty and stops the
    /// workers. The store is unusable afterwards.
    pub fn shutdown(&self) {
        let store = self.self_ref.upgrade();
        self.queue.submit_and_wait(move || {
            if let Some(store) = store {
                store.save(true);
            }
        });
        self.queue.shutdown();
        self.events.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Location, MotionFeatures, MovingState, RecordingState};

    fn raw_at(date: Timestamp) -> RawObservation {
        RawObservation {
            date,
            location: Some(Location {
                horizontal_accuracy: 10.0,
                ..Location::new(-33.8688, 151.2093)
            }),
            moving_state: MovingState::Stationary,
            recording_state: RecordingState::Recording,
            motion: MotionFeatures::default(),
        }
    }

    fn test_store() -> Arc<Store> {
        Store::new(TimelineConfig {
            save_batch_size: 10_000,
            ..TimelineConfig::default()
        })
    }

    #[test]
    fn test_identity_map_returns_same_object() {
        let store = test_store();
        let sample = store.create_sample(&raw_at(100.0));
        let visit = store.create_visit(&sample);

        let looked_up = store.item(visit.id).unwrap();
        assert!(Arc::ptr_eq(&looked_up, &visit));
        assert!(Arc::ptr_eq(&store.sample(sample.id).unwrap(), &sample));
        assert!(store.item(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_weak_cache_eviction_after_save() {
        let store = test_store();
        let sample = store.create_sample(&raw_at(100.0));
        let visit = store.create_visit(&sample);
        let id = visit.id;

        // Clearing the dirty set (no persistence attached) leaves only the
        // weak reference behind. Flush so no event still holds a clone.
        store.save(true);
        store.events().flush();
        drop(visit);
        drop(sample);
        assert!(store.item(id).is_none());
    }

    #[test]
    fn test_retention_pins_across_save() {
        let store = test_store();
        let sample = store.create_sample(&raw_at(100.0));
        let visit = store.create_visit(&sample);
        let id = visit.id;

        store.retain_item(&visit);
        store.save(true);
        store.events().flush();
        drop(visit);
        assert!(store.item(id).is_some());

        store.release_item(id);
        assert!(store.item(id).is_none());
    }

    #[test]
    fn test_assign_samples_moves_ownership() {
        let store = test_store();
        let sample = store.create_sample(&raw_at(100.0));
        let visit = store.create_visit(&sample);
        let path = store.create_path(&store.create_sample(&raw_at(200.0)));

        store.assign_samples(&path, &[sample.clone()]);
        assert_eq!(sample.item_id(), Some(path.id));
        assert_eq!(visit.sample_count(), 0);
        assert_eq!(path.sample_count(), 2);
    }

    #[test]
    fn test_link_primitive_repairs_mirrors() {
        let store = test_store();
        let a = store.create_visit(&store.create_sample(&raw_at(100.0)));
        let b = store.create_path(&store.create_sample(&raw_at(200.0)));
        let c = store.create_visit(&store.create_sample(&raw_at(300.0)));

        store.set_next(&a, Some(&b));
        assert_eq!(a.next_id(), Some(b.id));
        assert_eq!(b.previous_id(), Some(a.id));

        // Repointing a.next to c must clear b's stale mirror.
        store.set_next(&a, Some(&c));
        assert_eq!(a.next_id(), Some(c.id));
        assert_eq!(c.previous_id(), Some(a.id));
        assert_eq!(b.previous_id(), None);

        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_process_serialises_mutation() {
        let store = test_store();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            store.process(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // A sync closure behind the batch observes all of them.
        let counter_now = {
            let counter = counter.clone();
            store.process_sync(move || counter.load(Ordering::SeqCst))
        };
        assert_eq!(counter_now, 100);
    }

    #[test]
    fn test_save_commits_and_stamps_last_saved() {
        let store = test_store();
        let persistence = Arc::new(crate::persist::SledStore::temporary().unwrap());
        store.set_persistence(persistence.clone());

        let sample = store.create_sample(&raw_at(100.0));
        let visit = store.create_visit(&sample);
        assert!(visit.last_saved().is_none());

        store.save(true);
        assert!(visit.last_saved().is_some());
        assert!(sample.last_saved().is_some());

        let record = persistence.load_item(visit.id).unwrap().unwrap();
        assert_eq!(record.id, visit.id);
        let samples = persistence.load_samples_for_item(visit.id).unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_resolve_item_rematerialises_from_disk() {
        let store = test_store();
        let persistence = Arc::new(crate::persist::SledStore::temporary().unwrap());
        store.set_persistence(persistence);

        let sample = store.create_sample(&raw_at(100.0));
        let visit = store.create_visit(&sample);
        let id = visit.id;
        store.save(true);
        store.events().flush();
        drop(visit);
        drop(sample);
        assert!(store.item(id).is_none());

        let revived = store.resolve_item(id).unwrap();
        assert_eq!(revived.id, id);
        assert_eq!(revived.kind(), ItemKind::Visit);
        assert_eq!(revived.sample_count(), 1);
    }

    #[test]
    fn test_purge_deleted_respects_age() {
        let store = test_store();
        let sample = store.create_sample(&raw_at(100.0));
        let visit = store.create_visit(&sample);
        store.orphan_samples(&visit, &[sample.clone()]);
        visit.delete();

        // Too young to purge.
        store.purge_deleted(unix_now());
        assert!(store.item(visit.id).is_some());

        // Well past the retention window.
        store.purge_deleted(unix_now() + store.config().keep_deleted_items_for * 2.0);
        assert!(store.item(visit.id).is_none());
        assert!(store.sample(sample.id).is_none());
    }
}
