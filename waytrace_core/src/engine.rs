//! TimelineEngine: the owning facade. One engine value owns the store,
//! recorder, processor and classifier; there is no process-wide state.

use std::sync::Arc;

use tracing::info;

use crate::classify::SampleClassifier;
use crate::events::{Subscription, TimelineEvent};
use crate::item::TimelineItem;
use crate::merge::{DeleteError, TimelineProcessor};
use crate::persist::PersistenceStore;
use crate::recorder::TimelineRecorder;
use crate::sample::{unix_now, ActivityType, RawObservation, Sample};
use crate::settings::TimelineConfig;
use crate::store::{Store, StoreStats};

/// The engine's public face. Producers push observations in, observers
/// subscribe to the event stream, and everything else happens on the
/// store's processing queue.
pub struct TimelineEngine {
    store: Arc<Store>,
    recorder: Arc<TimelineRecorder>,
    processor: Arc<TimelineProcessor>,
}

impl TimelineEngine {
    pub fn new(config: TimelineConfig) -> Self {
        let store = Store::new(config);
        let processor = TimelineProcessor::new(store.clone());
        let recorder = TimelineRecorder::new(store.clone(), processor.clone());
        Self {
            store,
            recorder,
            processor,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(TimelineConfig::default())
    }

    /// Attaches the external activity classifier.
    pub fn with_classifier(self, classifier: Arc<dyn SampleClassifier>) -> Self {
        self.recorder.set_classifier(classifier);
        self
    }

    /// Attaches the durable store the engine saves through.
    pub fn with_persistence(self, persistence: Arc<dyn PersistenceStore>) -> Self {
        self.store.set_persistence(persistence);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<TimelineProcessor> {
        &self.processor
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    /// Delivers one raw observation. Routing happens asynchronously on the
    /// processing queue; producers never block on the graph.
    pub fn record(&self, raw: RawObservation) {
        let recorder = self.recorder.clone();
        self.store.process(move || {
            recorder.record(&raw);
        });
    }

    /// Like [`TimelineEngine::record`] but waits for routing to commit.
    /// Returns the accepted sample, or `None` when rate limited.
    pub fn record_sync(&self, raw: RawObservation) -> Option<Arc<Sample>> {
        let recorder = self.recorder.clone();
        self.store.process_sync(move || recorder.record(&raw))
    }

    /// The item currently receiving samples.
    pub fn current_item(&self) -> Option<Arc<TimelineItem>> {
        self.recorder.current_item()
    }

    // ========================================================================
    // EDITS
    // ========================================================================

    /// Deletes an item by merging it into a neighbour, forcing a merge if
    /// nothing desirable is on offer.
    pub fn safe_delete(&self, item: &Arc<TimelineItem>) -> Result<Arc<TimelineItem>, DeleteError> {
        let processor = self.processor.clone();
        let item = item.clone();
        self.store.process_sync(move || processor.safe_delete(&item))
    }

    /// Applies a user correction to one sample and re-aggregates its
    /// owning item.
    pub fn confirm_activity_type(&self, sample: &Arc<Sample>, activity_type: ActivityType) {
        let store = self.store.clone();
        let sample = sample.clone();
        self.store.process(move || {
            sample.confirm_activity_type(activity_type);
            store.mark_sample_dirty(&sample);
            if let Some(item) = sample.item_id().and_then(|id| store.resolve_item(id)) {
                item.invalidate_caches();
                store.mark_item_dirty(&item);
            }
        });
    }

    // ========================================================================
    // OBSERVATION & MAINTENANCE
    // ========================================================================

    pub fn subscribe(
        &self,
        observer: impl Fn(&TimelineEvent) + Send + 'static,
    ) -> Subscription {
        self.store.events().subscribe(observer)
    }

    /// Blocks until every pending processing closure and event delivery
    /// has completed.
    pub fn flush(&self) {
        self.store.process_sync(|| {});
        self.store.events().flush();
    }

    /// Forces an immediate save of the dirty set.
    pub fn save(&self) {
        let store = self.store.clone();
        self.store.process(move || store.save(true));
    }

    /// Hard-purges tombstoned items past the retention window.
    pub fn purge_deleted(&self) {
        let store = self.store.clone();
        self.store.process(move || store.purge_deleted(unix_now()));
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Drains the queue, saves, and stops the workers.
    pub fn shutdown(self) {
        info!("timeline engine shutting down");
        self.store.shutdown();
    }
}
