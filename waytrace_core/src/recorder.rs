//! The sample router: turns the raw observation stream into the current
//! Visit or Path, one routing decision per sample.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::classify::SampleClassifier;
use crate::item::{ItemKind, TimelineItem};
use crate::merge::TimelineProcessor;
use crate::sample::{MovingState, RawObservation, Sample, Timestamp};
use crate::settings::MODE_SHIFT_SPEED;
use crate::store::Store;

/// How many links back the finalisation sweep walks from the current item.
const FINALISE_SWEEP_DEPTH: usize = 4;

#[derive(Default)]
struct RecorderState {
    current_item_id: Option<Uuid>,
    last_sample_id: Option<Uuid>,
    last_recorded: Option<Timestamp>,
}

/// Routes each accepted observation into the current item or a fresh
/// successor. All routing runs on the store's processing queue.
pub struct TimelineRecorder {
    store: Arc<Store>,
    processor: Arc<TimelineProcessor>,
    classifier: RwLock<Option<Arc<dyn SampleClassifier>>>,
    state: Mutex<RecorderState>,
}

impl TimelineRecorder {
    pub(crate) fn new(store: Arc<Store>, processor: Arc<TimelineProcessor>) -> Arc<Self> {
        Arc::new(Self {
            store,
            processor,
            classifier: RwLock::new(None),
            state: Mutex::new(RecorderState::default()),
        })
    }

    pub(crate) fn set_classifier(&self, classifier: Arc<dyn SampleClassifier>) {
        *self.classifier.write() = Some(classifier);
    }

    /// The item currently receiving samples, if recording has begun. When
    /// a merge has consumed the tracked item, the last routed sample leads
    /// to its surviving owner.
    pub fn current_item(&self) -> Option<Arc<TimelineItem>> {
        let (current_id, last_sample_id) = {
            let state = self.state.lock();
            (state.current_item_id, state.last_sample_id)
        };

        if let Some(item) = current_id.and_then(|id| self.store.resolve_item(id)) {
            if !item.deleted() {
                return Some(item);
            }
        }

        let sample = last_sample_id.and_then(|id| self.store.sample(id))?;
        let survivor = sample
            .item_id()
            .and_then(|id| self.store.resolve_item(id))
            .filter(|item| !item.deleted())?;
        self.store.retain_item(&survivor);
        if let Some(old_id) = current_id {
            if old_id != survivor.id {
                self.store.release_item(old_id);
            }
        }
        self.store.set_current_item(Some(survivor.id));
        self.state.lock().current_item_id = Some(survivor.id);
        Some(survivor)
    }

    /// Routes one observation. Returns the accepted sample, or `None` when
    /// the rate limiter dropped it. Must run on the processing queue.
    pub(crate) fn record(&self, raw: &RawObservation) -> Option<Arc<Sample>> {
        {
            let state = self.state.lock();
            if let Some(last) = state.last_recorded {
                if raw.date - last < self.store.config().sample_interval() {
                    trace!(date = raw.date, "observation dropped by rate limit");
                    return None;
                }
            }
        }

        let sample = self.store.create_sample(raw);
        if self.store.config().activity_type_classify_samples {
            let classifier = self.classifier.read().clone();
            if let Some(classifier) = classifier {
                if let Some(results) = classifier.classify(&sample) {
                    sample.set_classification(results);
                }
            }
        }
        self.state.lock().last_recorded = Some(raw.date);

        let current = self.route(&sample);
        self.state.lock().last_sample_id = Some(sample.id);
        self.announce_finalised(&current, raw.date);
        self.processor.process_from(&current);
        Some(sample)
    }

    fn route(&self, sample: &Arc<Sample>) -> Arc<TimelineItem> {
        let Some(current) = self.current_item() else {
            return self.begin_item(kind_for(sample), sample, None);
        };

        // A data gap never grows; recording resuming starts a new item.
        if current.is_data_gap() {
            return self.begin_item(kind_for(sample), sample, Some(current));
        }

        // Appending across a long silence would swallow an outage; start a
        // successor and let gap insertion heal the seam.
        let stale = current
            .end_date()
            .map(|end| sample.date - end > crate::settings::DATA_GAP_INSERTION_THRESHOLD)
            .unwrap_or(false);
        if stale {
            return self.begin_item(kind_for(sample), sample, Some(current));
        }

        let was_moving = current.is_path();
        let now_moving = sample.moving_state != MovingState::Stationary;

        match (was_moving, now_moving) {
            (false, false) => {
                self.store
                    .assign_samples(&current, std::slice::from_ref(sample));
                if sample.recording_state.is_sleep_state() {
                    self.thin_sleep_tail(&current, sample.date);
                }
                current
            }
            (true, true) => {
                if sample.activity_type() == current.mode_moving_activity_type() {
                    self.store
                        .assign_samples(&current, std::slice::from_ref(sample));
                    return current;
                }
                // Both edges well above the mode-shift speed: treat the
                // apparent type change as classifier noise, not a new trip.
                let last_speed = current
                    .samples()
                    .last()
                    .and_then(|s| s.speed())
                    .unwrap_or(0.0);
                let this_speed = sample.speed().unwrap_or(0.0);
                if last_speed > MODE_SHIFT_SPEED && this_speed > MODE_SHIFT_SPEED {
                    self.store
                        .assign_samples(&current, std::slice::from_ref(sample));
                    return current;
                }
                self.begin_item(ItemKind::Path, sample, Some(current))
            }
            (false, true) => self.begin_item(ItemKind::Path, sample, Some(current)),
            (true, false) => self.begin_item(ItemKind::Visit, sample, Some(current)),
        }
    }

    /// Starts a new current item, linking it after the previous one and
    /// healing any recording outage between them with a data gap.
    fn begin_item(
        &self,
        kind: ItemKind,
        sample: &Arc<Sample>,
        previous_current: Option<Arc<TimelineItem>>,
    ) -> Arc<TimelineItem> {
        let item = match kind {
            ItemKind::Visit => self.store.create_visit(sample),
            ItemKind::Path => self.store.create_path(sample),
        };

        if let Some(previous) = previous_current {
            if previous.is_data_gap() || self.processor.insert_data_gap(&previous, &item).is_none()
            {
                self.store.set_next(&previous, Some(&item));
            }
            self.store.release_item(previous.id);
        }

        self.store.retain_item(&item);
        self.store.set_current_item(Some(item.id));
        self.state.lock().current_item_id = Some(item.id);
        debug!(id = %item.id, kind = kind.name(), "new current item");
        item
    }

    /// Progressive sleep thinning: the tail run of contiguous sleep-state
    /// samples keeps its oldest sample (the gap anchor) plus at most
    /// `floor(15 + age_in_quarter_hours)` newer ones; the rest are
    /// orphaned for the next purge.
    fn thin_sleep_tail(&self, item: &Arc<TimelineItem>, now: Timestamp) {
        let samples = item.samples();
        let run_start = samples
            .iter()
            .rposition(|s| !s.recording_state.is_sleep_state())
            .map(|i| i + 1)
            .unwrap_or(0);
        let run = &samples[run_start..];
        if run.len() <= 2 {
            return;
        }

        let candidates = &run[1..];
        let age_quarter_hours = ((now - candidates[0].date) / 900.0).floor().max(0.0);
        let allowed = 15 + age_quarter_hours as usize;
        if candidates.len() <= allowed {
            return;
        }

        let excess = candidates.len() - allowed;
        let doomed: Vec<Arc<Sample>> = candidates[..excess].to_vec();
        self.store.orphan_samples(item, &doomed);
        debug!(
            item = %item.id,
            thinned = doomed.len(),
            kept = allowed + 1,
            "thinned sleep tail"
        );
    }

    /// Announces items that have settled: no longer current and older than
    /// the configured window. Each is announced exactly once.
    fn announce_finalised(&self, current: &Arc<TimelineItem>, now: Timestamp) {
        let cutoff = now - self.store.config().finalise_after;
        let mut cursor = current.clone();
        for _ in 0..FINALISE_SWEEP_DEPTH {
            let Some(previous) = self.store.resolve_previous(&cursor) else {
                break;
            };
            if !previous.deleted()
                && !previous.is_finalised()
                && previous.end_date().map(|end| end < cutoff).unwrap_or(false)
            {
                previous.set_finalised();
                self.store
                    .events()
                    .publish(crate::events::TimelineEvent::FinalisedItem(previous.clone()));
            }
            cursor = previous;
        }
    }
}

fn kind_for(sample: &Sample) -> ItemKind {
    if sample.moving_state == MovingState::Stationary {
        ItemKind::Visit
    } else {
        ItemKind::Path
    }
}
