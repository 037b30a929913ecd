//! TimelineItem: a Visit or Path owning an ordered run of samples, with
//! lazily cached geometry and its place in the doubly-linked timeline graph.
//!
//! Links are stored as plain UUIDs and resolved through the
//! [`Store`](crate::Store); no owning references run in either direction.
//! Cached aggregates live behind a per-item recursive mutex so re-entrant
//! reads from sanitiser callbacks are safe, and are invalidated as one unit
//! whenever the sample set changes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use geo::Point;
use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify;
use crate::geodesy::{self, Radius};
use crate::sample::{
    unix_now, ActivityType, ClassifierResults, DateRange, RecordingState, Sample, Timestamp,
};
use crate::settings::{
    MIN_DATA_GAP_DURATION, MIN_DATA_GAP_KEEPER_DURATION, MIN_ITEM_DURATION,
    MIN_PATH_DISTANCE, MIN_PATH_KEEPER_DISTANCE, MIN_PATH_KEEPER_DURATION,
    MIN_VISIT_KEEPER_DURATION, MIN_VISIT_PATH_MERGEABLE_DISTANCE,
};

// ============================================================================
// KIND & KEEPNESS
// ============================================================================

/// The two item kinds a timeline alternates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Visit,
    Path,
}

impl ItemKind {
    pub fn name(&self) -> &'static str {
        match self {
            ItemKind::Visit => "visit",
            ItemKind::Path => "path",
        }
    }
}

/// How much an item deserves to survive a merge, used as the tie-breaker
/// when choosing keepers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Keepness {
    Invalid,
    Valid,
    Keeper,
}

impl Keepness {
    pub fn score(&self) -> u8 {
        match self {
            Keepness::Invalid => 0,
            Keepness::Valid => 1,
            Keepness::Keeper => 2,
        }
    }
}

/// A maximal run of samples sharing a recording state and activity type.
#[derive(Debug, Clone)]
pub struct ItemSegment {
    pub recording_state: RecordingState,
    pub activity_type: Option<ActivityType>,
    pub samples: Vec<Arc<Sample>>,
}

impl ItemSegment {
    pub fn date_range(&self) -> Option<DateRange> {
        let first = self.samples.first()?;
        let last = self.samples.last()?;
        Some(DateRange::new(first.date, last.date))
    }
}

// ============================================================================
// ITEM STATE (behind the per-item lock)
// ============================================================================

#[derive(Debug)]
struct ItemState {
    kind: ItemKind,
    deleted: bool,
    merge_locked: bool,
    finalised: bool,
    last_modified: Timestamp,
    last_saved: Option<Timestamp>,
    samples: Vec<Arc<Sample>>,
    previous_id: Option<Uuid>,
    next_id: Option<Uuid>,
    step_count: Option<u32>,
    floors_up: Option<u32>,
    floors_down: Option<u32>,
    cache: ItemCache,
}

#[derive(Debug, Default)]
struct ItemCache {
    date_range: Option<Option<DateRange>>,
    centre: Option<Option<Point<f64>>>,
    radius: Option<Radius>,
    altitude: Option<Option<f64>>,
    travel_distance: Option<f64>,
    classifier: Option<ClassifierResults>,
    mode_activity: Option<Option<ActivityType>>,
    mode_moving_activity: Option<Option<ActivityType>>,
    segments: Option<Vec<ItemSegment>>,
}

impl ItemState {
    /// The single invalidation hook: any sample-set or link change funnels
    /// through here.
    fn samples_changed(&mut self) {
        self.cache = ItemCache::default();
        self.last_modified = unix_now();
    }

    fn usable_points(&self) -> Vec<Point<f64>> {
        self.samples.iter().filter_map(|s| s.point()).collect()
    }

    fn date_range(&mut self) -> Option<DateRange> {
        if let Some(cached) = self.cache.date_range {
            return cached;
        }
        let range = match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Some(DateRange::new(first.date, last.date)),
            _ => None,
        };
        self.cache.date_range = Some(range);
        range
    }

    fn centre(&mut self) -> Option<Point<f64>> {
        if let Some(cached) = self.cache.centre {
            return cached;
        }
        let weighted: Vec<(Point<f64>, f64)> = self
            .samples
            .iter()
            .filter_map(|s| {
                let location = s.location.filter(|l| l.has_usable_coordinate())?;
                Some((location.point(), location.horizontal_accuracy))
            })
            .collect();
        let centre = geodesy::weighted_centre(&weighted);
        self.cache.centre = Some(centre);
        centre
    }

    fn radius(&mut self) -> Radius {
        if let Some(cached) = self.cache.radius {
            return cached;
        }
        let centre = self.centre();
        let usable: Vec<Arc<Sample>> = self
            .samples
            .iter()
            .filter(|s| s.has_usable_coordinate())
            .cloned()
            .collect();
        let radius = match (usable.len(), centre) {
            (0, _) | (_, None) => Radius::ZERO,
            (1, _) => {
                // A lone fix occupies its own accuracy circle.
                let accuracy = usable[0]
                    .location
                    .map(|l| l.horizontal_accuracy.max(0.0))
                    .unwrap_or(0.0);
                Radius {
                    mean: accuracy,
                    sd: 0.0,
                }
            }
            (_, Some(centre)) => {
                let points: Vec<Point<f64>> =
                    usable.iter().filter_map(|s| s.point()).collect();
                geodesy::radius_about(centre, &points)
            }
        };
        self.cache.radius = Some(radius);
        radius
    }

    fn altitude(&mut self) -> Option<f64> {
        if let Some(cached) = self.cache.altitude {
            return cached;
        }
        // Vertical-accuracy weighted mean over samples that carry altitude.
        let fixes: Vec<(f64, f64)> = self
            .samples
            .iter()
            .filter_map(|s| {
                let location = s.location?;
                let altitude = location.altitude?;
                (location.vertical_accuracy >= 0.0)
                    .then_some((altitude, location.vertical_accuracy))
            })
            .collect();
        let altitude = if fixes.is_empty() {
            None
        } else {
            let worst = fixes.iter().map(|(_, acc)| *acc).fold(0.0, f64::max);
            let mut weighted_sum = 0.0;
            let mut weight_sum = 0.0;
            for (altitude, accuracy) in &fixes {
                let weight = 1.0 - accuracy / (worst + 1.0);
                weighted_sum += altitude * weight;
                weight_sum += weight;
            }
            (weight_sum > 0.0).then_some(weighted_sum / weight_sum)
        };
        self.cache.altitude = Some(altitude);
        altitude
    }

    fn travel_distance(&mut self) -> f64 {
        if let Some(cached) = self.cache.travel_distance {
            return cached;
        }
        let points = self.usable_points();
        let distance: f64 = points
            .windows(2)
            .map(|w| geodesy::distance_between(w[0], w[1]))
            .sum();
        self.cache.travel_distance = Some(distance);
        distance
    }

    fn classifier_results(&mut self) -> ClassifierResults {
        if let Some(cached) = &self.cache.classifier {
            return cached.clone();
        }
        let radius_3sd = self.radius().with_sd(3.0);
        let results = classify::item_results(&self.samples, radius_3sd, ActivityType::all());
        self.cache.classifier = Some(results.clone());
        results
    }

    fn activity_type(&mut self) -> Option<ActivityType> {
        self.classifier_results()
            .best_match()
            .filter(|r| r.score > 0.0)
            .map(|r| r.activity_type)
    }

    fn moving_activity_type(&mut self) -> Option<ActivityType> {
        let classified = self
            .classifier_results()
            .iter()
            .filter(|r| r.activity_type.is_moving_type() && r.score > 0.0)
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|r| r.activity_type);
        classified.or_else(|| self.mode_moving_activity_type())
    }

    fn mode_activity_type(&mut self) -> Option<ActivityType> {
        if let Some(cached) = self.cache.mode_activity {
            return cached;
        }
        let mode = most_common(self.samples.iter().filter_map(|s| s.activity_type()));
        self.cache.mode_activity = Some(mode);
        mode
    }

    fn mode_moving_activity_type(&mut self) -> Option<ActivityType> {
        if let Some(cached) = self.cache.mode_moving_activity {
            return cached;
        }
        let mode = most_common(
            self.samples
                .iter()
                .filter_map(|s| s.activity_type())
                .filter(|t| t.is_moving_type()),
        );
        self.cache.mode_moving_activity = Some(mode);
        mode
    }

    fn segments(&mut self) -> Vec<ItemSegment> {
        if let Some(cached) = &self.cache.segments {
            return cached.clone();
        }
        let mut segments: Vec<ItemSegment> = Vec::new();
        for sample in &self.samples {
            let key = (sample.recording_state, sample.activity_type());
            match segments.last_mut() {
                Some(last)
                    if last.recording_state == key.0 && last.activity_type == key.1 =>
                {
                    last.samples.push(sample.clone());
                }
                // A lone unclassified sample inside an otherwise uniform
                // run stays with that run rather than splitting it.
                Some(last) if last.recording_state == key.0 && key.1.is_none() => {
                    last.samples.push(sample.clone());
                }
                _ => segments.push(ItemSegment {
                    recording_state: key.0,
                    activity_type: key.1,
                    samples: vec![sample.clone()],
                }),
            }
        }
        self.cache.segments = Some(segments.clone());
        segments
    }

    fn is_data_gap(&self) -> bool {
        self.kind == ItemKind::Path
            && self
                .samples
                .first()
                .map(|s| s.recording_state == RecordingState::Off)
                .unwrap_or(false)
    }

    fn is_nolo(&self) -> bool {
        !self.samples.iter().any(|s| s.has_usable_coordinate())
    }

    fn duration(&mut self) -> f64 {
        self.date_range().map(|r| r.duration()).unwrap_or(0.0)
    }

    fn is_valid(&mut self) -> bool {
        match self.kind {
            ItemKind::Visit => !self.samples.is_empty() && self.duration() >= MIN_ITEM_DURATION,
            ItemKind::Path if self.is_data_gap() => self.duration() >= MIN_DATA_GAP_DURATION,
            ItemKind::Path if self.is_nolo() => {
                self.samples.len() >= 2 && self.duration() >= MIN_ITEM_DURATION
            }
            ItemKind::Path => {
                self.samples.len() >= 2
                    && self.duration() >= MIN_ITEM_DURATION
                    && self.travel_distance() >= MIN_PATH_DISTANCE
            }
        }
    }

    fn is_worth_keeping(&mut self) -> bool {
        match self.kind {
            ItemKind::Visit => {
                self.is_valid() && self.duration() >= MIN_VISIT_KEEPER_DURATION
            }
            ItemKind::Path if self.is_data_gap() => {
                self.duration() >= MIN_DATA_GAP_KEEPER_DURATION
            }
            ItemKind::Path if self.is_nolo() => false,
            ItemKind::Path => {
                self.is_valid()
                    && self.duration() >= MIN_PATH_KEEPER_DURATION
                    && self.travel_distance() >= MIN_PATH_KEEPER_DISTANCE
            }
        }
    }

    fn keepness(&mut self) -> Keepness {
        if self.is_worth_keeping() {
            Keepness::Keeper
        } else if self.is_valid() {
            Keepness::Valid
        } else {
            Keepness::Invalid
        }
    }

    fn metres_per_second(&mut self) -> f64 {
        let duration = self.duration();
        if duration <= 0.0 {
            return 0.0;
        }
        self.travel_distance() / duration
    }
}

fn most_common(types: impl Iterator<Item = ActivityType>) -> Option<ActivityType> {
    let mut counts: HashMap<ActivityType, usize> = HashMap::new();
    for activity_type in types {
        *counts.entry(activity_type).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(activity_type, count)| (*count, activity_type.name()))
        .map(|(activity_type, _)| activity_type)
}

// ============================================================================
// TIMELINE ITEM
// ============================================================================

/// A Visit or Path with identity, shared via `Arc` between the store, the
/// processing queue and observers.
#[derive(Debug)]
pub struct TimelineItem {
    pub id: Uuid,
    state: ReentrantMutex<RefCell<ItemState>>,
}

impl TimelineItem {
    pub(crate) fn new(kind: ItemKind) -> Arc<Self> {
        Self::with_id(Uuid::new_v4(), kind)
    }

    pub(crate) fn with_id(id: Uuid, kind: ItemKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: ReentrantMutex::new(RefCell::new(ItemState {
                kind,
                deleted: false,
                merge_locked: false,
                finalised: false,
                last_modified: unix_now(),
                last_saved: None,
                samples: Vec::new(),
                previous_id: None,
                next_id: None,
                step_count: None,
                floors_up: None,
                floors_down: None,
                cache: ItemCache::default(),
            })),
        })
    }

    fn read<R>(&self, f: impl FnOnce(&ItemState) -> R) -> R {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&state)
    }

    fn write<R>(&self, f: impl FnOnce(&mut ItemState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    // ========================================================================
    // IDENTITY & FLAGS
    // ========================================================================

    pub fn kind(&self) -> ItemKind {
        self.read(|s| s.kind)
    }

    pub fn is_visit(&self) -> bool {
        self.kind() == ItemKind::Visit
    }

    pub fn is_path(&self) -> bool {
        self.kind() == ItemKind::Path
    }

    pub fn deleted(&self) -> bool {
        self.read(|s| s.deleted)
    }

    pub fn merge_locked(&self) -> bool {
        self.read(|s| s.merge_locked)
    }

    /// Pins the item against any merge participation, e.g. while the user
    /// is editing it.
    pub fn set_merge_locked(&self, locked: bool) {
        self.write(|s| s.merge_locked = locked);
    }

    pub fn is_finalised(&self) -> bool {
        self.read(|s| s.finalised)
    }

    pub(crate) fn set_finalised(&self) {
        self.write(|s| s.finalised = true);
    }

    pub fn last_modified(&self) -> Timestamp {
        self.read(|s| s.last_modified)
    }

    pub fn last_saved(&self) -> Option<Timestamp> {
        self.read(|s| s.last_saved)
    }

    pub(crate) fn set_last_saved(&self, date: Timestamp) {
        self.write(|s| s.last_saved = Some(date));
    }

    /// Marks the item deleted. The sample list must already be empty; both
    /// links are nulled. Violations are programmer errors.
    pub(crate) fn delete(&self) {
        self.write(|s| {
            assert!(
                s.samples.is_empty(),
                "attempt to delete item {} still holding {} samples",
                self.id,
                s.samples.len()
            );
            s.deleted = true;
            s.previous_id = None;
            s.next_id = None;
            s.samples_changed();
        });
    }

    // ========================================================================
    // LINKS
    // ========================================================================

    pub fn previous_id(&self) -> Option<Uuid> {
        self.read(|s| s.previous_id)
    }

    pub fn next_id(&self) -> Option<Uuid> {
        self.read(|s| s.next_id)
    }

    pub(crate) fn set_previous_id(&self, id: Option<Uuid>) {
        assert_ne!(id, Some(self.id), "item {} may not link to itself", self.id);
        self.write(|s| s.previous_id = id);
    }

    pub(crate) fn set_next_id(&self, id: Option<Uuid>) {
        assert_ne!(id, Some(self.id), "item {} may not link to itself", self.id);
        self.write(|s| s.next_id = id);
    }

    // ========================================================================
    // SAMPLES
    // ========================================================================

    pub fn samples(&self) -> Vec<Arc<Sample>> {
        self.read(|s| s.samples.clone())
    }

    pub fn sample_count(&self) -> usize {
        self.read(|s| s.samples.len())
    }

    /// Adds samples, claiming ownership of each. Keys stay unique and the
    /// list stays date-ordered. Adding to a deleted item is a programmer
    /// error.
    pub(crate) fn add_samples(&self, samples: &[Arc<Sample>]) {
        if samples.is_empty() {
            return;
        }
        self.write(|state| {
            assert!(
                !state.deleted,
                "attempt to add samples to deleted item {}",
                self.id
            );
            for sample in samples {
                if state.samples.iter().any(|s| s.id == sample.id) {
                    continue;
                }
                sample.set_item_id(Some(self.id));
                state.samples.push(sample.clone());
            }
            state.samples.sort_by(|a, b| {
                a.date
                    .partial_cmp(&b.date)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            state.samples_changed();
        });
    }

    /// Drops every cached aggregate. For mutations that change derived
    /// values without touching the sample list, e.g. a confirmed activity
    /// type.
    pub(crate) fn invalidate_caches(&self) {
        self.write(|s| s.samples_changed());
    }

    /// Removes samples, releasing ownership of any that pointed here.
    pub(crate) fn remove_samples(&self, samples: &[Arc<Sample>]) {
        if samples.is_empty() {
            return;
        }
        self.write(|state| {
            state
                .samples
                .retain(|s| !samples.iter().any(|r| r.id == s.id));
            for sample in samples {
                if sample.item_id() == Some(self.id) {
                    sample.set_item_id(None);
                }
            }
            state.samples_changed();
        });
    }

    // ========================================================================
    // CACHED AGGREGATES
    // ========================================================================

    pub fn date_range(&self) -> Option<DateRange> {
        self.write(|s| s.date_range())
    }

    pub fn start_date(&self) -> Option<Timestamp> {
        self.date_range().map(|r| r.start)
    }

    pub fn end_date(&self) -> Option<Timestamp> {
        self.date_range().map(|r| r.end)
    }

    pub fn duration(&self) -> f64 {
        self.write(|s| s.duration())
    }

    pub fn centre(&self) -> Option<Point<f64>> {
        self.write(|s| s.centre())
    }

    pub fn radius(&self) -> Radius {
        self.write(|s| s.radius())
    }

    pub fn altitude(&self) -> Option<f64> {
        self.write(|s| s.altitude())
    }

    /// Total along-track distance over usable coordinates, in metres.
    pub fn travel_distance(&self) -> f64 {
        self.write(|s| s.travel_distance())
    }

    pub fn metres_per_second(&self) -> f64 {
        self.write(|s| s.metres_per_second())
    }

    pub fn classifier_results(&self) -> ClassifierResults {
        self.write(|s| s.classifier_results())
    }

    pub fn activity_type(&self) -> Option<ActivityType> {
        self.write(|s| s.activity_type())
    }

    pub fn moving_activity_type(&self) -> Option<ActivityType> {
        self.write(|s| s.moving_activity_type())
    }

    pub fn mode_activity_type(&self) -> Option<ActivityType> {
        self.write(|s| s.mode_activity_type())
    }

    pub fn mode_moving_activity_type(&self) -> Option<ActivityType> {
        self.write(|s| s.mode_moving_activity_type())
    }

    pub fn segments(&self) -> Vec<ItemSegment> {
        self.write(|s| s.segments())
    }

    // ========================================================================
    // PEDOMETER AGGREGATES
    // ========================================================================

    pub fn step_count(&self) -> Option<u32> {
        self.read(|s| s.step_count)
    }

    pub fn set_step_count(&self, steps: Option<u32>) {
        self.write(|s| s.step_count = steps);
    }

    pub fn floors_up(&self) -> Option<u32> {
        self.read(|s| s.floors_up)
    }

    pub fn floors_down(&self) -> Option<u32> {
        self.read(|s| s.floors_down)
    }

    pub fn set_floors(&self, up: Option<u32>, down: Option<u32>) {
        self.write(|s| {
            s.floors_up = up;
            s.floors_down = down;
        });
    }

    // ========================================================================
    // CHARACTER
    // ========================================================================

    /// A recording outage: a Path whose first sample is an `off` marker.
    pub fn is_data_gap(&self) -> bool {
        self.read(|s| s.is_data_gap())
    }

    /// "No location": no sample carries a usable coordinate.
    pub fn is_nolo(&self) -> bool {
        self.read(|s| s.is_nolo())
    }

    pub fn is_valid(&self) -> bool {
        self.write(|s| s.is_valid())
    }

    pub fn is_worth_keeping(&self) -> bool {
        self.write(|s| s.is_worth_keeping())
    }

    pub fn keepness(&self) -> Keepness {
        self.write(|s| s.keepness())
    }

    // ========================================================================
    // EDGES
    // ========================================================================

    /// True when `other` sits later on the timeline than self.
    fn precedes(&self, other: &TimelineItem) -> Option<bool> {
        let mine = self.date_range()?;
        let theirs = other.date_range()?;
        Some(mine.start < theirs.start || (mine.start == theirs.start && mine.end < theirs.end))
    }

    /// The sample on the edge facing `other`.
    pub fn edge_sample(&self, other: &TimelineItem) -> Option<Arc<Sample>> {
        if self.precedes(other)? {
            self.read(|s| s.samples.last().cloned())
        } else {
            self.read(|s| s.samples.first().cloned())
        }
    }

    /// The first sample with a usable coordinate, searching inward from the
    /// edge facing `other`.
    pub fn edge_sample_with_coordinate(&self, other: &TimelineItem) -> Option<Arc<Sample>> {
        let from_end = self.precedes(other)?;
        self.read(|s| {
            if from_end {
                s.samples.iter().rev().find(|s| s.has_usable_coordinate()).cloned()
            } else {
                s.samples.iter().find(|s| s.has_usable_coordinate()).cloned()
            }
        })
    }

    /// The sample one step inward from the edge facing `other`.
    pub fn second_edge_sample(&self, other: &TimelineItem) -> Option<Arc<Sample>> {
        let from_end = self.precedes(other)?;
        self.read(|s| {
            if from_end {
                s.samples.iter().rev().nth(1).cloned()
            } else {
                s.samples.get(1).cloned()
            }
        })
    }

    // ========================================================================
    // GEOMETRY QUERIES
    // ========================================================================

    /// Time between the two items: positive is a gap, negative is an
    /// overlap whose magnitude equals the overlap duration.
    pub fn time_interval_since(&self, other: &TimelineItem) -> Option<f64> {
        let (earlier, later) = if self.precedes(other)? {
            (self.date_range()?, other.date_range()?)
        } else {
            (other.date_range()?, self.date_range()?)
        };
        Some(later.start - earlier.end)
    }

    /// Geographic distance to another item, dispatched on the kind pair.
    /// `None` when either side lacks the coordinates to answer.
    pub fn distance_from(&self, other: &TimelineItem) -> Option<f64> {
        match (self.kind(), other.kind()) {
            (ItemKind::Visit, ItemKind::Visit) => {
                let d = geodesy::distance_between(self.centre()?, other.centre()?);
                Some(d - self.radius().with_sd(2.0) - other.radius().with_sd(2.0))
            }
            (ItemKind::Visit, ItemKind::Path) => visit_to_path_distance(self, other),
            (ItemKind::Path, ItemKind::Visit) => visit_to_path_distance(other, self),
            (ItemKind::Path, ItemKind::Path) => {
                let mine = self.edge_sample_with_coordinate(other)?;
                let theirs = other.edge_sample_with_coordinate(self)?;
                // The true separation may be smaller than measured by up to
                // each fix's accuracy; don't let noise keep neighbours apart.
                let allowance = edge_accuracy(&mine) + edge_accuracy(&theirs);
                Some(geodesy::distance_between(mine.point()?, theirs.point()?) - allowance)
            }
        }
    }

    /// Whether a coordinate falls inside this item's footprint.
    ///
    /// Visits test against the clamped N-sigma radius. Paths run a sliding
    /// pairwise test along the polyline, each sample's tolerance being the
    /// larger of its neighbour gaps, floored at 10 m.
    pub fn contains_location(&self, point: Point<f64>, n_sd: f64) -> bool {
        match self.kind() {
            ItemKind::Visit => match self.centre() {
                Some(centre) => {
                    geodesy::distance_between(centre, point) <= self.radius().clamped(n_sd)
                }
                None => false,
            },
            ItemKind::Path => {
                let points: Vec<Point<f64>> =
                    self.read(|s| s.usable_points());
                for (i, sample_point) in points.iter().enumerate() {
                    let to_prev = (i > 0)
                        .then(|| geodesy::distance_between(points[i - 1], *sample_point))
                        .unwrap_or(0.0);
                    let to_next = (i + 1 < points.len())
                        .then(|| geodesy::distance_between(points[i + 1], *sample_point))
                        .unwrap_or(0.0);
                    let tolerance = to_prev.max(to_next).max(10.0);
                    if geodesy::distance_between(*sample_point, point) <= tolerance {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// The largest geographic gap across which this item may merge with
    /// `other`, derived from speeds and the time gap between them.
    pub fn maximum_mergeable_distance(&self, other: &TimelineItem) -> f64 {
        let gap = self
            .time_interval_since(other)
            .map(|dt| dt.abs())
            .unwrap_or(0.0);
        match (self.kind(), other.kind()) {
            (ItemKind::Visit, ItemKind::Visit) => f64::INFINITY,
            (ItemKind::Visit, ItemKind::Path) => {
                (other.metres_per_second() * gap * 4.0).max(MIN_VISIT_PATH_MERGEABLE_DISTANCE)
            }
            (ItemKind::Path, ItemKind::Visit) => {
                (self.metres_per_second() * gap * 4.0).max(MIN_VISIT_PATH_MERGEABLE_DISTANCE)
            }
            (ItemKind::Path, ItemKind::Path) => {
                let mean_mps =
                    (self.metres_per_second() + other.metres_per_second()) / 2.0;
                mean_mps * gap * 4.0
            }
        }
    }
}

fn visit_to_path_distance(visit: &TimelineItem, path: &TimelineItem) -> Option<f64> {
    let centre = visit.centre()?;
    let edge = path.edge_sample_with_coordinate(visit)?;
    let d = geodesy::distance_between(centre, edge.point()?);
    Some(d - visit.radius().with_sd(2.0) - edge_accuracy(&edge))
}

fn edge_accuracy(sample: &Sample) -> f64 {
    sample
        .location
        .map(|l| l.horizontal_accuracy.max(0.0))
        .unwrap_or(0.0)
}

impl PartialEq for TimelineItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TimelineItem {}
