//! Merge engine: candidate enumeration around a focal item, scoring,
//! execution, the fixpoint processing loop, and the safe-delete policy
//! built on top of it.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::item::{ItemKind, Keepness, TimelineItem};
use crate::sample::{RecordingState, Sample};
use crate::sanitise::sanitise_edges;
use crate::settings::DATA_GAP_INSERTION_THRESHOLD;
use crate::store::Store;

// ============================================================================
// SCORING
// ============================================================================

/// Merge desirability, worst first. `Impossible` merges are never executed
/// by the processing loop, only by a forced safe-delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MergeScore {
    Impossible,
    VeryLow,
    Low,
    Medium,
    High,
    Perfect,
}

impl MergeScore {
    /// One notch worse, bottoming out above `Impossible`: demotion can
    /// never forbid a merge outright.
    fn demoted(self) -> MergeScore {
        match self {
            MergeScore::Perfect => MergeScore::High,
            MergeScore::High => MergeScore::Medium,
            MergeScore::Medium => MergeScore::Low,
            _ => MergeScore::VeryLow,
        }
    }
}

/// Time gap above which a merge loses one notch, in seconds.
const SMALL_GAP: f64 = 120.0;

/// Time gap above which a merge loses two notches, in seconds.
const LARGE_GAP: f64 = 1_800.0;

/// Largest time gap a location-less merge is allowed to span, in seconds.
const NOLO_MERGE_GAP: f64 = 120.0;

/// Separation below which two non-overlapping visits still read as the
/// same place, in metres.
const NEARBY_VISIT_DISTANCE: f64 = 50.0;

// ============================================================================
// MERGE
// ============================================================================

/// A planned merge: `betweener` (if any) and `deadman` are consumed into
/// `keeper`.
#[derive(Clone)]
pub struct Merge {
    pub keeper: Arc<TimelineItem>,
    pub betweener: Option<Arc<TimelineItem>>,
    pub deadman: Arc<TimelineItem>,
}

impl Merge {
    pub fn new(
        keeper: &Arc<TimelineItem>,
        betweener: Option<&Arc<TimelineItem>>,
        deadman: &Arc<TimelineItem>,
    ) -> Self {
        Self {
            keeper: keeper.clone(),
            betweener: betweener.cloned(),
            deadman: deadman.clone(),
        }
    }

    fn dedup_key(&self) -> (Uuid, Option<Uuid>, Uuid) {
        (
            self.keeper.id,
            self.betweener.as_ref().map(|b| b.id),
            self.deadman.id,
        )
    }

    pub fn description(&self) -> String {
        match &self.betweener {
            Some(betweener) => format!(
                "{} {} <- {} {} <- {} {}",
                self.keeper.kind().name(),
                self.keeper.id,
                betweener.kind().name(),
                betweener.id,
                self.deadman.kind().name(),
                self.deadman.id
            ),
            None => format!(
                "{} {} <- {} {}",
                self.keeper.kind().name(),
                self.keeper.id,
                self.deadman.kind().name(),
                self.deadman.id
            ),
        }
    }

    fn is_viable(&self) -> bool {
        if self.keeper.id == self.deadman.id {
            return false;
        }
        if self.keeper.deleted() || self.deadman.deleted() {
            return false;
        }
        if self.keeper.merge_locked() || self.deadman.merge_locked() {
            return false;
        }
        if let Some(betweener) = &self.betweener {
            if betweener.deleted() || betweener.merge_locked() {
                return false;
            }
            if betweener.id == self.keeper.id || betweener.id == self.deadman.id {
                return false;
            }
        }
        true
    }

    /// Scores this merge. Kind compatibility sets the base; keepness
    /// inversion, temporal separation and long overlaps each demote it.
    pub fn score(&self) -> MergeScore {
        if !self.is_viable() {
            return MergeScore::Impossible;
        }
        let keeper = &self.keeper;
        let deadman = &self.deadman;

        // Data gaps are preserved, not merged away, unless a forced merge
        // overrides the score.
        if keeper.is_data_gap() || deadman.is_data_gap() {
            return MergeScore::Impossible;
        }

        // Without coordinates there is no geometry to trust; only near
        // timeline-adjacent merges are allowed, and reluctantly.
        if keeper.is_nolo() || deadman.is_nolo() {
            let gap = keeper
                .time_interval_since(deadman)
                .map(f64::abs)
                .unwrap_or(f64::MAX);
            return if gap <= NOLO_MERGE_GAP {
                MergeScore::VeryLow
            } else {
                MergeScore::Impossible
            };
        }

        let Some(distance) = keeper.distance_from(deadman) else {
            return MergeScore::Impossible;
        };
        if distance > keeper.maximum_mergeable_distance(deadman) {
            return MergeScore::Impossible;
        }

        // Any score above Impossible will eventually be executed by the
        // processing loop, so cross-kind merges must earn their way in
        // through containment, not just adjacency.
        let mut score = match (keeper.kind(), deadman.kind()) {
            (ItemKind::Visit, ItemKind::Visit) => {
                if distance <= 0.0 {
                    // Overlapping radii: the same place seen twice.
                    MergeScore::Perfect
                } else if distance <= NEARBY_VISIT_DISTANCE {
                    MergeScore::Medium
                } else {
                    return MergeScore::Impossible;
                }
            }
            (ItemKind::Path, ItemKind::Path) => {
                match (
                    keeper.mode_moving_activity_type(),
                    deadman.mode_moving_activity_type(),
                ) {
                    (Some(mine), Some(theirs)) if mine == theirs => MergeScore::High,
                    (None, _) | (_, None) => MergeScore::Medium,
                    // A weak path of another type is noise worth absorbing;
                    // two real trips of different modes stay separate.
                    _ if deadman.keepness() < Keepness::Keeper => MergeScore::Low,
                    _ => return MergeScore::Impossible,
                }
            }
            (ItemKind::Visit, ItemKind::Path) => {
                if deadman.is_worth_keeping() {
                    return MergeScore::Impossible;
                }
                let inside = fraction_inside_visit(keeper, deadman);
                if inside >= 0.8 {
                    MergeScore::Medium
                } else if inside >= 0.5 {
                    MergeScore::Low
                } else {
                    // The path genuinely leaves the visit; eating it would
                    // erase a departure.
                    return MergeScore::Impossible;
                }
            }
            (ItemKind::Path, ItemKind::Visit) => match deadman.keepness() {
                // A visit that never even reached validity is a stationary
                // blip on the route. Anything sturdier is consumed only
                // through betweener and bridge merges.
                Keepness::Invalid => MergeScore::Medium,
                _ => return MergeScore::Impossible,
            },
        };

        if keeper.keepness() < deadman.keepness() {
            score = score.demoted();
        }

        if let Some(gap) = keeper.time_interval_since(deadman) {
            if gap > LARGE_GAP {
                score = score.demoted().demoted();
            } else if gap > SMALL_GAP {
                score = score.demoted();
            } else if gap < -SMALL_GAP {
                // Long overlaps mean the two items disagree about history.
                score = score.demoted();
            }
        }

        score
    }

    /// Executes the merge: transfers betweener then deadman samples into
    /// the keeper, bypasses the consumed chain, tombstones the consumed
    /// items and announces the result.
    pub(crate) fn execute(&self, store: &Store) -> Arc<TimelineItem> {
        let keeper = &self.keeper;
        debug!(merge = %self.description(), "executing merge");

        // Work out which way the keeper's outward link must jump before
        // the consumed items lose their dates and links.
        let chain_first = self.betweener.as_ref().unwrap_or(&self.deadman);
        let direction = if keeper.next_id() == Some(chain_first.id) {
            Some(Direction::Forward)
        } else if keeper.previous_id() == Some(chain_first.id) {
            Some(Direction::Backward)
        } else {
            None
        };

        let mut killed = Vec::new();
        for consumed in self.betweener.iter().chain(std::iter::once(&self.deadman)) {
            let samples = consumed.samples();
            let (markers, real): (Vec<Arc<Sample>>, Vec<Arc<Sample>>) =
                samples.into_iter().partition(|s| {
                    s.recording_state == RecordingState::Off && s.location.is_none()
                });
            // Synthetic gap markers die with their gap; everything else
            // moves into the keeper.
            if !real.is_empty() {
                store.assign_samples(keeper, &real);
            }
            if !markers.is_empty() {
                store.orphan_samples(consumed, &markers);
            }
            killed.push(consumed.clone());
        }

        match direction {
            Some(Direction::Forward) => {
                let outward = self
                    .deadman
                    .next_id()
                    .and_then(|id| store.resolve_item(id))
                    .filter(|n| n.id != keeper.id);
                store.set_next(keeper, outward.as_ref());
            }
            Some(Direction::Backward) => {
                let outward = self
                    .deadman
                    .previous_id()
                    .and_then(|id| store.resolve_item(id))
                    .filter(|p| p.id != keeper.id);
                store.set_previous(keeper, outward.as_ref());
            }
            None => {
                warn!(merge = %self.description(), "merge executed on non-adjacent items");
            }
        }

        for consumed in &killed {
            store.set_next(consumed, None);
            store.set_previous(consumed, None);
            consumed.delete();
        }

        store.events().publish(crate::events::TimelineEvent::MergedItems {
            kept: keeper.clone(),
            killed,
            description: self.description(),
        });
        store.mark_item_dirty(keeper);
        keeper.clone()
    }
}

enum Direction {
    Forward,
    Backward,
}

/// Share of the path's usable samples sitting inside the visit's 2-sigma
/// clamped radius.
fn fraction_inside_visit(visit: &TimelineItem, path: &TimelineItem) -> f64 {
    let samples = path.samples();
    let points: Vec<_> = samples.iter().filter_map(|s| s.point()).collect();
    if points.is_empty() {
        return 0.0;
    }
    let inside = points
        .iter()
        .filter(|p| visit.contains_location(**p, 2.0))
        .count();
    inside as f64 / points.len() as f64
}

// ============================================================================
// PROCESSOR
// ============================================================================

/// Why a safe-delete could not run.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("item has no neighbours to absorb it; deletion needs an external decision")]
    NoNeighbours,

    #[error("item is already deleted")]
    AlreadyDeleted,
}

/// Runs the merge loop. All entry points must be called on the store's
/// processing queue.
pub struct TimelineProcessor {
    store: Arc<Store>,
}

impl TimelineProcessor {
    pub(crate) fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Entry point: pools up to two keepers on each side of `item`, then
    /// merges the best candidate and recurses from the survivor until the
    /// top candidate is impossible.
    pub fn process_from(&self, item: &Arc<TimelineItem>) {
        let mut pool = self.collect_pool(item);
        loop {
            for pooled in &pool {
                if !pooled.deleted() {
                    sanitise_edges(&self.store, pooled);
                }
            }

            let mut seen = HashSet::new();
            let mut candidates: Vec<(Merge, MergeScore)> = Vec::new();
            for pooled in &pool {
                if pooled.deleted() {
                    continue;
                }
                for merge in self.candidates_around(pooled) {
                    if seen.insert(merge.dedup_key()) {
                        let score = merge.score();
                        candidates.push((merge, score));
                    }
                }
            }
            candidates.sort_by(|a, b| b.1.cmp(&a.1));

            let Some((best, score)) = candidates.into_iter().next() else {
                break;
            };
            if score == MergeScore::Impossible {
                break;
            }

            debug!(merge = %best.description(), ?score, "merge selected");
            let keeper = best.execute(&self.store);
            pool = self.collect_pool(&keeper);
        }
    }

    /// Walks outward from `item` gathering the candidate pool: the item
    /// itself plus neighbours until two keepers are found on each side.
    fn collect_pool(&self, item: &Arc<TimelineItem>) -> Vec<Arc<TimelineItem>> {
        let mut pool = vec![item.clone()];

        let mut keepers = 0;
        let mut cursor = item.clone();
        while keepers < 2 {
            let Some(previous) = self.store.resolve_previous(&cursor) else {
                break;
            };
            if previous.deleted() || previous.id == item.id {
                break;
            }
            if previous.is_worth_keeping() {
                keepers += 1;
            }
            pool.push(previous.clone());
            cursor = previous;
        }

        let mut keepers = 0;
        let mut cursor = item.clone();
        while keepers < 2 {
            let Some(next) = self.store.resolve_next(&cursor) else {
                break;
            };
            if next.deleted() || next.id == item.id {
                break;
            }
            if next.is_worth_keeping() {
                keepers += 1;
            }
            pool.push(next.clone());
            cursor = next;
        }

        pool
    }

    /// The keepness-driven proposals around one focal item: single steps
    /// both ways, betweener steps over a weaker neighbour, and the bridge
    /// across a weak focal item. Data gaps never appear as deadmen here.
    fn candidates_around(&self, item: &Arc<TimelineItem>) -> Vec<Merge> {
        let mut proposals = Vec::new();

        if let Some(next) = self.store.resolve_next(item).filter(|n| !n.deleted()) {
            proposals.push(Merge::new(item, None, &next));
            proposals.push(Merge::new(&next, None, item));
            if next.keepness() < item.keepness() {
                if let Some(next_next) =
                    self.store.resolve_next(&next).filter(|n| !n.deleted())
                {
                    if next_next.keepness() > next.keepness() {
                        proposals.push(Merge::new(item, Some(&next), &next_next));
                        proposals.push(Merge::new(&next_next, Some(&next), item));
                    }
                }
            }
        }

        if let Some(previous) = self.store.resolve_previous(item).filter(|p| !p.deleted()) {
            proposals.push(Merge::new(item, None, &previous));
            proposals.push(Merge::new(&previous, None, item));
            if previous.keepness() < item.keepness() {
                if let Some(previous_previous) = self
                    .store
                    .resolve_previous(&previous)
                    .filter(|p| !p.deleted())
                {
                    if previous_previous.keepness() > previous.keepness() {
                        proposals.push(Merge::new(item, Some(&previous), &previous_previous));
                        proposals.push(Merge::new(
                            &previous_previous,
                            Some(&previous),
                            item,
                        ));
                    }
                }
            }
        }

        if let (Some(previous), Some(next)) = (
            self.store.resolve_previous(item).filter(|p| !p.deleted()),
            self.store.resolve_next(item).filter(|n| !n.deleted()),
        ) {
            if previous.keepness() > item.keepness()
                && next.keepness() > item.keepness()
                && !previous.is_data_gap()
                && !next.is_data_gap()
            {
                proposals.push(Merge::new(&previous, Some(item), &next));
                proposals.push(Merge::new(&next, Some(item), &previous));
            }
        }

        // Data gaps are never deadmen here, and the item actively
        // receiving samples is never consumed out from under the recorder.
        let current_id = self.store.current_item_id();
        proposals.retain(|m| {
            if m.deadman.is_data_gap() {
                return false;
            }
            if Some(m.deadman.id) == current_id {
                return false;
            }
            if let Some(betweener) = &m.betweener {
                if Some(betweener.id) == current_id {
                    return false;
                }
            }
            true
        });
        proposals
    }

    /// Deletes an item by merging it into a neighbour. When no candidate
    /// scores above `Impossible`, the best one is forced through anyway.
    pub fn safe_delete(
        &self,
        deadman: &Arc<TimelineItem>,
    ) -> Result<Arc<TimelineItem>, DeleteError> {
        if deadman.deleted() {
            return Err(DeleteError::AlreadyDeleted);
        }
        sanitise_edges(&self.store, deadman);

        let previous = self
            .store
            .resolve_previous(deadman)
            .filter(|p| !p.deleted());
        let next = self.store.resolve_next(deadman).filter(|n| !n.deleted());

        let mut candidates = Vec::new();
        match (&previous, &next) {
            (Some(previous), Some(next)) => {
                candidates.push(Merge::new(next, Some(deadman), previous));
                candidates.push(Merge::new(previous, Some(deadman), next));
                candidates.push(Merge::new(previous, None, deadman));
                candidates.push(Merge::new(next, None, deadman));
            }
            (Some(previous), None) => candidates.push(Merge::new(previous, None, deadman)),
            (None, Some(next)) => candidates.push(Merge::new(next, None, deadman)),
            (None, None) => return Err(DeleteError::NoNeighbours),
        }

        let mut scored: Vec<(Merge, MergeScore)> = candidates
            .into_iter()
            .map(|m| {
                let score = m.score();
                (m, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let (chosen, score) = scored.into_iter().next().expect("candidate list non-empty");
        if score == MergeScore::Impossible {
            debug!(item = %deadman.id, "forcing merge for safe delete");
        }
        let keeper = chosen.execute(&self.store);
        self.process_from(&keeper);
        Ok(keeper)
    }

    /// Heals a recording outage: synthesises a data-gap Path between two
    /// items separated by more than the insertion threshold, linking both
    /// sides. Returns `None` when the separation is too small or either
    /// item has no dates.
    pub(crate) fn insert_data_gap(
        &self,
        earlier: &Arc<TimelineItem>,
        later: &Arc<TimelineItem>,
    ) -> Option<Arc<TimelineItem>> {
        let start = earlier.end_date()?;
        let end = later.start_date()?;
        if end - start <= DATA_GAP_INSERTION_THRESHOLD {
            return None;
        }

        let gap = self.store.create_empty_item(ItemKind::Path);
        let markers = [
            self.store.create_data_gap_sample(start),
            self.store.create_data_gap_sample(end),
        ];
        self.store.assign_samples(&gap, &markers);
        self.store.set_next(earlier, Some(&gap));
        self.store.set_next(&gap, Some(later));
        debug!(
            gap = %gap.id,
            duration = end - start,
            "inserted data gap"
        );
        Some(gap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{
        ActivityType, Location, MotionFeatures, MovingState, RawObservation, RecordingState,
        Timestamp,
    };
    use crate::settings::TimelineConfig;

    fn raw(
        date: Timestamp,
        lat: f64,
        lon: f64,
        speed: f64,
        moving: bool,
    ) -> RawObservation {
        RawObservation {
            date,
            location: Some(Location {
                latitude: lat,
                longitude: lon,
                altitude: None,
                horizontal_accuracy: 8.0,
                vertical_accuracy: -1.0,
                course: None,
                speed: Some(speed),
            }),
            moving_state: if moving {
                MovingState::Moving
            } else {
                MovingState::Stationary
            },
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

    fn build_visit(
        store: &Store,
        at: (f64, f64),
        start: Timestamp,
        duration: f64,
        count: usize,
    ) -> Arc<TimelineItem> {
        let step = duration / count.max(1) as f64;
        let samples: Vec<_> = (0..count)
            .map(|i| store.create_sample(&raw(start + i as f64 * step, at.0, at.1, 0.0, false)))
            .collect();
        for sample in &samples {
            sample.confirm_activity_type(ActivityType::Stationary);
        }
        let visit = store.create_visit(&samples[0]);
        store.assign_samples(&visit, &samples[1..]);
        visit
    }

    fn build_walk(
        store: &Store,
        from: (f64, f64),
        to: (f64, f64),
        start: Timestamp,
        duration: f64,
        count: usize,
    ) -> Arc<TimelineItem> {
        let samples: Vec<_> = (0..count)
            .map(|i| {
                let t = i as f64 / (count - 1).max(1) as f64;
                store.create_sample(&raw(
                    start + t * duration,
                    from.0 + (to.0 - from.0) * t,
                    from.1 + (to.1 - from.1) * t,
                    1.4,
                    true,
                ))
            })
            .collect();
        for sample in &samples {
            sample.confirm_activity_type(ActivityType::Walking);
        }
        let path = store.create_path(&samples[0]);
        store.assign_samples(&path, &samples[1..]);
        path
    }

    #[test]
    fn test_score_orders_as_expected() {
        assert!(MergeScore::Perfect > MergeScore::High);
        assert!(MergeScore::VeryLow > MergeScore::Impossible);
        assert_eq!(MergeScore::VeryLow.demoted(), MergeScore::VeryLow);
    }

    #[test]
    fn test_overlapping_visits_score_perfect() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let a = build_visit(&store, home, 0.0, 600.0, 10);
        let b = build_visit(&store, home, 630.0, 600.0, 10);
        store.set_next(&a, Some(&b));

        let merge = Merge::new(&a, None, &b);
        assert_eq!(merge.score(), MergeScore::Perfect);
    }

    #[test]
    fn test_locked_item_scores_impossible() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let a = build_visit(&store, home, 0.0, 600.0, 10);
        let b = build_visit(&store, home, 630.0, 600.0, 10);
        store.set_next(&a, Some(&b));
        b.set_merge_locked(true);

        assert_eq!(Merge::new(&a, None, &b).score(), MergeScore::Impossible);
    }

    #[test]
    fn test_data_gap_deadman_scores_impossible() {
        let store = test_store();
        let a = build_visit(&store, (-33.8688, 151.2093), 0.0, 600.0, 10);
        let processor = TimelineProcessor::new(store.clone());
        let b = build_visit(&store, (-33.8688, 151.2093), 47_400.0, 600.0, 10);
        let gap = processor.insert_data_gap(&a, &b).unwrap();

        assert_eq!(Merge::new(&a, None, &gap).score(), MergeScore::Impossible);
    }

    #[test]
    fn test_merge_execution_transfers_and_relinks() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let a = build_visit(&store, home, 0.0, 600.0, 10);
        let b = build_visit(&store, home, 630.0, 600.0, 10);
        let c = build_walk(&store, home, (-33.86, 151.21), 1_260.0, 300.0, 10);
        store.set_next(&a, Some(&b));
        store.set_next(&b, Some(&c));

        let b_samples: Vec<Uuid> = b.samples().iter().map(|s| s.id).collect();
        let keeper = Merge::new(&a, None, &b).execute(&store);

        assert_eq!(keeper.id, a.id);
        assert_eq!(a.sample_count(), 20);
        assert!(b.deleted());
        assert_eq!(b.sample_count(), 0);
        assert!(b.previous_id().is_none() && b.next_id().is_none());
        assert_eq!(a.next_id(), Some(c.id));
        assert_eq!(c.previous_id(), Some(a.id));
        for id in b_samples {
            assert_eq!(store.sample(id).unwrap().item_id(), Some(a.id));
        }
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_betweener_merge_takes_all_samples() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let away = (-33.86, 151.21);

        // Walk — 8 s noise visit — walk, all within a few metres.
        let p1 = build_walk(&store, home, away, 0.0, 300.0, 10);
        let noise = build_visit(&store, away, 300.0, 8.0, 3);
        let p2 = build_walk(&store, away, home, 308.0, 300.0, 10);
        store.set_next(&p1, Some(&noise));
        store.set_next(&noise, Some(&p2));

        let keeper = Merge::new(&p1, Some(&noise), &p2).execute(&store);
        assert_eq!(keeper.id, p1.id);
        assert_eq!(p1.sample_count(), 23);
        assert!(noise.deleted() && p2.deleted());
        assert!(p1.next_id().is_none());
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_process_from_swallows_noise_visit() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let away = (-33.8660, 151.2093);

        let p1 = build_walk(&store, home, away, 0.0, 300.0, 20);
        let noise = build_visit(&store, away, 302.0, 8.0, 3);
        let p2 = build_walk(&store, away, home, 312.0, 300.0, 20);
        store.set_next(&p1, Some(&noise));
        store.set_next(&noise, Some(&p2));

        let processor = TimelineProcessor::new(store.clone());
        processor.process_from(&p2);

        // One walking path should remain covering the whole span.
        let survivors: Vec<_> = [&p1, &noise, &p2]
            .iter()
            .filter(|i| !i.deleted())
            .map(|i| (*i).clone())
            .collect();
        assert_eq!(survivors.len(), 1, "exactly one item should survive");
        let survivor = &survivors[0];
        assert!(survivor.is_path());
        assert_eq!(survivor.sample_count(), 43);
        assert!(survivor.previous_id().is_none());
        assert!(survivor.next_id().is_none());
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_process_from_is_idempotent_at_fixpoint() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let away = (-33.8660, 151.2093);

        let p1 = build_walk(&store, home, away, 0.0, 300.0, 20);
        let noise = build_visit(&store, away, 302.0, 8.0, 3);
        let p2 = build_walk(&store, away, home, 312.0, 300.0, 20);
        store.set_next(&p1, Some(&noise));
        store.set_next(&noise, Some(&p2));

        let processor = TimelineProcessor::new(store.clone());
        processor.process_from(&p2);
        let survivor = [&p1, &noise, &p2]
            .into_iter()
            .find(|i| !i.deleted())
            .unwrap()
            .clone();
        let count_after_first = survivor.sample_count();
        let modified_after_first = survivor.last_modified();

        processor.process_from(&survivor);
        assert_eq!(survivor.sample_count(), count_after_first);
        assert_eq!(survivor.last_modified(), modified_after_first);
    }

    #[test]
    fn test_long_data_gap_survives_processing() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let work = (-33.8650, 151.2093);

        let a = build_visit(&store, home, 0.0, 600.0, 20);
        let b = build_visit(&store, work, 600.0 + 13.0 * 3_600.0, 600.0, 20);
        let processor = TimelineProcessor::new(store.clone());
        let gap = processor.insert_data_gap(&a, &b).unwrap();
        assert!(gap.is_worth_keeping());

        processor.process_from(&a);

        assert!(!a.deleted() && !b.deleted() && !gap.deleted());
        assert_eq!(a.next_id(), Some(gap.id));
        assert_eq!(gap.next_id(), Some(b.id));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_safe_delete_middle_visit() {
        let store = test_store();
        let home = (-33.8688, 151.2093);
        let away = (-33.8660, 151.2093);

        let p1 = build_walk(&store, home, away, 0.0, 300.0, 20);
        let visit = build_visit(&store, away, 302.0, 600.0, 20);
        let p2 = build_walk(&store, away, home, 904.0, 300.0, 20);
        store.set_next(&p1, Some(&visit));
        store.set_next(&visit, Some(&p2));

        let processor = TimelineProcessor::new(store.clone());
        let keeper = processor.safe_delete(&visit).unwrap();

        assert!(visit.deleted());
        assert!(keeper.is_path());
        assert!(!keeper.deleted());
        assert_eq!(keeper.sample_count(), 60);
        store.verify_integrity().unwrap();
    }

    #[test]
    fn test_safe_delete_without_neighbours_refuses() {
        let store = test_store();
        let visit = build_visit(&store, (-33.8688, 151.2093), 0.0, 600.0, 10);
        let processor = TimelineProcessor::new(store.clone());
        assert!(matches!(
            processor.safe_delete(&visit),
            Err(DeleteError::NoNeighbours)
        ));
        assert!(!visit.deleted());
    }

    #[test]
    fn test_insert_data_gap_links_and_marks() {
        let store = test_store();
        let a = build_visit(&store, (-33.8688, 151.2093), 0.0, 600.0, 10);
        let b = build_visit(&store, (-33.8650, 151.2093), 1_800.0, 600.0, 10);
        let processor = TimelineProcessor::new(store.clone());

        let gap = processor.insert_data_gap(&a, &b).unwrap();
        assert!(gap.is_data_gap());
        assert_eq!(gap.start_date(), a.end_date());
        assert_eq!(gap.end_date(), b.start_date());
        assert_eq!(a.next_id(), Some(gap.id));
        assert_eq!(b.previous_id(), Some(gap.id));
        store.verify_integrity().unwrap();

        // Below the threshold no gap is created.
        let c = build_visit(&store, (-33.8688, 151.2093), 2_460.0, 600.0, 10);
        assert!(processor.insert_data_gap(&b, &c).is_none());
    }
}
