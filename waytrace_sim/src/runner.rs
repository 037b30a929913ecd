//! Scenario runner: drives the engine from the trip oracle, then checks
//! the scenario's expectations and the structural invariants.

use std::sync::{Arc, Mutex};

use tracing::debug;

use waytrace_core::{
    ActivityType, RawObservation, TimelineConfig, TimelineEngine, TimelineEvent, TimelineItem,
};

use crate::scenarios::ScenarioId;
use crate::trips::{SpeedClassifier, TripOracle};

/// Outcome of one scenario run.
#[derive(Debug)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,
    pub passed: bool,
    pub observations: usize,
    pub final_item_count: usize,
    pub failure_reason: Option<String>,
}

/// Runs scenarios against a fresh engine per run.
pub struct ScenarioRunner {
    seed: u64,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let mut harness = Harness::new();
        let outcome = match scenario {
            ScenarioId::ModeShiftNoise => mode_shift_noise(&mut harness, self.seed),
            ScenarioId::VisitThenWalk => visit_then_walk(&mut harness, self.seed),
            ScenarioId::NoiseVisitSwallowed => noise_visit_swallowed(&mut harness, self.seed),
            ScenarioId::BridgeMerge => bridge_merge(&mut harness, self.seed),
            ScenarioId::DataGapPreserved => data_gap_preserved(&mut harness, self.seed),
            ScenarioId::SafeDeleteMiddle => safe_delete_middle(&mut harness, self.seed),
            ScenarioId::CityDay => city_day(&mut harness, self.seed),
        };

        let final_item_count = harness.timeline().len();
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            observations: harness.observations,
            final_item_count,
            failure_reason: outcome.err(),
        }
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// One engine plus feeding and inspection helpers shared by all scenarios.
pub struct Harness {
    pub engine: TimelineEngine,
    pub observations: usize,
}

impl Harness {
    pub fn new() -> Self {
        let config = TimelineConfig {
            // Scenarios use 1-6 s cadences; never let the limiter interfere.
            samples_per_minute: 600.0,
            save_batch_size: 100_000,
            ..TimelineConfig::default()
        };
        Self {
            engine: TimelineEngine::new(config).with_classifier(Arc::new(SpeedClassifier)),
            observations: 0,
        }
    }

    /// Feeds a leg of observations, then re-checks the whole graph.
    pub fn feed(&mut self, observations: Vec<RawObservation>) -> Result<(), String> {
        for raw in observations {
            self.engine.record_sync(raw);
            self.observations += 1;
        }
        self.engine
            .store()
            .verify_integrity()
            .map_err(|violation| format!("integrity violated: {violation}"))
    }

    /// The live timeline in chronological order, found by walking links
    /// out from the current item.
    pub fn timeline(&self) -> Vec<Arc<TimelineItem>> {
        let Some(mut cursor) = self.engine.current_item() else {
            return Vec::new();
        };
        let store = self.engine.store();
        let mut hops = 0;
        while let Some(previous) = store.resolve_previous(&cursor) {
            cursor = previous;
            hops += 1;
            if hops > 10_000 {
                break;
            }
        }
        let mut items = vec![cursor];
        while let Some(next) = store.resolve_next(items.last().expect("non-empty")) {
            items.push(next);
            if items.len() > 10_000 {
                break;
            }
        }
        items
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

fn expect(condition: bool, message: impl Into<String>) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// TLP-001: 30 s at 4 km/h, 3 s at 9 km/h, 30 s at 4 km/h. The spike
/// splits at the router, but processing must knit one walking path back.
fn mode_shift_noise(harness: &mut Harness, seed: u64) -> Result<(), String> {
    let mut oracle = TripOracle::new(seed).with_cadence(1.0);
    harness.feed(oracle.travel(4.0, 90.0, 30.0))?;
    harness.feed(oracle.travel(9.0, 90.0, 3.0))?;
    harness.feed(oracle.travel(4.0, 90.0, 30.0))?;
    harness.engine.flush();

    let timeline = harness.timeline();
    expect(
        timeline.len() == 1,
        format!("expected a single item, found {}", timeline.len()),
    )?;
    let path = &timeline[0];
    expect(path.is_path(), "survivor should be a path")?;
    expect(
        path.mode_activity_type() == Some(ActivityType::Walking),
        format!("mode should be walking, got {:?}", path.mode_activity_type()),
    )?;
    expect(
        path.sample_count() == harness.observations,
        format!(
            "path should hold all {} samples, has {}",
            harness.observations,
            path.sample_count()
        ),
    )
}

/// TLP-002: 5 min stationary then 2 min walking away: exactly two linked
/// items, and the visit is a keeper.
fn visit_then_walk(harness: &mut Harness, seed: u64) -> Result<(), String> {
    let mut oracle = TripOracle::new(seed);
    harness.feed(oracle.dwell(300.0))?;
    harness.feed(oracle.travel(4.0, 0.0, 120.0))?;
    harness.engine.flush();

    let timeline = harness.timeline();
    expect(
        timeline.len() == 2,
        format!("expected Visit then Path, found {} items", timeline.len()),
    )?;
    let (visit, path) = (&timeline[0], &timeline[1]);
    expect(visit.is_visit(), "first item should be a visit")?;
    expect(path.is_path(), "second item should be a path")?;
    expect(visit.is_worth_keeping(), "the visit should be a keeper")?;
    expect(
        visit.next_id() == Some(path.id) && path.previous_id() == Some(visit.id),
        "visit and path should be mutually linked",
    )
}

/// TLP-003: walking, 8 s of stationary noise, walking again. One path must
/// cover the full span with the transient visit deleted.
fn noise_visit_swallowed(harness: &mut Harness, seed: u64) -> Result<(), String> {
    let mut oracle = TripOracle::new(seed).with_cadence(1.0);
    harness.feed(oracle.travel(4.0, 45.0, 120.0))?;
    harness.feed(oracle.dwell(8.0))?;
    harness.feed(oracle.travel(4.0, 45.0, 120.0))?;
    harness.engine.flush();

    let timeline = harness.timeline();
    expect(
        timeline.len() == 1,
        format!("expected one surviving path, found {}", timeline.len()),
    )?;
    let path = &timeline[0];
    expect(path.is_path(), "survivor should be a path")?;
    expect(
        path.sample_count() == harness.observations,
        format!(
            "all {} samples should survive in the path, found {}",
            harness.observations,
            path.sample_count()
        ),
    )
}

/// TLP-004: strong walk, a 60 s (valid but sub-keeper) visit, strong walk.
/// Once both paths are keepers a bridge merge consumes the middle and the
/// far side in one event.
fn bridge_merge(harness: &mut Harness, seed: u64) -> Result<(), String> {
    let killed_counts: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = killed_counts.clone();
    let _subscription = harness.engine.subscribe(move |event| {
        if let TimelineEvent::MergedItems { killed, .. } = event {
            sink.lock().expect("observer lock poisoned").push(killed.len());
        }
    });

    let mut oracle = TripOracle::new(seed);
    harness.feed(oracle.travel(4.0, 90.0, 120.0))?;
    harness.feed(oracle.dwell(60.0))?;
    harness.feed(oracle.travel(4.0, 90.0, 120.0))?;
    harness.engine.flush();

    let timeline = harness.timeline();
    expect(
        timeline.len() == 1,
        format!("expected one surviving path, found {}", timeline.len()),
    )?;
    expect(timeline[0].is_path(), "survivor should be a path")?;
    let counts = killed_counts.lock().expect("observer lock poisoned");
    expect(
        counts.iter().any(|&n| n == 2),
        format!("expected a single three-way merge event, saw kills of {:?}", *counts),
    )
}

/// TLP-005: two keeper visits separated by a 13 h outage. The gap item is
/// itself a keeper and must survive processing with its neighbours.
fn data_gap_preserved(harness: &mut Harness, seed: u64) -> Result<(), String> {
    let mut oracle = TripOracle::new(seed);
    harness.feed(oracle.dwell(600.0))?;
    oracle.outage(13.0 * 3_600.0);
    harness.feed(oracle.dwell(600.0))?;
    harness.engine.flush();

    let timeline = harness.timeline();
    expect(
        timeline.len() == 3,
        format!("expected visit-gap-visit, found {} items", timeline.len()),
    )?;
    let (first, gap, second) = (&timeline[0], &timeline[1], &timeline[2]);
    expect(first.is_visit() && second.is_visit(), "outer items should be visits")?;
    expect(gap.is_data_gap(), "middle item should be a data gap")?;
    expect(gap.is_worth_keeping(), "a 13 h gap is a keeper")?;
    expect(
        first.is_worth_keeping() && second.is_worth_keeping(),
        "both visits should remain keepers",
    )
}

/// TLP-006: safe-deleting a keeper visit flanked by same-type walks must
/// leave one path spanning the interval.
fn safe_delete_middle(harness: &mut Harness, seed: u64) -> Result<(), String> {
    let mut oracle = TripOracle::new(seed);
    harness.feed(oracle.travel(4.0, 90.0, 120.0))?;
    harness.feed(oracle.dwell(300.0))?;
    harness.feed(oracle.travel(4.0, 270.0, 120.0))?;
    harness.engine.flush();

    let before = harness.timeline();
    expect(
        before.len() == 3,
        format!("expected path-visit-path before deletion, found {}", before.len()),
    )?;
    let visit = before[1].clone();
    expect(visit.is_visit(), "middle item should be a visit")?;

    harness
        .engine
        .safe_delete(&visit)
        .map_err(|error| format!("safe delete refused: {error}"))?;
    harness.engine.flush();

    expect(visit.deleted(), "the visit should be tombstoned")?;
    let after = harness.timeline();
    expect(
        after.len() == 1,
        format!("expected one spanning path, found {}", after.len()),
    )?;
    expect(after[0].is_path(), "survivor should be a path")?;
    harness
        .engine
        .store()
        .verify_integrity()
        .map_err(|violation| format!("integrity violated: {violation}"))
}

/// TLP-007: a composite day. No scripted answer, but the timeline must
/// stay structurally sound: links chronological, no adjacent visits, every
/// listed item alive.
fn city_day(harness: &mut Harness, seed: u64) -> Result<(), String> {
    let mut oracle = TripOracle::new(seed);
    harness.feed(oracle.dwell(3_600.0))?;
    harness.feed(oracle.sleep(1_800.0))?;
    harness.feed(oracle.dwell(600.0))?;
    harness.feed(oracle.travel(4.5, 90.0, 900.0))?;
    harness.feed(oracle.dwell(1_800.0))?;
    harness.feed(oracle.travel(25.0, 180.0, 900.0))?;
    harness.feed(oracle.dwell(7_200.0))?;
    oracle.outage(1_200.0);
    harness.feed(oracle.dwell(600.0))?;
    harness.feed(oracle.travel(30.0, 270.0, 600.0))?;
    harness.feed(oracle.dwell(1_800.0))?;
    harness.engine.flush();

    let timeline = harness.timeline();
    debug!(items = timeline.len(), "city day timeline settled");
    expect(
        timeline.len() >= 6,
        format!("a full day should leave several items, found {}", timeline.len()),
    )?;

    for item in &timeline {
        expect(!item.deleted(), "listed items must be alive")?;
    }
    for pair in timeline.windows(2) {
        expect(
            !(pair[0].is_visit() && pair[1].is_visit()),
            "adjacent visits should have merged or been bridged",
        )?;
        let (end, start) = (pair[0].end_date(), pair[1].start_date());
        if let (Some(end), Some(start)) = (end, start) {
            expect(
                start >= end,
                format!("links must stay chronological ({start} < {end})"),
            )?;
        }
    }
    harness
        .engine
        .store()
        .verify_integrity()
        .map_err(|violation| format!("integrity violated: {violation}"))
}
