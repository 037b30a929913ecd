//! Property tests: random days of legs through a real engine, checked
//! against the timeline's structural guarantees.

use std::sync::Arc;

use proptest::prelude::*;
use uuid::Uuid;

use waytrace_core::{ActivityType, ItemRecord, SampleRecord, TimelineItem};
use waytrace_sim::{Harness, TripOracle};

#[derive(Debug, Clone)]
enum Leg {
    Dwell(f64),
    Sleep(f64),
    Travel {
        speed_kmh: f64,
        bearing: f64,
        duration: f64,
    },
    Outage(f64),
}

fn leg_strategy() -> impl Strategy<Value = Leg> {
    prop_oneof![
        (60.0..900.0f64).prop_map(Leg::Dwell),
        (120.0..900.0f64).prop_map(Leg::Sleep),
        ((2.0..40.0f64), (0.0..360.0f64), (60.0..600.0f64)).prop_map(
            |(speed_kmh, bearing, duration)| Leg::Travel {
                speed_kmh,
                bearing,
                duration,
            }
        ),
        (400.0..7_200.0f64).prop_map(Leg::Outage),
    ]
}

/// Legs without sleep, for the sample-conservation property (sleep
/// thinning deliberately discards samples).
fn lossless_leg_strategy() -> impl Strategy<Value = Leg> {
    prop_oneof![
        (60.0..900.0f64).prop_map(Leg::Dwell),
        ((2.0..40.0f64), (0.0..360.0f64), (60.0..600.0f64)).prop_map(
            |(speed_kmh, bearing, duration)| Leg::Travel {
                speed_kmh,
                bearing,
                duration,
            }
        ),
        (400.0..7_200.0f64).prop_map(Leg::Outage),
    ]
}

fn run_legs(seed: u64, legs: &[Leg]) -> Result<Harness, TestCaseError> {
    let mut harness = Harness::new();
    let mut oracle = TripOracle::new(seed);
    for leg in legs {
        let observations = match leg {
            Leg::Dwell(duration) => oracle.dwell(*duration),
            Leg::Sleep(duration) => oracle.sleep(*duration),
            Leg::Travel {
                speed_kmh,
                bearing,
                duration,
            } => oracle.travel(*speed_kmh, *bearing, *duration),
            Leg::Outage(duration) => {
                oracle.outage(*duration);
                continue;
            }
        };
        harness
            .feed(observations)
            .map_err(|violation| TestCaseError::fail(violation))?;
    }
    harness.engine.flush();
    Ok(harness)
}

type LinkSnapshot = Vec<(Uuid, Option<Uuid>, Option<Uuid>)>;

fn link_snapshot(items: &[Arc<TimelineItem>]) -> LinkSnapshot {
    items
        .iter()
        .map(|item| (item.id, item.previous_id(), item.next_id()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        ..ProptestConfig::default()
    })]

    /// P1/P3/P4/P6: after any day, the graph verifies, samples are owned
    /// and ordered, sprawling items carry no stationary score, and
    /// distances are symmetric.
    #[test]
    fn prop_structural_invariants_hold(
        seed in any::<u64>(),
        legs in prop::collection::vec(leg_strategy(), 1..6),
    ) {
        let harness = run_legs(seed, &legs)?;
        harness
            .engine
            .store()
            .verify_integrity()
            .map_err(|violation| TestCaseError::fail(violation.to_string()))?;

        let timeline = harness.timeline();
        for item in &timeline {
            let samples = item.samples();
            prop_assert!(
                samples.windows(2).all(|w| w[0].date < w[1].date),
                "samples out of order in {}",
                item.id
            );
            for sample in &samples {
                prop_assert_eq!(sample.item_id(), Some(item.id));
            }

            if item.radius().with_sd(3.0) > 150.0 {
                let stationary = item
                    .classifier_results()
                    .score_for(ActivityType::Stationary)
                    .unwrap_or(0.0);
                prop_assert!(
                    stationary == 0.0,
                    "sprawling item {} kept stationary score {}",
                    item.id,
                    stationary
                );
            }
        }

        for a in &timeline {
            for b in &timeline {
                if a.id == b.id {
                    continue;
                }
                match (a.distance_from(b), b.distance_from(a)) {
                    (Some(ab), Some(ba)) => prop_assert!(
                        (ab - ba).abs() < 1e-6,
                        "distance asymmetry: {} vs {}",
                        ab,
                        ba
                    ),
                    (None, None) => {}
                    (ab, ba) => prop_assert!(
                        false,
                        "asymmetric distance availability: {:?} vs {:?}",
                        ab,
                        ba
                    ),
                }
            }
        }
    }

    /// P5: once the merge loop reaches a fixpoint, running it again
    /// produces no further merges: same live items, same links.
    #[test]
    fn prop_processing_is_idempotent(
        seed in any::<u64>(),
        legs in prop::collection::vec(leg_strategy(), 1..5),
    ) {
        let harness = run_legs(seed, &legs)?;
        let timeline = harness.timeline();
        let before = link_snapshot(&timeline);

        if let Some(current) = harness.engine.current_item() {
            let processor = harness.engine.processor().clone();
            harness
                .engine
                .store()
                .process_sync(move || processor.process_from(&current));
        }

        let after = link_snapshot(&harness.timeline());
        prop_assert_eq!(before, after);
        for item in &timeline {
            prop_assert!(!item.deleted(), "fixpoint reprocessing deleted {}", item.id);
        }
    }

    /// Without sleep thinning, every accepted observation survives
    /// somewhere in the timeline; data gaps add exactly two markers each.
    #[test]
    fn prop_samples_conserved(
        seed in any::<u64>(),
        legs in prop::collection::vec(lossless_leg_strategy(), 1..5),
    ) {
        let harness = run_legs(seed, &legs)?;
        let timeline = harness.timeline();
        let gap_items = timeline.iter().filter(|i| i.is_data_gap()).count();
        let held: usize = timeline.iter().map(|i| i.sample_count()).sum();
        prop_assert_eq!(held, harness.observations + 2 * gap_items);
    }

    /// P7: persistence codec round trip preserves items (links included)
    /// and samples exactly.
    #[test]
    fn prop_codec_round_trips(
        seed in any::<u64>(),
        legs in prop::collection::vec(leg_strategy(), 1..4),
    ) {
        let harness = run_legs(seed, &legs)?;
        for item in harness.timeline() {
            let record = ItemRecord::from_item(&item);
            let json = serde_json::to_vec(&record).unwrap();
            let decoded: ItemRecord = serde_json::from_slice(&json).unwrap();
            prop_assert_eq!(&decoded, &record);
            prop_assert_eq!(decoded.previous_id, item.previous_id());
            prop_assert_eq!(decoded.next_id, item.next_id());

            for sample in item.samples() {
                let record = SampleRecord::from_sample(&sample);
                let json = serde_json::to_string(&record).unwrap();
                let decoded: SampleRecord = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(&decoded, &record);
            }
        }
    }
}
