//! End-to-end scenario acceptance tests.

use waytrace_sim::{ScenarioId, ScenarioRunner};

#[test]
fn test_all_scenarios_pass_with_default_seed() {
    let runner = ScenarioRunner::new(42);
    for scenario in ScenarioId::all() {
        let result = runner.run(scenario);
        assert!(
            result.passed,
            "{} failed: {}",
            scenario.name(),
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

#[test]
fn test_core_scenarios_stable_across_seeds() {
    for seed in [7_u64, 1_234, 987_654_321] {
        let runner = ScenarioRunner::new(seed);
        for scenario in [
            ScenarioId::VisitThenWalk,
            ScenarioId::DataGapPreserved,
            ScenarioId::SafeDeleteMiddle,
        ] {
            let result = runner.run(scenario);
            assert!(
                result.passed,
                "{} with seed {} failed: {}",
                scenario.name(),
                seed,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }
}

#[test]
fn test_scenario_names_round_trip() {
    for scenario in ScenarioId::all() {
        let parsed: ScenarioId = scenario.name().parse().unwrap();
        assert_eq!(parsed, scenario);
    }
}
