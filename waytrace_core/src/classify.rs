//! Activity classification: the seam to the external per-sample classifier
//! and the aggregation of its results up to item level.

use std::sync::Arc;

use crate::sample::{ActivityType, ClassifierResult, ClassifierResults, Sample};
use crate::settings::VISIT_RADIUS_MAX;

/// The external machine-learning classifier, treated as a pure function
/// from a sample to a probability distribution over activity types.
pub trait SampleClassifier: Send + Sync {
    /// Classifies one sample. `None` means the classifier cannot score this
    /// sample (e.g. no model coverage for the region).
    fn classify(&self, sample: &Sample) -> Option<ClassifierResults>;

    /// The activity types this classifier can distinguish.
    fn activity_types(&self) -> &'static [ActivityType] {
        ActivityType::all()
    }
}

/// Averages per-sample classifier scores into a single distribution.
///
/// For each recognised type the aggregate score is the arithmetic mean of
/// per-sample scores, an absent score contributing 0, and likewise for the
/// model-accuracy values. The `more_coming` flag propagates if any input
/// classification was marked incomplete.
pub fn aggregate(samples: &[Arc<Sample>], types: &[ActivityType]) -> ClassifierResults {
    if samples.is_empty() || !samples.iter().any(|s| s.classification().is_some()) {
        return ClassifierResults::default();
    }

    let n = samples.len() as f64;
    let mut more_coming = false;
    let mut results = Vec::with_capacity(types.len());

    for &activity_type in types {
        let mut score_sum = 0.0;
        let mut accuracy_sum = 0.0;
        for sample in samples {
            if let Some(classification) = sample.classification() {
                more_coming |= classification.more_coming;
                if let Some(result) = classification
                    .iter()
                    .find(|r| r.activity_type == activity_type)
                {
                    score_sum += result.score;
                    accuracy_sum += result.model_accuracy.unwrap_or(0.0);
                }
            }
        }
        results.push(ClassifierResult {
            activity_type,
            score: score_sum / n,
            model_accuracy: Some(accuracy_sum / n),
        });
    }

    ClassifierResults::new(results, more_coming)
}

/// Aggregates a sample set into an item-level result, enforcing the Visit
/// radius ceiling: an item sprawling past `VISIT_RADIUS_MAX` at 3 sigma
/// cannot be stationary, so that score is dropped to zero.
pub fn item_results(
    samples: &[Arc<Sample>],
    radius_3sd: f64,
    types: &[ActivityType],
) -> ClassifierResults {
    let mut results = aggregate(samples, types);
    if radius_3sd > VISIT_RADIUS_MAX {
        results.zero_out(ActivityType::Stationary);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Location, MotionFeatures, MovingState, RawObservation, RecordingState};
    use approx::assert_relative_eq;

    fn classified_sample(scores: &[(ActivityType, f64)], more_coming: bool) -> Arc<Sample> {
        let raw = RawObservation {
            date: 1_700_000_000.0,
            location: Some(Location {
                horizontal_accuracy: 10.0,
                ..Location::new(-33.8688, 151.2093)
            }),
            moving_state: MovingState::Moving,
            recording_state: RecordingState::Recording,
            motion: MotionFeatures::default(),
        };
        let sample = Arc::new(Sample::from_observation(&raw));
        sample.set_classification(ClassifierResults::new(
            scores
                .iter()
                .map(|(activity_type, score)| ClassifierResult {
                    activity_type: *activity_type,
                    score: *score,
                    model_accuracy: Some(0.8),
                })
                .collect(),
            more_coming,
        ));
        sample
    }

    #[test]
    fn test_aggregate_means_scores() {
        let samples = vec![
            classified_sample(&[(ActivityType::Walking, 0.9)], false),
            classified_sample(&[(ActivityType::Walking, 0.5)], false),
            // Unscored for walking, contributes 0.
            classified_sample(&[(ActivityType::Cycling, 1.0)], false),
        ];
        let results = aggregate(&samples, ActivityType::all());
        assert_relative_eq!(
            results.score_for(ActivityType::Walking).unwrap(),
            (0.9 + 0.5) / 3.0,
            epsilon = 1e-9
        );
        assert_eq!(
            results.best_match().map(|r| r.activity_type),
            Some(ActivityType::Walking)
        );
        assert!(!results.more_coming);
    }

    #[test]
    fn test_aggregate_propagates_more_coming() {
        let samples = vec![
            classified_sample(&[(ActivityType::Car, 0.9)], false),
            classified_sample(&[(ActivityType::Car, 0.9)], true),
        ];
        assert!(aggregate(&samples, ActivityType::all()).more_coming);
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(aggregate(&[], ActivityType::all()).is_empty());
    }

    #[test]
    fn test_radius_ceiling_zeroes_stationary() {
        let samples = vec![classified_sample(
            &[(ActivityType::Stationary, 0.9), (ActivityType::Walking, 0.1)],
            false,
        )];

        let contained = item_results(&samples, 80.0, ActivityType::all());
        assert!(contained.score_for(ActivityType::Stationary).unwrap() > 0.0);

        let sprawling = item_results(&samples, VISIT_RADIUS_MAX + 1.0, ActivityType::all());
        assert_relative_eq!(
            sprawling
                .score_for(ActivityType::Stationary)
                .unwrap_or(0.0),
            0.0
        );
        assert_eq!(
            sprawling.best_match().map(|r| r.activity_type),
            Some(ActivityType::Walking)
        );
    }
}
