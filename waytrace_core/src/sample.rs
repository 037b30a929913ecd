//! Sample: a timestamped composite observation over a brief recording
//! window, the atomic unit the timeline is built from.

use geo::Point;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geodesy;

/// Seconds since the Unix epoch.
pub type Timestamp = f64;

/// Wall-clock time as a [`Timestamp`]. Bookkeeping only, never routing.
pub(crate) fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A closed time interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl DateRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, date: Timestamp) -> bool {
        date >= self.start && date <= self.end
    }
}

// ============================================================================
// STATES
// ============================================================================

/// The raw-signal layer's verdict on whether the device was moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovingState {
    Stationary,
    Moving,
    Uncertain,
}

impl MovingState {
    pub fn name(&self) -> &'static str {
        match self {
            MovingState::Stationary => "stationary",
            MovingState::Moving => "moving",
            MovingState::Uncertain => "uncertain",
        }
    }
}

/// What the recording pipeline was doing when the sample was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Recording,
    Sleeping,
    Wakeup,
    Off,
}

impl RecordingState {
    /// Sleeping and wakeup samples are subject to tail thinning.
    pub fn is_sleep_state(&self) -> bool {
        matches!(self, RecordingState::Sleeping | RecordingState::Wakeup)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecordingState::Recording => "recording",
            RecordingState::Sleeping => "sleeping",
            RecordingState::Wakeup => "wakeup",
            RecordingState::Off => "off",
        }
    }
}

/// The recognised activity types a classifier may assign to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Stationary,
    Walking,
    Running,
    Cycling,
    Car,
    Motorcycle,
    Bus,
    Train,
    Boat,
    Airplane,
}

impl ActivityType {
    /// All recognised types, stationary first.
    pub fn all() -> &'static [ActivityType] {
        &[
            ActivityType::Stationary,
            ActivityType::Walking,
            ActivityType::Running,
            ActivityType::Cycling,
            ActivityType::Car,
            ActivityType::Motorcycle,
            ActivityType::Bus,
            ActivityType::Train,
            ActivityType::Boat,
            ActivityType::Airplane,
        ]
    }

    pub fn is_moving_type(&self) -> bool {
        !matches!(self, ActivityType::Stationary)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActivityType::Stationary => "stationary",
            ActivityType::Walking => "walking",
            ActivityType::Running => "running",
            ActivityType::Cycling => "cycling",
            ActivityType::Car => "car",
            ActivityType::Motorcycle => "motorcycle",
            ActivityType::Bus => "bus",
            ActivityType::Train => "train",
            ActivityType::Boat => "boat",
            ActivityType::Airplane => "airplane",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ActivityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityType::all()
            .iter()
            .find(|t| t.name() == s.to_lowercase())
            .copied()
            .ok_or_else(|| format!("Unknown activity type: {}", s))
    }
}

// ============================================================================
// LOCATION & MOTION FEATURES
// ============================================================================

/// A smoothed location fix. Accuracies below zero mean "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    /// Horizontal accuracy in metres; negative = invalid fix.
    pub horizontal_accuracy: f64,
    /// Vertical accuracy in metres; negative = invalid fix.
    pub vertical_accuracy: f64,
    /// Course over ground in degrees from north.
    pub course: Option<f64>,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            horizontal_accuracy: -1.0,
            vertical_accuracy: -1.0,
            course: None,
            speed: None,
        }
    }

    /// A coordinate is usable when the fix is valid, in range and not the
    /// null island artefact at (0, 0).
    pub fn has_usable_coordinate(&self) -> bool {
        self.horizontal_accuracy >= 0.0
            && self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }

    pub fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Great-circle distance to another location, in metres.
    pub fn distance_from(&self, other: &Location) -> f64 {
        geodesy::distance_between(self.point(), other.point())
    }
}

/// Device-motion features captured alongside the location fix.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionFeatures {
    /// Pedometer cadence in Hz.
    pub step_hz: Option<f64>,
    /// Circular variance of recent courses, in `[0, 1]`.
    pub course_variance: Option<f64>,
    /// Mean horizontal-plane accelerometer magnitude.
    pub xy_acceleration: Option<f64>,
    /// Mean vertical accelerometer magnitude.
    pub z_acceleration: Option<f64>,
    /// The device motion API's own coarse activity guess.
    pub core_motion_type: Option<ActivityType>,
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// One activity type's score within a classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierResult {
    pub activity_type: ActivityType,
    pub score: f64,
    pub model_accuracy: Option<f64>,
}

/// A probability distribution over activity types, best match first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassifierResults {
    results: Vec<ClassifierResult>,
    /// True when the classifier expects to refine this result later.
    pub more_coming: bool,
}

impl ClassifierResults {
    pub fn new(mut results: Vec<ClassifierResult>, more_coming: bool) -> Self {
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self {
            results,
            more_coming,
        }
    }

    pub fn best_match(&self) -> Option<&ClassifierResult> {
        self.results.first()
    }

    pub fn score_for(&self, activity_type: ActivityType) -> Option<f64> {
        self.results
            .iter()
            .find(|r| r.activity_type == activity_type)
            .map(|r| r.score)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassifierResult> {
        self.results.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Removes an activity type's entry, re-ranking the rest.
    pub(crate) fn zero_out(&mut self, activity_type: ActivityType) {
        self.results.retain(|r| r.activity_type != activity_type);
    }
}

// ============================================================================
// RAW OBSERVATION (Recorder input)
// ============================================================================

/// The wire format delivered by the raw-signal layer: one observation,
/// not yet owned by any timeline item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub date: Timestamp,
    pub location: Option<Location>,
    pub moving_state: MovingState,
    pub recording_state: RecordingState,
    #[serde(default)]
    pub motion: MotionFeatures,
}

// ============================================================================
// SAMPLE
// ============================================================================

/// An immutable observation with identity. Only the owning-item pointer,
/// the classification and the user's confirmed type ever change after
/// creation.
#[derive(Debug)]
pub struct Sample {
    pub id: Uuid,
    pub date: Timestamp,
    pub location: Option<Location>,
    pub moving_state: MovingState,
    pub recording_state: RecordingState,
    pub motion: MotionFeatures,
    inner: Mutex<SampleInner>,
}

#[derive(Debug, Default)]
struct SampleInner {
    item_id: Option<Uuid>,
    confirmed_type: Option<ActivityType>,
    classification: Option<ClassifierResults>,
    last_saved: Option<Timestamp>,
}

impl Sample {
    pub(crate) fn from_observation(raw: &RawObservation) -> Self {
        Self {
            id: Uuid::new_v4(),
            date: raw.date,
            location: raw.location,
            moving_state: raw.moving_state,
            recording_state: raw.recording_state,
            motion: raw.motion,
            inner: Mutex::new(SampleInner::default()),
        }
    }

    /// A synthetic endpoint for a data-gap Path: no location, recording off.
    pub(crate) fn data_gap_marker(date: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            date,
            location: None,
            moving_state: MovingState::Uncertain,
            recording_state: RecordingState::Off,
            motion: MotionFeatures::default(),
            inner: Mutex::new(SampleInner::default()),
        }
    }

    /// Rebuilds a sample from persisted parts, keeping its identity.
    pub(crate) fn from_parts(
        id: Uuid,
        date: Timestamp,
        location: Option<Location>,
        moving_state: MovingState,
        recording_state: RecordingState,
        motion: MotionFeatures,
        item_id: Option<Uuid>,
        confirmed_type: Option<ActivityType>,
        last_saved: Option<Timestamp>,
    ) -> Self {
        Self {
            id,
            date,
            location,
            moving_state,
            recording_state,
            motion,
            inner: Mutex::new(SampleInner {
                item_id,
                confirmed_type,
                classification: None,
                last_saved,
            }),
        }
    }

    // ========================================================================
    // MUTABLE STATE
    // ========================================================================

    pub fn item_id(&self) -> Option<Uuid> {
        self.inner.lock().item_id
    }

    pub(crate) fn set_item_id(&self, item_id: Option<Uuid>) {
        self.inner.lock().item_id = item_id;
    }

    pub fn classification(&self) -> Option<ClassifierResults> {
        self.inner.lock().classification.clone()
    }

    pub(crate) fn set_classification(&self, results: ClassifierResults) {
        self.inner.lock().classification = Some(results);
    }

    pub fn confirmed_activity_type(&self) -> Option<ActivityType> {
        self.inner.lock().confirmed_type
    }

    /// Applies a user correction, overriding the classifier.
    pub fn confirm_activity_type(&self, activity_type: ActivityType) {
        self.inner.lock().confirmed_type = Some(activity_type);
    }

    pub fn last_saved(&self) -> Option<Timestamp> {
        self.inner.lock().last_saved
    }

    pub(crate) fn set_last_saved(&self, date: Timestamp) {
        self.inner.lock().last_saved = Some(date);
    }

    // ========================================================================
    // DERIVED
    // ========================================================================

    /// Effective activity type: the user's confirmed type wins, else the
    /// classifier's best match.
    pub fn activity_type(&self) -> Option<ActivityType> {
        let inner = self.inner.lock();
        if let Some(confirmed) = inner.confirmed_type {
            return Some(confirmed);
        }
        inner
            .classification
            .as_ref()
            .and_then(|c| c.best_match())
            .map(|r| r.activity_type)
    }

    pub fn has_usable_coordinate(&self) -> bool {
        self.location
            .map(|l| l.has_usable_coordinate())
            .unwrap_or(false)
    }

    /// The coordinate as a `geo` point, when usable.
    pub fn point(&self) -> Option<Point<f64>> {
        self.location
            .filter(|l| l.has_usable_coordinate())
            .map(|l| l.point())
    }

    pub fn speed(&self) -> Option<f64> {
        self.location.and_then(|l| l.speed)
    }

    /// Seconds since UTC midnight.
    pub fn time_of_day(&self) -> f64 {
        self.date.rem_euclid(86_400.0)
    }
}

impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Sample {}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn observation_at(lat: f64, lon: f64) -> RawObservation {
        RawObservation {
            date: 1_700_000_000.0,
            location: Some(Location {
                latitude: lat,
                longitude: lon,
                altitude: Some(20.0),
                horizontal_accuracy: 10.0,
                vertical_accuracy: 12.0,
                course: Some(90.0),
                speed: Some(1.2),
            }),
            moving_state: MovingState::Moving,
            recording_state: RecordingState::Recording,
            motion: MotionFeatures::default(),
        }
    }

    #[test]
    fn test_usable_coordinate_rules() {
        let mut location = Location::new(-33.8688, 151.2093);
        assert!(!location.has_usable_coordinate(), "invalid accuracy");

        location.horizontal_accuracy = 15.0;
        assert!(location.has_usable_coordinate());

        let null_island = Location {
            horizontal_accuracy: 5.0,
            ..Location::new(0.0, 0.0)
        };
        assert!(!null_island.has_usable_coordinate());
    }

    #[test]
    fn test_confirmed_type_overrides_classifier() {
        let sample = Sample::from_observation(&observation_at(-33.8688, 151.2093));
        sample.set_classification(ClassifierResults::new(
            vec![
                ClassifierResult {
                    activity_type: ActivityType::Walking,
                    score: 0.7,
                    model_accuracy: Some(0.9),
                },
                ClassifierResult {
                    activity_type: ActivityType::Cycling,
                    score: 0.2,
                    model_accuracy: Some(0.9),
                },
            ],
            false,
        ));
        assert_eq!(sample.activity_type(), Some(ActivityType::Walking));

        sample.confirm_activity_type(ActivityType::Cycling);
        assert_eq!(sample.activity_type(), Some(ActivityType::Cycling));
    }

    #[test]
    fn test_classifier_results_ranked() {
        let results = ClassifierResults::new(
            vec![
                ClassifierResult {
                    activity_type: ActivityType::Car,
                    score: 0.1,
                    model_accuracy: None,
                },
                ClassifierResult {
                    activity_type: ActivityType::Train,
                    score: 0.8,
                    model_accuracy: None,
                },
            ],
            false,
        );
        assert_eq!(
            results.best_match().map(|r| r.activity_type),
            Some(ActivityType::Train)
        );
        assert_relative_eq!(results.score_for(ActivityType::Car).unwrap(), 0.1);
    }

    #[test]
    fn test_data_gap_marker() {
        let marker = Sample::data_gap_marker(1_700_000_000.0);
        assert_eq!(marker.recording_state, RecordingState::Off);
        assert!(marker.location.is_none());
        assert!(!marker.has_usable_coordinate());
    }

    #[test]
    fn test_time_of_day() {
        let mut raw = observation_at(-33.8688, 151.2093);
        raw.date = 86_400.0 * 3.0 + 3_600.0 * 7.5;
        let sample = Sample::from_observation(&raw);
        assert_relative_eq!(sample.time_of_day(), 27_000.0);
    }

    #[test]
    fn test_activity_type_round_trip_names() {
        for activity_type in ActivityType::all() {
            let parsed: ActivityType = activity_type.name().parse().unwrap();
            assert_eq!(parsed, *activity_type);
        }
    }
}
