//! Ground-truth trip oracle for simulation.
//!
//! Generates deterministic synthetic observation streams (dwells, travel
//! legs, sleep stretches, recording outages) with seeded GPS noise, plus a
//! speed-based stand-in for the external activity classifier.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use waytrace_core::{
    ActivityType, ClassifierResult, ClassifierResults, Location, MotionFeatures, MovingState,
    RawObservation, RecordingState, Sample, SampleClassifier, Timestamp,
};

/// Metres per degree of latitude.
const METRES_PER_DEGREE: f64 = 111_320.0;

/// The oracle - holds true position and time, and renders noisy
/// observations from scripted legs.
pub struct TripOracle {
    rng: ChaCha8Rng,
    clock: Timestamp,
    latitude: f64,
    longitude: f64,
    /// Seconds between emitted observations.
    cadence: f64,
    /// GPS noise standard deviation in metres.
    gps_noise_std: f64,
}

impl TripOracle {
    /// Creates an oracle parked in central Sydney.
    pub fn new(seed: u64) -> Self {
        Self::at(seed, -33.8688, 151.2093)
    }

    pub fn at(seed: u64, latitude: f64, longitude: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            clock: 1_700_000_000.0,
            latitude,
            longitude,
            cadence: 6.0,
            gps_noise_std: 4.0,
        }
    }

    pub fn with_cadence(mut self, cadence: f64) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn time(&self) -> Timestamp {
        self.clock
    }

    pub fn position(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }

    fn noisy_location(&mut self, speed: f64) -> Location {
        let noise = Normal::new(0.0, self.gps_noise_std).expect("valid noise distribution");
        let north_error = noise.sample(&mut self.rng) / METRES_PER_DEGREE;
        let east_error = noise.sample(&mut self.rng)
            / (METRES_PER_DEGREE * self.latitude.to_radians().cos());
        Location {
            latitude: self.latitude + north_error,
            longitude: self.longitude + east_error,
            altitude: Some(20.0),
            horizontal_accuracy: self.gps_noise_std * 2.0,
            vertical_accuracy: 10.0,
            course: None,
            speed: Some(speed),
        }
    }

    /// Stationary samples at the current position.
    pub fn dwell(&mut self, duration: f64) -> Vec<RawObservation> {
        self.stationary_leg(duration, RecordingState::Recording)
    }

    /// Stationary sleep-state samples, as the recorder emits overnight.
    pub fn sleep(&mut self, duration: f64) -> Vec<RawObservation> {
        self.stationary_leg(duration, RecordingState::Sleeping)
    }

    fn stationary_leg(
        &mut self,
        duration: f64,
        recording_state: RecordingState,
    ) -> Vec<RawObservation> {
        let mut observations = Vec::new();
        let steps = (duration / self.cadence).floor() as usize;
        for _ in 0..steps {
            self.clock += self.cadence;
            observations.push(RawObservation {
                date: self.clock,
                location: Some(self.noisy_location(0.0)),
                moving_state: MovingState::Stationary,
                recording_state,
                motion: MotionFeatures::default(),
            });
        }
        observations
    }

    /// Moves along `bearing_deg` at `speed_kmh`, emitting moving samples.
    pub fn travel(
        &mut self,
        speed_kmh: f64,
        bearing_deg: f64,
        duration: f64,
    ) -> Vec<RawObservation> {
        let speed = speed_kmh / 3.6;
        let bearing = bearing_deg.to_radians();
        let mut observations = Vec::new();
        let steps = (duration / self.cadence).floor() as usize;
        for _ in 0..steps {
            let distance = speed * self.cadence;
            self.latitude += bearing.cos() * distance / METRES_PER_DEGREE;
            self.longitude += bearing.sin() * distance
                / (METRES_PER_DEGREE * self.latitude.to_radians().cos());
            self.clock += self.cadence;
            observations.push(RawObservation {
                date: self.clock,
                location: Some(self.noisy_location(speed)),
                moving_state: MovingState::Moving,
                recording_state: RecordingState::Recording,
                motion: MotionFeatures::default(),
            });
        }
        observations
    }

    /// A recording outage: time passes, nothing is emitted.
    pub fn outage(&mut self, duration: f64) {
        self.clock += duration;
    }
}

// ============================================================================
// SPEED CLASSIFIER
// ============================================================================

/// Deterministic stand-in for the ML activity classifier: scores by ground
/// speed alone, with the remainder spread over the runner-up.
pub struct SpeedClassifier;

impl SampleClassifier for SpeedClassifier {
    fn classify(&self, sample: &Sample) -> Option<ClassifierResults> {
        let speed = sample.speed()?;
        let best = if sample.moving_state == MovingState::Stationary || speed < 0.4 {
            ActivityType::Stationary
        } else if speed < 2.0 {
            ActivityType::Walking
        } else if speed < 3.5 {
            ActivityType::Running
        } else if speed < 6.0 {
            ActivityType::Cycling
        } else {
            ActivityType::Car
        };
        let runner_up = match best {
            ActivityType::Stationary => ActivityType::Walking,
            ActivityType::Walking => ActivityType::Stationary,
            ActivityType::Running => ActivityType::Walking,
            ActivityType::Cycling => ActivityType::Running,
            _ => ActivityType::Bus,
        };
        Some(ClassifierResults::new(
            vec![
                ClassifierResult {
                    activity_type: best,
                    score: 0.8,
                    model_accuracy: Some(0.9),
                },
                ClassifierResult {
                    activity_type: runner_up,
                    score: 0.2,
                    model_accuracy: Some(0.9),
                },
            ],
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_is_deterministic() {
        let mut a = TripOracle::new(42);
        let mut b = TripOracle::new(42);
        assert_eq!(a.dwell(120.0), b.dwell(120.0));
        assert_eq!(a.travel(4.0, 90.0, 60.0), b.travel(4.0, 90.0, 60.0));
    }

    #[test]
    fn test_different_seeds_differ() {
        let mut a = TripOracle::new(1);
        let mut b = TripOracle::new(2);
        assert_ne!(a.dwell(60.0), b.dwell(60.0));
    }

    #[test]
    fn test_travel_moves_position() {
        let mut oracle = TripOracle::new(7);
        let start = oracle.position();
        // 4 km/h north for 10 minutes is roughly 667 m.
        let observations = oracle.travel(4.0, 0.0, 600.0);
        assert_eq!(observations.len(), 100);
        let end = oracle.position();
        let moved_metres = (end.0 - start.0) * METRES_PER_DEGREE;
        assert!((moved_metres - 666.0).abs() < 10.0, "moved {}", moved_metres);
    }

    #[test]
    fn test_outage_advances_clock_silently() {
        let mut oracle = TripOracle::new(7);
        let before = oracle.time();
        oracle.outage(3_600.0);
        assert_eq!(oracle.time(), before + 3_600.0);
    }

    #[test]
    fn test_dates_strictly_increase() {
        let mut oracle = TripOracle::new(11);
        let mut all = oracle.dwell(300.0);
        all.extend(oracle.travel(4.0, 45.0, 300.0));
        all.extend(oracle.sleep(300.0));
        assert!(all.windows(2).all(|w| w[0].date < w[1].date));
    }
}
