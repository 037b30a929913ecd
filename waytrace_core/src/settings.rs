//! Engine configuration and tuning constants.

use serde::{Deserialize, Serialize};

/// Smallest radius a Visit is ever treated as occupying, in metres.
pub const VISIT_RADIUS_MIN: f64 = 10.0;

/// Largest radius a Visit is ever treated as occupying, in metres.
pub const VISIT_RADIUS_MAX: f64 = 150.0;

/// Speed boundary between foot-pace and vehicular movement (8 km/h), in m/s.
pub const MODE_SHIFT_SPEED: f64 = 8.0 / 3.6;

/// Minimum duration for any item to count as valid, in seconds.
pub const MIN_ITEM_DURATION: f64 = 10.0;

/// Minimum travel distance for a Path to count as valid, in metres.
pub const MIN_PATH_DISTANCE: f64 = 10.0;

/// Minimum Visit duration to be worth keeping, in seconds.
pub const MIN_VISIT_KEEPER_DURATION: f64 = 120.0;

/// Minimum Path duration to be worth keeping, in seconds.
pub const MIN_PATH_KEEPER_DURATION: f64 = 60.0;

/// Minimum Path travel distance to be worth keeping, in metres.
pub const MIN_PATH_KEEPER_DISTANCE: f64 = 20.0;

/// Minimum duration for a data gap to count as valid, in seconds.
pub const MIN_DATA_GAP_DURATION: f64 = 30.0;

/// Minimum duration for a data gap to be worth keeping (12 h), in seconds.
pub const MIN_DATA_GAP_KEEPER_DURATION: f64 = 12.0 * 60.0 * 60.0;

/// Gap between adjacent items above which a data-gap Path is synthesised
/// between them (5 min), in seconds.
pub const DATA_GAP_INSERTION_THRESHOLD: f64 = 300.0;

/// Floor for a Visit↔Path mergeable distance, in metres.
pub const MIN_VISIT_PATH_MERGEABLE_DISTANCE: f64 = 150.0;

/// Runtime configuration for a [`TimelineEngine`](crate::TimelineEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Recorder rate limit: at most this many samples accepted per minute.
    pub samples_per_minute: f64,

    /// If false, the classifier is never consulted and item-level
    /// classification aggregates are empty.
    pub activity_type_classify_samples: bool,

    /// Minimum age in seconds before a `deleted` item may be hard-purged.
    pub keep_deleted_items_for: f64,

    /// Number of dirty objects that triggers a non-immediate save.
    pub save_batch_size: usize,

    /// Age in seconds past which a non-current item is announced as
    /// finalised and will no longer be mutated.
    pub finalise_after: f64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            samples_per_minute: 10.0,
            activity_type_classify_samples: true,
            keep_deleted_items_for: 60.0 * 60.0,
            save_batch_size: 100,
            finalise_after: 30.0 * 60.0,
        }
    }
}

impl TimelineConfig {
    /// Minimum seconds between accepted samples, derived from
    /// `samples_per_minute`.
    pub fn sample_interval(&self) -> f64 {
        60.0 / self.samples_per_minute.max(f64::MIN_POSITIVE)
    }
}
