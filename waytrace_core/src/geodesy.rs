//! Geo primitives: weighted centroids on the unit sphere, great-circle
//! radius statistics and bearing-spread measures over polylines.
//!
//! Coordinates follow the `geo` crate convention: `Point::new(lon, lat)`.

use geo::{HaversineBearing, HaversineDistance, Point};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::settings::{VISIT_RADIUS_MAX, VISIT_RADIUS_MIN};

/// Great-circle distance between two points, in metres.
pub fn distance_between(a: Point<f64>, b: Point<f64>) -> f64 {
    a.haversine_distance(&b)
}

/// Initial great-circle bearing from `a` to `b`, in degrees from north.
pub fn bearing_between(a: Point<f64>, b: Point<f64>) -> f64 {
    a.haversine_bearing(b)
}

/// Distance statistics of a point cloud about its centre.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Radius {
    /// Mean great-circle distance from the centre, in metres.
    pub mean: f64,
    /// Population standard deviation of those distances, in metres.
    pub sd: f64,
}

impl Radius {
    pub const ZERO: Radius = Radius { mean: 0.0, sd: 0.0 };

    /// `mean + n·SD`, the N-sigma radius.
    pub fn with_sd(&self, n: f64) -> f64 {
        self.mean + n * self.sd
    }

    /// N-sigma radius clamped into the Visit radius band, for containment
    /// tests.
    pub fn clamped(&self, n: f64) -> f64 {
        self.with_sd(n).clamp(VISIT_RADIUS_MIN, VISIT_RADIUS_MAX)
    }
}

/// Converts a surface coordinate to its 3-D unit vector.
fn unit_vector(point: Point<f64>) -> Vector3<f64> {
    let lat = point.y().to_radians();
    let lon = point.x().to_radians();
    Vector3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin())
}

/// Projects a 3-D direction back onto the surface.
fn surface_point(v: Vector3<f64>) -> Point<f64> {
    let lat = v.z.asin().to_degrees();
    let lon = v.y.atan2(v.x).to_degrees();
    Point::new(lon, lat)
}

/// Accuracy-weighted centroid of `(point, horizontal_accuracy)` pairs.
///
/// Each coordinate contributes its unit vector weighted by
/// `1 − hAcc / (worstHAcc + 1)`, so the least accurate fix still carries a
/// small positive weight. Returns `None` for an empty input.
pub fn weighted_centre(points: &[(Point<f64>, f64)]) -> Option<Point<f64>> {
    if points.is_empty() {
        return None;
    }

    let worst = points.iter().map(|(_, acc)| *acc).fold(0.0, f64::max);
    let mut sum = Vector3::zeros();
    for (point, accuracy) in points {
        let weight = 1.0 - accuracy / (worst + 1.0);
        sum += unit_vector(*point) * weight;
    }

    let norm = sum.norm();
    if norm <= f64::EPSILON {
        // Antipodal cancellation; fall back to the first coordinate.
        return Some(points[0].0);
    }
    Some(surface_point(sum / norm))
}

/// Unweighted centroid of a set of coordinates.
pub fn unweighted_centre(points: &[Point<f64>]) -> Option<Point<f64>> {
    if points.is_empty() {
        return None;
    }
    let mut sum = Vector3::zeros();
    for point in points {
        sum += unit_vector(*point);
    }
    let norm = sum.norm();
    if norm <= f64::EPSILON {
        return Some(points[0]);
    }
    Some(surface_point(sum / norm))
}

/// `(mean, SD)` of great-circle distances from `centre` over `points`.
///
/// The zero- and one-sample special cases (accuracy-seeded radii) are the
/// caller's concern; this is the plain n ≥ 1 statistic.
pub fn radius_about(centre: Point<f64>, points: &[Point<f64>]) -> Radius {
    if points.is_empty() {
        return Radius::ZERO;
    }

    let distances: Vec<f64> = points
        .iter()
        .map(|p| distance_between(centre, *p))
        .collect();
    let mean = distances.iter().sum::<f64>() / distances.len() as f64;
    let variance = distances
        .iter()
        .map(|d| (d - mean).powi(2))
        .sum::<f64>()
        / distances.len() as f64;

    Radius {
        mean,
        sd: variance.sqrt(),
    }
}

/// Spread of travel directions along a polyline, in `[0, 1]`.
///
/// Computes the circular variance `1 − |mean(e^{iθ})|` over consecutive-pair
/// bearings. Fewer than 4 bearings is too little signal and scores the
/// maximum 1.0.
pub fn course_variance(points: &[Point<f64>]) -> f64 {
    let bearings: Vec<f64> = points
        .windows(2)
        .filter(|w| w[0] != w[1])
        .map(|w| bearing_between(w[0], w[1]).to_radians())
        .collect();

    if bearings.len() < 4 {
        return 1.0;
    }

    let n = bearings.len() as f64;
    let cos_sum: f64 = bearings.iter().map(|b| b.cos()).sum();
    let sin_sum: f64 = bearings.iter().map(|b| b.sin()).sum();
    1.0 - (cos_sum / n).hypot(sin_sum / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unweighted_centre_midpoint() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(0.01, 0.0);
        let centre = unweighted_centre(&[a, b]).unwrap();
        assert_relative_eq!(centre.x(), 0.005, epsilon = 1e-9);
        assert_relative_eq!(centre.y(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_weighted_centre_favours_accurate_fix() {
        let accurate = (Point::new(0.0, 0.0), 5.0);
        let sloppy = (Point::new(0.01, 0.0), 100.0);
        let centre = weighted_centre(&[accurate, sloppy]).unwrap();
        // Should land much nearer the accurate fix than the midpoint.
        assert!(centre.x() < 0.002, "centre.x() = {}", centre.x());
    }

    #[test]
    fn test_weighted_centre_empty() {
        assert!(weighted_centre(&[]).is_none());
    }

    #[test]
    fn test_radius_about_single_point() {
        let centre = Point::new(0.0, 0.0);
        let radius = radius_about(centre, &[centre]);
        assert_relative_eq!(radius.mean, 0.0, epsilon = 1e-9);
        assert_relative_eq!(radius.sd, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_radius_about_ring() {
        // Four points ~111m from the centre (0.001 degrees of latitude).
        let centre = Point::new(0.0, 0.0);
        let points = [
            Point::new(0.0, 0.001),
            Point::new(0.0, -0.001),
            Point::new(0.001, 0.0),
            Point::new(-0.001, 0.0),
        ];
        let radius = radius_about(centre, &points);
        assert!(radius.mean > 100.0 && radius.mean < 120.0);
        assert!(radius.sd < 1.0);
    }

    #[test]
    fn test_radius_clamping() {
        let tight = Radius { mean: 2.0, sd: 0.5 };
        assert_relative_eq!(tight.clamped(2.0), VISIT_RADIUS_MIN);

        let sprawling = Radius {
            mean: 400.0,
            sd: 50.0,
        };
        assert_relative_eq!(sprawling.clamped(3.0), VISIT_RADIUS_MAX);

        let mid = Radius {
            mean: 40.0,
            sd: 10.0,
        };
        assert_relative_eq!(mid.clamped(2.0), 60.0);
    }

    #[test]
    fn test_course_variance_straight_line() {
        let points: Vec<Point<f64>> =
            (0..8).map(|i| Point::new(0.001 * i as f64, 0.0)).collect();
        let variance = course_variance(&points);
        assert!(variance < 0.01, "variance = {}", variance);
    }

    #[test]
    fn test_course_variance_scattered() {
        // Out-and-back legs in opposing directions cancel the mean vector.
        let points = [
            Point::new(0.0, 0.0),
            Point::new(0.001, 0.0),
            Point::new(0.0, 0.0),
            Point::new(0.001, 0.0),
            Point::new(0.0, 0.0),
        ];
        let variance = course_variance(&points);
        assert!(variance > 0.9, "variance = {}", variance);
    }

    #[test]
    fn test_course_variance_too_few_bearings() {
        let points = [
            Point::new(0.0, 0.0),
            Point::new(0.001, 0.0),
            Point::new(0.002, 0.0),
        ];
        assert_relative_eq!(course_variance(&points), 1.0);
    }

    #[test]
    fn test_distance_symmetry() {
        let a = Point::new(151.2093, -33.8688);
        let b = Point::new(151.22, -33.87);
        assert_relative_eq!(
            distance_between(a, b),
            distance_between(b, a),
            epsilon = 1e-9
        );
    }
}
