//! Navigation geometry on the WGS84 sphere approximation
//!
//! Pure functions used to annotate peers with distance and bearing, plus a
//! small edge-triggered detector for arriving at a destination.

use crate::core::{Coordinate, EARTH_RADIUS_M};

/// Great-circle distance between two coordinates (m)
pub fn haversine_distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial bearing from `from` towards `to`, in degrees within [0, 360)
pub fn initial_bearing(from: &Coordinate, to: &Coordinate) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let dlng = (to.lng - from.lng).to_radians();

    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
    normalize_degrees(y.atan2(x).to_degrees())
}

/// Wrap any angle into [0, 360)
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can return 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Signed shortest rotation from `from` to `to`, in (-180, 180]
pub fn shortest_arc(from: f64, to: f64) -> f64 {
    let diff = (to - from).rem_euclid(360.0);
    if diff > 180.0 {
        diff - 360.0
    } else {
        diff
    }
}

/// Emitted when the tracked position first enters the destination radius
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalEvent {
    pub destination: Coordinate,
    pub distance_m: f64,
    pub timestamp_ms: u64,
}

/// Edge-triggered arrival detection against a fixed destination
///
/// Fires once on entering the radius; leaving the radius re-arms it.
#[derive(Debug, Clone)]
pub struct ArrivalDetector {
    destination: Coordinate,
    radius_m: f64,
    inside: bool,
}

impl ArrivalDetector {
    pub fn new(destination: Coordinate, radius_m: f64) -> Self {
        Self {
            destination,
            radius_m: radius_m.max(0.0),
            inside: false,
        }
    }

    pub fn destination(&self) -> Coordinate {
        self.destination
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    pub fn has_arrived(&self) -> bool {
        self.inside
    }

    pub fn distance_from(&self, position: &Coordinate) -> f64 {
        haversine_distance(position, &self.destination)
    }

    /// Feed a new position; returns an event only on the outside → inside edge
    pub fn update(&mut self, position: &Coordinate, timestamp_ms: u64) -> Option<ArrivalEvent> {
        let distance_m = self.distance_from(position);
        let now_inside = distance_m <= self.radius_m;
        let fired = now_inside && !self.inside;
        self.inside = now_inside;

        if fired {
            Some(ArrivalEvent {
                destination: self.destination,
                distance_m,
                timestamp_ms,
            })
        } else {
            None
        }
    }
}
