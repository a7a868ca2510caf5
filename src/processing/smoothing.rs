//! Exponential smoothing for coordinates and compass heading

use crate::algorithms::geometry::{normalize_degrees, shortest_arc};
use crate::core::Coordinate;
use nalgebra::Vector2;

/// Blend `new` into `previous`; `factor` is the weight of the new value
///
/// The first value passes through unchanged.
pub fn smooth_coordinate(previous: Option<Coordinate>, new: Coordinate, factor: f64) -> Coordinate {
    match previous {
        Some(previous) => lerp(previous, new, factor),
        None => new,
    }
}

/// Linear interpolation between two coordinates; `weight` applies to `to`
pub fn lerp(from: Coordinate, to: Coordinate, weight: f64) -> Coordinate {
    let a = Vector2::new(from.lat, from.lng);
    let b = Vector2::new(to.lat, to.lng);
    let blended = a.lerp(&b, weight);
    Coordinate::new(blended.x, blended.y)
}

/// Shortest-arc heading smoothing, safe across the 0/360 seam
pub fn smooth_heading(previous: Option<f64>, raw_deg: f64, factor: f64) -> f64 {
    let raw = normalize_degrees(raw_deg);
    match previous {
        Some(previous) => normalize_degrees(previous + shortest_arc(previous, raw) * factor),
        None => raw,
    }
}

/// Stateful heading filter
#[derive(Debug, Clone)]
pub struct HeadingSmoother {
    factor: f64,
    heading: Option<f64>,
}

impl HeadingSmoother {
    pub fn new(factor: f64) -> Self {
        Self {
            factor,
            heading: None,
        }
    }

    pub fn update(&mut self, raw_deg: f64) -> f64 {
        let heading = smooth_heading(self.heading, raw_deg, self.factor);
        self.heading = Some(heading);
        heading
    }

    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    pub fn reset(&mut self) {
        self.heading = None;
    }
}
