//! ==============================================================================
//! estimate.rs - display heuristics derived from a detection
//! ==============================================================================
//!
//! purpose:
//!     turns a confidence score into a coarse leak-size label and produces a
//!     placeholder location label. neither is a measurement. the location
//!     label is pseudo-random, seeded from the event id so every view of the
//!     same event shows the same guess, and lives behind `LocationEstimator`
//!     so tests can swap in a fixed one.
//!
//! relationships:
//!     - used by: server.rs (reading and history views)
//!     - uses: rand (placeholder distance)
//!
//! ==============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::domain::{DetectionEvent, LatestReading, SensorStatus};

pub const SIZE_PLACEHOLDER: &str = "-";
pub const LOCATION_PLACEHOLDER: &str = "Normal";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SizeLabel {
    Large,
    Medium,
    Small,
    #[serde(rename = "N/A")]
    NotAvailable,
}

impl SizeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeLabel::Large => "Large",
            SizeLabel::Medium => "Medium",
            SizeLabel::Small => "Small",
            SizeLabel::NotAvailable => "N/A",
        }
    }
}

/// strict greater-than thresholds: >85 large, >60 medium, >0 small
pub fn estimate_size(confidence: f64) -> SizeLabel {
    if confidence > 85.0 {
        SizeLabel::Large
    } else if confidence > 60.0 {
        SizeLabel::Medium
    } else if confidence > 0.0 {
        SizeLabel::Small
    } else {
        SizeLabel::NotAvailable
    }
}

/// Produces a human-readable guess of where along the line a leak sits.
///
/// Implementations are display-only heuristics. The same `event_id` must
/// always produce the same label.
pub trait LocationEstimator: Send + Sync {
    fn estimate_location(&self, event_id: &str, sensor_name: &str) -> String;
}

/// random distance offset from the sensor, the dashboard's placeholder.
/// the generator is seeded per event, not per call
#[derive(Clone, Copy, Debug)]
pub struct RandomLocationEstimator {
    pub max_offset_m: u32,
}

impl Default for RandomLocationEstimator {
    fn default() -> Self {
        Self { max_offset_m: 100 }
    }
}

impl LocationEstimator for RandomLocationEstimator {
    fn estimate_location(&self, event_id: &str, sensor_name: &str) -> String {
        let mut hasher = DefaultHasher::new();
        event_id.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());
        let offset = rng.gen_range(0..=self.max_offset_m.max(1));
        format!("~{}m from {}", offset, sensor_name)
    }
}

/// deterministic stand-in, always the same offset
#[derive(Clone, Copy, Debug)]
pub struct FixedLocationEstimator(pub u32);

impl LocationEstimator for FixedLocationEstimator {
    fn estimate_location(&self, _event_id: &str, sensor_name: &str) -> String {
        format!("~{}m from {}", self.0, sensor_name)
    }
}

/// size/location labels attached to one event for display
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventEstimates {
    pub size: String,
    pub location: String,
    /// true when either label came from the heuristics above rather than
    /// from the event row itself
    pub heuristic: bool,
}

/// Labels for one event. Heuristics only run for leaks; labels stored on
/// the event row take precedence.
pub fn describe(
    event: &DetectionEvent,
    sensor_name: &str,
    estimator: &dyn LocationEstimator,
) -> EventEstimates {
    if !event.leak_detected {
        return EventEstimates {
            size: SIZE_PLACEHOLDER.to_string(),
            location: LOCATION_PLACEHOLDER.to_string(),
            heuristic: false,
        };
    }

    let mut heuristic = false;

    let size = match non_empty(&event.estimated_size) {
        Some(label) => label.to_string(),
        None => {
            heuristic = true;
            event
                .confidence
                .map(estimate_size)
                .unwrap_or(SizeLabel::NotAvailable)
                .as_str()
                .to_string()
        }
    };

    let location = match non_empty(&event.estimated_location) {
        Some(label) => label.to_string(),
        None => {
            heuristic = true;
            estimator.estimate_location(&event.id, sensor_name)
        }
    };

    EventEstimates {
        size,
        location,
        heuristic,
    }
}

fn non_empty(label: &Option<String>) -> Option<&str> {
    label.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// colour bucket for the map marker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerState {
    Leak,
    Normal,
    NoReading,
    Offline,
}

pub fn marker_state(reading: &LatestReading) -> MarkerState {
    match (&reading.event, reading.sensor.status) {
        (Some(event), _) if event.leak_detected => MarkerState::Leak,
        (_, SensorStatus::Offline) => MarkerState::Offline,
        (Some(_), _) => MarkerState::Normal,
        (None, _) => MarkerState::NoReading,
    }
}

/// "87%" or "-" when the registry has no value
pub fn battery_label(level: Option<f64>) -> String {
    match level {
        Some(v) if v.is_finite() => format!("{:.0}%", v.clamp(0.0, 100.0)),
        _ => SIZE_PLACEHOLDER.to_string(),
    }
}
