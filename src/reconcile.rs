//! ==============================================================================
//! reconcile.rs - latest reading per sensor
//! ==============================================================================
//!
//! purpose:
//!     joins the sensor registry with a capped, newest-first batch of
//!     detection events and produces exactly one reading per sensor.
//!
//! window truncation:
//!     the event batch is limited to the newest N rows. a sensor whose latest
//!     event is older than the oldest row in the batch shows up with no
//!     reading even though it has history. we keep that behaviour and report
//!     it through `WindowReport` instead of guessing.
//!
//! relationships:
//!     - used by: refresh.rs (every refresh re-runs the whole pass)
//!     - uses: domain.rs
//!
//! ==============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::domain::{DetectionEvent, LatestReading, Sensor};

/// Pair every sensor with its newest event in `events`.
///
/// Output order follows `sensors`. Equal timestamps resolve to whichever
/// event comes first in `events`, so for newest-first input this is simply
/// the first match.
pub fn reconcile(sensors: &[Sensor], events: &[DetectionEvent]) -> Vec<LatestReading> {
    let mut newest: HashMap<&str, &DetectionEvent> = HashMap::with_capacity(sensors.len());

    for event in events {
        newest
            .entry(event.sensor_id.as_str())
            .and_modify(|current| {
                if event.created_at > current.created_at {
                    *current = event;
                }
            })
            .or_insert(event);
    }

    sensors
        .iter()
        .map(|sensor| LatestReading {
            sensor: sensor.clone(),
            event: newest.get(sensor.id.as_str()).map(|e| (*e).clone()),
        })
        .collect()
}

/// what the fetched window could and could not tell us
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WindowReport {
    /// events requested from the feed
    pub requested: usize,
    /// rows the feed returned, including any that failed to decode
    pub fetched: usize,
    /// events that made it into reconciliation
    pub decoded: usize,
    /// sensors with no event inside the window
    pub sensors_without_reading: Vec<String>,
    /// the window was full and some sensors came back empty, so their latest
    /// event may simply be older than the window
    pub readings_may_be_missing: bool,
}

impl WindowReport {
    /// `fetched` is the raw row count; saturation is judged on it so a
    /// skipped row cannot hide a full window.
    pub fn build(requested: usize, fetched: usize, decoded: usize, readings: &[LatestReading]) -> Self {
        let sensors_without_reading: Vec<String> = readings
            .iter()
            .filter(|r| r.event.is_none())
            .map(|r| r.sensor.id.clone())
            .collect();

        let saturated = requested > 0 && fetched >= requested;

        Self {
            requested,
            fetched,
            decoded,
            readings_may_be_missing: saturated && !sensors_without_reading.is_empty(),
            sensors_without_reading,
        }
    }
}
