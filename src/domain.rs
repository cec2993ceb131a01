//! ==============================================================================
//! domain.rs - sensor, detection and reading types
//! ==============================================================================
//!
//! purpose:
//!     the rows we pull from the hosted database and the projections we build
//!     from them. decoding is lenient: a missing coordinate or confidence
//!     becomes `None` and is rendered as a placeholder further up, it never
//!     fails a whole batch.
//!
//! relationships:
//!     - decoded by: source.rs (rest rows)
//!     - consumed by: reconcile.rs, history.rs, estimate.rs
//!
//! ==============================================================================

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// operational status reported in the sensor registry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Active,
    Offline,
    /// anything else upstream sends us, including null
    #[default]
    Other,
}

impl SensorStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => SensorStatus::Active,
            "offline" => SensorStatus::Offline,
            _ => SensorStatus::Other,
        }
    }
}

impl<'de> Deserialize<'de> for SensorStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(SensorStatus::parse).unwrap_or_default())
    }
}

/// one entry of the sensor registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// unique sensor identifier (e.g., "S-001"); numeric ids are stringified
    #[serde(deserialize_with = "de_id")]
    pub id: String,

    /// display name shown on the marker popup
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub latitude: Option<f64>,

    #[serde(default)]
    pub longitude: Option<f64>,

    /// battery percentage, 0-100
    #[serde(default)]
    pub battery_level: Option<f64>,

    #[serde(default)]
    pub status: SensorStatus,
}

impl Sensor {
    /// both coordinates, or nothing to put on the map
    pub fn coordinate(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}

/// a single classification result from the detection feed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(deserialize_with = "de_id")]
    pub id: String,

    /// owning sensor (foreign reference into the registry)
    #[serde(deserialize_with = "de_id")]
    pub sensor_id: String,

    #[serde(deserialize_with = "de_timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(default, deserialize_with = "de_flag")]
    pub leak_detected: bool,

    /// classifier confidence, 0-100
    #[serde(default)]
    pub confidence: Option<f64>,

    #[serde(default)]
    pub estimated_size: Option<String>,

    #[serde(default)]
    pub estimated_location: Option<String>,
}

/// a sensor paired with its most recent event inside the fetched window
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LatestReading {
    pub sensor: Sensor,
    pub event: Option<DetectionEvent>,
}

/// a detection event joined with its sensor's display name
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryRow {
    #[serde(flatten)]
    pub event: DetectionEvent,
    pub sensor_name: Option<String>,
}

/// accepts `"S-001"` as well as `17`
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
        Uint(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Int(n) => n.to_string(),
        RawId::Uint(n) => n.to_string(),
    })
}

/// RFC 3339 (`timestamptz`), or an offset-less `timestamp` column read as UTC
pub(crate) fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // postgres text output uses a space instead of `T`
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// null leak flags count as "no leak"
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}
