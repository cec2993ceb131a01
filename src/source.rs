//! ==============================================================================
//! source.rs - hosted database access
//! ==============================================================================
//!
//! purpose:
//!     everything the dashboard reads comes through `DataSource`. the real
//!     implementation talks to a PostgREST endpoint (the REST face of a hosted
//!     Postgres project). tests plug in an in-memory source instead.
//!
//! queries:
//!     - sensors:   select=*                    order=id.asc
//!     - window:    select=*                    order=created_at.desc limit=N
//!     - history:   select=*,<sensors>(name)    order=created_at.desc limit=N
//!     - marker:    select=id,created_at        order=created_at.desc limit=1
//!
//! malformed rows:
//!     rows are decoded one by one. a row that cannot be decoded is logged and
//!     skipped, the rest of the batch survives.
//!
//! relationships:
//!     - used by: refresh.rs, feed.rs (poller), server.rs (history)
//!     - uses: reqwest (http), domain.rs (row types)
//!
//! ==============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::config::DatabaseConfig;
use crate::domain::{de_timestamp, DetectionEvent, HistoryRow, Sensor};

/// identity of the newest detection, used to notice inserts by polling
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EventMarker {
    #[serde(deserialize_with = "de_marker_id")]
    pub id: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_at: DateTime<Utc>,
}

/// one fetch of the detection window
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventWindow {
    /// decoded events, newest first
    pub events: Vec<DetectionEvent>,
    /// rows the server sent back, counting ones that failed to decode
    pub returned: usize,
}

/// Read access to the sensor registry and detection feed.
pub trait DataSource: Send + Sync + 'static {
    /// every sensor, ordered by id ascending
    fn fetch_sensors(&self) -> impl Future<Output = Result<Vec<Sensor>>> + Send;

    /// newest `limit` detections, newest first
    fn fetch_recent_events(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<EventWindow>> + Send;

    /// newest `limit` detections joined with the sensor display name
    fn fetch_history(&self, limit: usize) -> impl Future<Output = Result<Vec<HistoryRow>>> + Send;

    fn latest_event_marker(&self) -> impl Future<Output = Result<Option<EventMarker>>> + Send;
}

// ==============================================================================
// postgrest implementation
// ==============================================================================

pub struct RestSource {
    client: reqwest::Client,
    base_url: String,
    sensors_table: String,
    events_table: String,
}

impl RestSource {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if !config.api_key.is_empty() {
            let key = HeaderValue::from_str(&config.api_key).context("api key is not a valid header value")?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .context("api key is not a valid header value")?;
            headers.insert("apikey", key);
            headers.insert(AUTHORIZATION, bearer);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            sensors_table: config.sensors_table.clone(),
            events_table: config.events_table.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn get_rows(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
        let url = self.table_url(table);
        debug!("[SOURCE] GET {} {:?}", url, query);

        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("request to {} failed", table))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{} returned {}: {}", table, status, excerpt(&body));
        }

        response
            .json::<Vec<Value>>()
            .await
            .with_context(|| format!("{} returned a non-array body", table))
    }
}

impl DataSource for RestSource {
    async fn fetch_sensors(&self) -> Result<Vec<Sensor>> {
        let rows = self.get_rows(&self.sensors_table, &sensors_query()).await?;
        Ok(decode_rows(rows, "sensor"))
    }

    async fn fetch_recent_events(&self, limit: usize) -> Result<EventWindow> {
        let rows = self.get_rows(&self.events_table, &events_query(limit)).await?;
        Ok(decode_window(rows))
    }

    async fn fetch_history(&self, limit: usize) -> Result<Vec<HistoryRow>> {
        let rows = self
            .get_rows(&self.events_table, &history_query(&self.sensors_table, limit))
            .await?;
        Ok(decode_history(rows, &self.sensors_table))
    }

    async fn latest_event_marker(&self) -> Result<Option<EventMarker>> {
        let rows = self.get_rows(&self.events_table, &marker_query()).await?;
        Ok(decode_rows(rows, "marker").into_iter().next())
    }
}

fn sensors_query() -> Vec<(&'static str, String)> {
    vec![("select", "*".to_string()), ("order", "id.asc".to_string())]
}

fn events_query(limit: usize) -> Vec<(&'static str, String)> {
    vec![
        ("select", "*".to_string()),
        ("order", "created_at.desc".to_string()),
        ("limit", limit.to_string()),
    ]
}

fn history_query(sensors_table: &str, limit: usize) -> Vec<(&'static str, String)> {
    vec![
        ("select", format!("*,{}(name)", sensors_table)),
        ("order", "created_at.desc".to_string()),
        ("limit", limit.to_string()),
    ]
}

fn marker_query() -> Vec<(&'static str, String)> {
    vec![
        ("select", "id,created_at".to_string()),
        ("order", "created_at.desc".to_string()),
        ("limit", "1".to_string()),
    ]
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Value>, what: &str) -> Vec<T> {
    let total = rows.len();
    let decoded: Vec<T> = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("[SOURCE] Skipping malformed {} row: {}", what, e);
                None
            }
        })
        .collect();

    if decoded.len() < total {
        warn!("[SOURCE] Kept {}/{} {} rows", decoded.len(), total, what);
    }
    decoded
}

fn decode_window(rows: Vec<Value>) -> EventWindow {
    let returned = rows.len();
    EventWindow {
        events: decode_rows(rows, "detection"),
        returned,
    }
}

/// the embedded sensor comes back as `{"<sensors_table>": {"name": ...}}`
fn decode_history(rows: Vec<Value>, sensors_table: &str) -> Vec<HistoryRow> {
    let total = rows.len();
    let mut decoded = Vec::with_capacity(total);

    for row in rows {
        let sensor_name = row
            .get(sensors_table)
            .and_then(|embed| embed.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match serde_json::from_value::<DetectionEvent>(row) {
            Ok(event) => decoded.push(HistoryRow { event, sensor_name }),
            Err(e) => warn!("[SOURCE] Skipping malformed history row: {}", e),
        }
    }

    if decoded.len() < total {
        warn!("[SOURCE] Kept {}/{} history rows", decoded.len(), total);
    }
    decoded
}

fn excerpt(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn de_marker_id<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}
