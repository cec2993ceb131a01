//! ==============================================================================
//! refresh.rs - refetch, reconcile, publish
//! ==============================================================================
//!
//! purpose:
//!     every refresh pulls the full registry and the newest window of
//!     detections, reconciles them and swaps the result into shared state.
//!     there is no incremental patching; re-running with the same or newer
//!     data is always safe.
//!
//! ordering:
//!     each refresh takes a ticket from a monotonic counter before it starts
//!     fetching. a result is only applied if its ticket is newer than the one
//!     already on display, so a slow request finishing late cannot overwrite
//!     fresher data.
//!
//! failures:
//!     logged and stored as `last_error`. the last good readings stay up.
//!
//! relationships:
//!     - used by: main.rs (refresh loop), server.rs (manual refresh, reads)
//!     - uses: source.rs, reconcile.rs, feed.rs
//!
//! ==============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::domain::{DetectionEvent, LatestReading, Sensor};
use crate::feed::{self, ChangeNotice, NoticeOrigin};
use crate::reconcile::{reconcile, WindowReport};
use crate::source::{DataSource, EventWindow};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// nothing fetched yet
    #[default]
    Loading,
    Ready,
    /// last refresh failed, showing older data
    Stale,
    /// never managed to load anything
    Failed,
}

/// the reconciled view shared with the web server
#[derive(Clone, Debug, Default, Serialize)]
pub struct DashboardState {
    pub phase: Phase,
    pub readings: Vec<LatestReading>,
    pub window: WindowReport,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// ticket of the result currently on display
    pub applied_seq: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    seq: u64,
    origin: NoticeOrigin,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RefreshOutcome {
    Applied { seq: u64, sensors: usize, events: usize },
    /// a newer result was already applied
    Discarded { seq: u64, applied_seq: u64 },
    Failed { seq: u64, error: String },
}

pub struct Fetched {
    pub sensors: Vec<Sensor>,
    pub window: EventWindow,
}

pub struct Refresher<S> {
    source: Arc<S>,
    state: Arc<RwLock<DashboardState>>,
    issued: Arc<AtomicU64>,
    window_size: usize,
}

impl<S> Clone for Refresher<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            state: self.state.clone(),
            issued: self.issued.clone(),
            window_size: self.window_size,
        }
    }
}

impl<S: DataSource> Refresher<S> {
    pub fn new(source: Arc<S>, window_size: usize) -> Self {
        Self {
            source,
            state: Arc::new(RwLock::new(DashboardState::default())),
            issued: Arc::new(AtomicU64::new(0)),
            window_size,
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub async fn snapshot(&self) -> DashboardState {
        self.state.read().await.clone()
    }

    /// Fetch, reconcile and apply in one go.
    pub async fn refresh(&self, origin: NoticeOrigin) -> RefreshOutcome {
        let ticket = self.begin(origin);
        let fetched = self.fetch().await;
        self.complete(ticket, fetched).await
    }

    /// Reserve the next sequence number. Call before fetching.
    pub fn begin(&self, origin: NoticeOrigin) -> Ticket {
        let seq = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("[REFRESH] #{} started ({:?})", seq, origin);
        Ticket { seq, origin }
    }

    pub async fn fetch(&self) -> Result<Fetched> {
        let (sensors, window) = tokio::try_join!(
            self.source.fetch_sensors(),
            self.source.fetch_recent_events(self.window_size),
        )?;
        Ok(Fetched { sensors, window })
    }

    /// Apply `fetched` unless a newer ticket got there first.
    pub async fn complete(&self, ticket: Ticket, fetched: Result<Fetched>) -> RefreshOutcome {
        let computed = fetched.map(|f| {
            let events = &f.window.events;
            let readings = reconcile(&f.sensors, events);
            let window = WindowReport::build(self.window_size, f.window.returned, events.len(), &readings);
            (f.sensors.len(), events.len(), readings, window)
        });

        let mut state = self.state.write().await;

        if ticket.seq <= state.applied_seq {
            debug!(
                "[REFRESH] #{} discarded, #{} already applied",
                ticket.seq, state.applied_seq
            );
            return RefreshOutcome::Discarded {
                seq: ticket.seq,
                applied_seq: state.applied_seq,
            };
        }

        match computed {
            Ok((sensors, events, readings, window)) => {
                if window.readings_may_be_missing {
                    warn!(
                        "[REFRESH] Window of {} events is full; {} sensor(s) show no reading and may have older history",
                        window.requested,
                        window.sensors_without_reading.len()
                    );
                }

                state.phase = Phase::Ready;
                state.readings = readings;
                state.window = window;
                state.last_update = Some(Utc::now());
                state.last_error = None;
                state.applied_seq = ticket.seq;

                info!(
                    "[REFRESH] #{} applied ({:?}): {} sensors, {} events",
                    ticket.seq, ticket.origin, sensors, events
                );
                RefreshOutcome::Applied { seq: ticket.seq, sensors, events }
            }
            Err(e) => {
                let error = format!("{:#}", e);
                warn!("[REFRESH] ⚠ #{} failed: {}", ticket.seq, error);

                state.phase = if state.last_update.is_some() {
                    Phase::Stale
                } else {
                    Phase::Failed
                };
                state.last_error = Some(error.clone());

                RefreshOutcome::Failed { seq: ticket.seq, error }
            }
        }
    }

    /// Refresh once per batch of notices until every sender is gone.
    pub async fn run(self, mut notices: mpsc::Receiver<ChangeNotice>) {
        while let Some((notice, folded)) = feed::next_batch(&mut notices).await {
            debug!(
                "[REFRESH] {:?} notice from {} (+{} folded)",
                notice.origin,
                notice.received_at.format("%H:%M:%S%.3f"),
                folded
            );
            self.refresh(notice.origin).await;
        }
        info!("[REFRESH] Notice channel closed, refresh loop stopping");
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SensorStatus;
    use crate::source::testing::MemorySource;
    use chrono::TimeZone;

    fn sensor(id: &str) -> Sensor {
        Sensor {
            id: id.to_string(),
            name: format!("Sensor {}", id),
            latitude: Some(10.0),
            longitude: Some(20.0),
            battery_level: Some(50.0),
            status: SensorStatus::Active,
        }
    }

    fn event(id: &str, sensor_id: &str, minute: u32) -> DetectionEvent {
        DetectionEvent {
            id: id.to_string(),
            sensor_id: sensor_id.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            leak_detected: minute % 2 == 0,
            confidence: Some(minute as f64),
            estimated_size: None,
            estimated_location: None,
        }
    }

    fn refresher(window: usize) -> Refresher<MemorySource> {
        let source = MemorySource::new(
            vec![sensor("b"), sensor("a")],
            vec![event("e1", "a", 1), event("e2", "a", 2), event("e3", "b", 3)],
        );
        Refresher::new(Arc::new(source), window)
    }

    #[tokio::test]
    async fn test_initial_state_is_loading() {
        let snapshot = refresher(10).snapshot().await;
        assert_eq!(snapshot.phase, Phase::Loading);
        assert!(snapshot.readings.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_applies_reconciled_readings() {
        let refresher = refresher(10);
        let outcome = refresher.refresh(NoticeOrigin::Startup).await;
        assert_eq!(outcome, RefreshOutcome::Applied { seq: 1, sensors: 2, events: 3 });

        let snapshot = refresher.snapshot().await;
        assert_eq!(snapshot.phase, Phase::Ready);
        let pairs: Vec<(&str, Option<&str>)> = snapshot
            .readings
            .iter()
            .map(|r| (r.sensor.id.as_str(), r.event.as_ref().map(|e| e.id.as_str())))
            .collect();
        assert_eq!(pairs, [("a", Some("e2")), ("b", Some("e3"))]);
        assert!(!snapshot.window.readings_may_be_missing);
    }

    #[tokio::test]
    async fn test_truncated_window_is_reported() {
        let refresher = refresher(1);
        refresher.refresh(NoticeOrigin::Startup).await;

        let snapshot = refresher.snapshot().await;
        let a = &snapshot.readings[0];
        assert!(a.event.is_none(), "a's events fall outside the window");
        assert!(snapshot.window.readings_may_be_missing);
        assert_eq!(snapshot.window.sensors_without_reading, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_full_window_with_skipped_row_is_reported() {
        let refresher = refresher(2);
        let ticket = refresher.begin(NoticeOrigin::Poll);

        // two rows came back, only one decoded
        let fetched = Ok(Fetched {
            sensors: vec![sensor("a"), sensor("b")],
            window: EventWindow { events: vec![event("e1", "a", 1)], returned: 2 },
        });
        let outcome = refresher.complete(ticket, fetched).await;
        assert_eq!(outcome, RefreshOutcome::Applied { seq: 1, sensors: 2, events: 1 });

        let window = refresher.snapshot().await.window;
        assert_eq!((window.requested, window.fetched, window.decoded), (2, 2, 1));
        assert!(window.readings_may_be_missing);
        assert_eq!(window.sensors_without_reading, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_late_result_is_discarded() {
        let refresher = refresher(10);

        let slow = refresher.begin(NoticeOrigin::Webhook);
        let fast = refresher.begin(NoticeOrigin::Webhook);

        let fresh = refresher.fetch().await;
        assert!(matches!(
            refresher.complete(fast, fresh).await,
            RefreshOutcome::Applied { seq: 2, .. }
        ));

        let old = Ok(Fetched { sensors: vec![sensor("zzz")], window: EventWindow::default() });
        assert_eq!(
            refresher.complete(slow, old).await,
            RefreshOutcome::Discarded { seq: 1, applied_seq: 2 }
        );

        let snapshot = refresher.snapshot().await;
        assert_eq!(snapshot.readings.len(), 2);
        assert_eq!(snapshot.applied_seq, 2);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_known_readings() {
        let refresher = refresher(10);
        refresher.refresh(NoticeOrigin::Startup).await;

        *refresher.source().failing.lock().await = true;
        let outcome = refresher.refresh(NoticeOrigin::Poll).await;
        assert!(matches!(outcome, RefreshOutcome::Failed { seq: 2, .. }));

        let snapshot = refresher.snapshot().await;
        assert_eq!(snapshot.phase, Phase::Stale);
        assert_eq!(snapshot.readings.len(), 2);
        assert!(snapshot.last_error.unwrap().contains("503"));

        *refresher.source().failing.lock().await = false;
        refresher.refresh(NoticeOrigin::Manual).await;
        let snapshot = refresher.snapshot().await;
        assert_eq!(snapshot.phase, Phase::Ready);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failure_before_first_load() {
        let refresher = refresher(10);
        *refresher.source().failing.lock().await = true;
        refresher.refresh(NoticeOrigin::Startup).await;
        assert_eq!(refresher.snapshot().await.phase, Phase::Failed);
    }

    #[tokio::test]
    async fn test_repeated_refresh_is_idempotent() {
        let refresher = refresher(10);
        refresher.refresh(NoticeOrigin::Webhook).await;
        let first = refresher.snapshot().await.readings;
        refresher.refresh(NoticeOrigin::Webhook).await;
        assert_eq!(refresher.snapshot().await.readings, first);
    }

    #[tokio::test]
    async fn test_run_refreshes_on_notice_and_stops_when_closed() {
        let refresher = refresher(10);
        let (feed, rx) = crate::feed::ChangeFeed::channel();
        feed.notify(NoticeOrigin::Webhook);
        feed.notify(NoticeOrigin::Webhook);
        drop(feed);

        refresher.clone().run(rx).await;

        let snapshot = refresher.snapshot().await;
        assert_eq!(snapshot.phase, Phase::Ready);
        assert_eq!(snapshot.applied_seq, 1, "burst coalesced into one refresh");
    }
}
