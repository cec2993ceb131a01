//! ==============================================================================
//! feed.rs - change notifications for the detection table
//! ==============================================================================
//!
//! purpose:
//!     tells the refresh loop "something was inserted, go refetch". the notice
//!     carries no data, only where it came from.
//!
//! sources of notices:
//!     - push: database webhook hitting POST /api/hooks/detections
//!     - poll: fallback task comparing the newest event id/timestamp
//!     - manual: POST /api/refresh (goes straight to the refresher instead)
//!     - startup: the initial load
//!
//! delivery is at-least-once. the channel is small and `notify` never waits:
//! if it is full a refresh is already queued and this notice is redundant.
//!
//! ==============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::source::{DataSource, EventMarker};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeOrigin {
    Startup,
    Webhook,
    Poll,
    Manual,
}

#[derive(Clone, Debug)]
pub struct ChangeNotice {
    pub origin: NoticeOrigin,
    pub received_at: DateTime<Utc>,
}

/// sending half, cloned into the web server and the poller
#[derive(Clone)]
pub struct ChangeFeed {
    tx: mpsc::Sender<ChangeNotice>,
}

impl ChangeFeed {
    pub fn channel() -> (Self, mpsc::Receiver<ChangeNotice>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Returns false when the notice was dropped (queue full or loop gone).
    pub fn notify(&self, origin: NoticeOrigin) -> bool {
        let notice = ChangeNotice { origin, received_at: Utc::now() };
        match self.tx.try_send(notice) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("[FEED] Queue full, {:?} notice coalesced", origin);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("[FEED] Refresh loop is gone, {:?} notice dropped", origin);
                false
            }
        }
    }
}

/// Receive the next notice and swallow whatever else is already queued.
/// Returns the first notice and how many were folded into it.
pub async fn next_batch(rx: &mut mpsc::Receiver<ChangeNotice>) -> Option<(ChangeNotice, usize)> {
    let first = rx.recv().await?;
    let mut folded = 0;
    while rx.try_recv().is_ok() {
        folded += 1;
    }
    Some((first, folded))
}

/// The first observation only primes the poller; after that any difference
/// (including the table becoming empty) counts as a change.
pub fn marker_changed(previous: &Option<Option<EventMarker>>, current: &Option<EventMarker>) -> bool {
    match previous {
        None => false,
        Some(prev) => prev != current,
    }
}

/// Webhook secret check. No configured secret means every call is accepted.
pub fn verify_secret(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected.filter(|s| !s.is_empty()) {
        None => true,
        Some(expected) => provided.map(str::trim) == Some(expected),
    }
}

/// Polling fallback for when the webhook is not wired up.
pub async fn run_poller<S: DataSource>(source: std::sync::Arc<S>, feed: ChangeFeed, interval: Duration) {
    info!("[FEED] Polling for new detections every {}s", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen: Option<Option<EventMarker>> = None;

    loop {
        ticker.tick().await;

        match source.latest_event_marker().await {
            Ok(marker) => {
                if marker_changed(&last_seen, &marker) {
                    debug!("[FEED] Newest detection is now {:?}", marker.as_ref().map(|m| &m.id));
                    feed.notify(NoticeOrigin::Poll);
                }
                last_seen = Some(marker);
            }
            Err(e) => {
                warn!("[FEED] ⚠ Poll failed: {:#}", e);
            }
        }
    }
}
