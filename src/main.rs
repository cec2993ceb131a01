//! ==============================================================================
//! main.rs - leakwatch dashboard backend entry point
//! ==============================================================================
//!
//! purpose:
//!     keeps an up-to-date "latest reading per sensor" view of a leak-sensor
//!     network whose data lives in a hosted Postgres project, and serves it
//!     (plus the detection history) as json to the browser dashboard.
//!
//! responsibilities:
//!     - load configuration and set up logging
//!     - build the rest data source
//!     - run the refresh loop (full refetch + reconcile per change notice)
//!     - run the polling fallback that notices new detections
//!     - serve the json api, including the webhook that pushes notices
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                      leakwatch (this file)                   │
//!     │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//!     │  │ poller      │  │ web server  │  │ refresh loop        │  │
//!     │  │ (feed.rs)   │  │ (server.rs) │  │ (refresh.rs)        │  │
//!     │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//!     │         │  notices       │ webhook / reads    │             │
//!     │         └────────────────┼────────────────────┘             │
//!     │                    ┌─────┴─────┐                            │
//!     │                    │  source   │ <- source.rs               │
//!     │                    └─────┬─────┘                            │
//!     └──────────────────────────┼──────────────────────────────────┘
//!                                │ https (postgrest)
//!                    ┌───────────┴───────────┐
//!                    ▼                       ▼
//!             ┌─────────────┐         ┌─────────────┐
//!             │  sensors    │         │ detections  │
//!             └─────────────┘         └─────────────┘
//!
//! ==============================================================================

mod config;
mod domain;
mod estimate;
mod feed;
mod history;
mod logging;
mod reconcile;
mod refresh;
mod server;
mod source;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};

use crate::estimate::RandomLocationEstimator;
use crate::feed::{run_poller, ChangeFeed, NoticeOrigin};
use crate::refresh::Refresher;
use crate::server::AppState;
use crate::source::RestSource;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    info!("===========================================================");
    info!("  leakwatch - sensor dashboard backend");
    info!("===========================================================");

    // step 1: load configuration
    let config = config::DashboardConfig::load_or_default();
    logging::apply_level(&config.logging.level);
    config.validate().context("invalid configuration")?;
    config.print_summary();

    // step 2: data source + shared state
    let source = Arc::new(RestSource::new(&config.database)?);
    let refresher = Refresher::new(source.clone(), config.feed.window_size);
    let (feed, notices) = ChangeFeed::channel();

    // step 3: refresh loop, primed with the initial load
    feed.notify(NoticeOrigin::Startup);
    tokio::spawn(refresher.clone().run(notices));

    // step 4: polling fallback
    if config.feed.poll_interval_seconds > 0 {
        let interval = Duration::from_secs(config.feed.poll_interval_seconds);
        tokio::spawn(run_poller(source.clone(), feed.clone(), interval));
    } else {
        info!("[FEED] Polling disabled, relying on webhook notices");
    }

    // step 5: web server (runs until shutdown)
    let app = AppState {
        refresher,
        feed,
        estimator: Arc::new(RandomLocationEstimator::default()),
        history: config.history.clone(),
        webhook_secret: config.feed.webhook_secret.clone(),
    };

    if let Err(e) = server::run_server(app, &config.server.bind).await {
        error!("[ERROR] Web server error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
