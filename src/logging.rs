//! ==============================================================================
//! logging.rs - logger setup
//! ==============================================================================
//!
//! purpose:
//!     installs the env_logger backend for the `log` macros used everywhere.
//!     `RUST_LOG` wins when set. otherwise we start at `info` and narrow to
//!     the configured level once `dashboard.toml` has been read.
//!
//! relationships:
//!     - used by: main.rs (init before config, apply_level after)
//!     - uses: config.rs (`[logging] level`)
//!
//! ==============================================================================

use log::LevelFilter;

const ENV_VAR: &str = "RUST_LOG";

pub fn init() {
    let from_env = std::env::var_os(ENV_VAR).is_some();

    let mut builder = env_logger::Builder::new();
    if from_env {
        builder.parse_env(ENV_VAR);
    } else {
        builder
            .filter_level(LevelFilter::Trace)
            .filter_module("hyper", LevelFilter::Warn)
            .filter_module("reqwest", LevelFilter::Warn);
    }

    if builder.try_init().is_err() {
        return;
    }

    if !from_env {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Apply `[logging] level` unless RUST_LOG already decided.
pub fn apply_level(level: &str) {
    if std::env::var_os(ENV_VAR).is_some() {
        return;
    }
    match parse_level(level) {
        Some(filter) => log::set_max_level(filter),
        None => log::warn!("[LOG] Unknown level '{}', keeping info", level),
    }
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    level.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }
}
