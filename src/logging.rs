//! Tracing setup (**[ADDED]**).
//!
//! Every frame-level state transition (attach/detach, stream open/close,
//! abort reason, goAway) is logged at `debug` or above elsewhere in the
//! crate with `stream_id`/`connection_id`/`tunnel_id` as structured fields
//! rather than interpolated into the message, so this init is the only
//! place formatting choices get made.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub fn init(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
