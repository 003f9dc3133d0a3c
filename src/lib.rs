// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod config;
pub mod metrics;
pub mod models;
pub mod sources;
pub mod storage;

// Feed fetching: worker pool, enrichment, orchestration, scheduling
pub mod ingest;

// Background LLM translation
pub mod translate;

// API admission control
pub mod ratelimit;

pub use crate::api::router;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). `LOG_FORMAT=json` switches
/// to JSON lines. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}
