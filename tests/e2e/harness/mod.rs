//! E2E test harness for the coval engine.
//!
//! This module contains test infrastructure with intentionally unused
//! helpers that will be used as more e2e scenarios are written.

#![allow(dead_code)]

pub mod clock;
pub mod world;

pub use clock::MockClock;
pub use world::World;

/// Initializes tracing output for debugging test runs. Safe to call from
/// any test; only the first call wins.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
