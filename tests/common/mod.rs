//! Common test utilities.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ... test body ...
//! }
//! ```
//!
//! Filter with `RUST_LOG`, e.g. `RUST_LOG=blinktree=trace` (the crate must
//! be built with `--features tracing` for events to exist at all).

#![allow(dead_code)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Ensures the subscriber is only installed once across all tests.
static INIT: Once = Once::new();

/// Install a tracing subscriber driven by `RUST_LOG`.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
