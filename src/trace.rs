//! Zero-cost tracing shims.
//!
//! With the `tracing` feature enabled these macros forward to the
//! [`tracing`] crate; without it (the default) they compile away entirely,
//! so the race-recovery hot paths carry no logging overhead.
//!
//! # Usage
//!
//! ```bash
//! # Normal build, no tracing overhead
//! cargo build --release
//!
//! # Run a test with restructuring events visible
//! RUST_LOG=blinktree=trace cargo test --features tracing -- stress
//! ```

#![allow(unused_macros, unused_imports)]

/// Trace-level event (race recovery, sibling handoff). No-op without the
/// `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Debug-level event (structural changes: split, merge, root swap). No-op
/// without the `tracing` feature.
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use trace_log;
