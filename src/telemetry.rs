//! Tracing initialization.
//!
//! skein emits structured `tracing` events throughout; embedding
//! applications that already install their own subscriber can skip this.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard env-filter directives (e.g. `skein=debug`)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
        )
        .try_init();
}
