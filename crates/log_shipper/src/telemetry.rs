//! Structured logging setup for a standalone embedder of this crate.
//!
//! A single `fmt` layer filtered by `RUST_LOG`/`LOG_SHIPPER_LOG`. Embedders
//! that want a rotating file writer or an error-reporting layer on top of
//! this should build their own subscriber instead of calling `init_tracing`.

use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Installs a global `tracing` subscriber. Call once, early in `main`.
/// Embedders that already manage their own subscriber should skip this and
/// just depend on `tracing` directly; every log call in this crate goes
/// through the standard `tracing` macros, not this function.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_SHIPPER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry().with(fmt::layer()).with(filter).try_init();
}
