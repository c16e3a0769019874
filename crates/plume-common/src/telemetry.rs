use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for a plume service.
///
/// Honors `RUST_LOG`; defaults to `info` when unset. Safe to call once per
/// process; a second call is a no-op (errors from the global registry are
/// ignored so tests can share a process).
pub fn init(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();

    tracing::debug!(service_name, "telemetry initialized");
}
