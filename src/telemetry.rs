//! Tracing and diagnostic-report setup shared by binaries and tests.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Respects `RUST_LOG`; without it, `default_directive` applies (e.g.
/// `"info,fabflow=debug"`). Safe to call more than once; later calls are
/// no-ops.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

/// Install miette's fancy panic reports alongside [`init`].
pub fn init_with_panic_reports(default_directive: &str) {
    miette::set_panic_hook();
    init(default_directive);
}
