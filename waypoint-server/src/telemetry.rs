//! Tracing setup for the server binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing from `RUST_LOG`, defaulting to info with debug output
/// for the engine.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,waypoint=debug,waypoint_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
