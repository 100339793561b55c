//! Tracing subscriber setup for binaries and integration harnesses.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` wins when set; the
/// default keeps the core crates at debug and everything else quiet.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booktarr_core=debug,booktarr_model=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
