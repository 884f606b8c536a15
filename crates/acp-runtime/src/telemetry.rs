//! Tracing initialization for binaries and tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The filter comes from `ACP_LOG` (falling back to `info`); repeated calls
/// are no-ops so tests can call this freely.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("ACP_LOG")
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
