//! Shared helpers for integration tests

use std::sync::Once;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness so it shows up on failure
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}
