// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! `tracing` output for unit and integration tests.

#![warn(missing_docs)]

use tracing_subscriber::EnvFilter;

/// Installs a subscriber that writes through the test harness's captured
/// output, filtered by `RUST_LOG` (default `debug`). Every test may call it;
/// only the first call in a process installs anything.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        // Another subscriber may already be installed by the harness.
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // avoid polluting logs with escape sequences
            .log_internal_errors(true)
            .with_test_writer()
            .with_env_filter(filter)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_twice() {
        super::init();
        super::init();
        tracing::info!("should show in test output");
    }
}
