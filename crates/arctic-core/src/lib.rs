// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]

/// Installs the process-wide fmt subscriber. `RUST_LOG` wins; otherwise
/// everything at `info` and above is shown. Safe to call more than once.
pub fn init_tracing() {
    init_tracing_with("info");
}

pub fn init_tracing_with(default_filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
