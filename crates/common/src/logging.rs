use std::io;

use tracing_subscriber::EnvFilter;

const COMM_TRACE_DIRECTIVE: &str = "buildhost_protocol=trace";

/// Filter used by the binaries: `RUST_LOG` wins, then `--debug`, then `default_level`.
pub fn build_filter(rust_log: Option<&str>, default_level: &str, debug: bool, debug_comm: bool) -> String {
    let mut filter = match rust_log {
        Some(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ if debug => "debug".to_string(),
        _ => default_level.to_string(),
    };
    if debug_comm && !filter.contains("buildhost_protocol") {
        filter.push(',');
        filter.push_str(COMM_TRACE_DIRECTIVE);
    }
    filter
}

/// Install the stderr subscriber. Stdout carries build console output only.
pub fn init_tracing(default_level: &str, debug: bool, debug_comm: bool) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(rust_log.as_deref(), default_level, debug, debug_comm);
    let env_filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init();
}
