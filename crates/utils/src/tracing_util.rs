//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;

use crate::NAME;

/// Initialize tracing with the default configuration.
///
/// Human-oriented output goes to stderr and honors `RUST_LOG`. When running
/// as root, INFO and above are also sent to the journal.
pub fn initialize_tracing() {
    let journald_layer = if rustix::process::getuid().is_root() {
        tracing_journald::layer().ok().map(|layer| {
            layer
                .with_syslog_identifier(NAME.to_owned())
                .with_filter(tracing_subscriber::filter::LevelFilter::INFO)
        })
    } else {
        None
    };

    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::EnvFilter::from_default_env());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(journald_layer)
        .init();
}
