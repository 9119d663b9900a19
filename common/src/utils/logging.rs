//! Tracing setup for demos and tests.
//!
//! Two outputs are supported: Chrome Trace JSON (viewable in `chrome://tracing`) and
//! terminal output with span timings. The mode is picked from command-line flags so
//! demos can be run unchanged with or without tracing.

use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::{
    EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Where spans and events are written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TracingMode {
    /// No subscriber is installed.
    #[default]
    Off,
    /// Chrome Trace JSON written to `trace-<timestamp>.json`.
    Chrome,
    /// Human readable output on stderr, filtered by `RUST_LOG` (default: info).
    Terminal,
}

impl TracingMode {
    /// `--trace` selects Chrome output, `--trace-terminal` selects terminal output.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mode = TracingMode::Off;
        for arg in args {
            match arg.as_ref() {
                "--trace" => mode = TracingMode::Chrome,
                "--trace-terminal" if mode == TracingMode::Off => mode = TracingMode::Terminal,
                _ => {}
            }
        }
        mode
    }
}

#[allow(dead_code)]
/// Keeps the Chrome trace file open; drop it at the end of `main`.
pub struct TracingGuard(Option<tracing_chrome::FlushGuard>);

/// Install a subscriber for `mode` and print a banner with `title`.
///
/// Returns the guard that must outlive the traced code.
pub fn setup_tracing(title: &str, mode: TracingMode) -> TracingGuard {
    match mode {
        TracingMode::Chrome => {
            let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
            tracing_subscriber::registry().with(chrome_layer).init();
            println!("=== {title} (Chrome tracing) ===");
            TracingGuard(Some(guard))
        }
        TracingMode::Terminal => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_span_events(FmtSpan::CLOSE);
            let env_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
            println!("=== {title} (terminal tracing, RUST_LOG to filter) ===");
            TracingGuard(None)
        }
        TracingMode::Off => {
            println!("=== {title} ===");
            TracingGuard(None)
        }
    }
}
