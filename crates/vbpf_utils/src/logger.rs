//! Process-wide `tracing` setup for the runtime crates.
//!
//! Runtime events carry a `prog{id tag}` span while a program is finalized or torn down.
//! `VBPF_LOG` takes precedence over `RUST_LOG`; setting `VBPF_LOG_SPANS` also reports
//! span close timings, which shows how long finalize and teardown take per program.

use std::sync::Once;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when neither `VBPF_LOG` nor `RUST_LOG` is set: lifecycle events from the
/// runtime, only problems from the memory and symbol layers.
pub const DEFAULT_FILTER: &str = "vbpf=info,vbpf_runtime=info,vbpf_jit=warn,vbpf_symbol=warn";

static INIT: Once = Once::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("VBPF_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialise tracing subscriber once per process.
pub fn init_logging() {
    INIT.call_once(|| {
        let span_events = if std::env::var_os("VBPF_LOG_SPANS").is_some() {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        // The release worker logs teardown from its own named thread.
        fmt()
            .with_env_filter(env_filter())
            .with_target(true)
            .with_thread_names(true)
            .with_span_events(span_events)
            .compact()
            .init();
    });
}
