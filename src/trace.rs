//! Logging for tandem.
//!
//! Built on `tracing` when the `tracing` feature is enabled (the default).
//! Without it every log macro expands to nothing.

/// Installs the global subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to `tandem=info`.
/// Safe to call more than once; later calls are ignored.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .try_init();
}

#[cfg(feature = "tracing")]
fn default_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tandem=info"))
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod noop {
    macro_rules! noop {
        ($($arg:tt)*) => {};
    }

    pub(crate) use noop as debug;
    pub(crate) use noop as error;
    pub(crate) use noop as info;
    pub(crate) use noop as trace;
    pub(crate) use noop as warn;
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop::{debug, error, info, trace, warn};
