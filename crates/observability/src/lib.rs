//! Process-wide tracing setup shared by the binaries.

/// Tracing subscriber configuration (filter, output format).
pub mod tracing;

pub use tracing::LogFormat;

/// Initialize tracing with the format selected by `LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init_with(LogFormat::from_env());
}

pub fn init_with(format: LogFormat) {
    tracing::init_with(format);
}
