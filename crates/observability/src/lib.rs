//! Process-wide tracing setup shared by the worker binary and tests.

/// Environment variable selecting the log line format (`json` or `pretty`).
pub const LOG_FORMAT_VAR: &str = "LEADFLOW_LOG_FORMAT";

/// Initialize process-wide logging. Output is JSON unless
/// `LEADFLOW_LOG_FORMAT` asks for `pretty`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var(LOG_FORMAT_VAR)
        .map(|raw| tracing::LogFormat::parse(&raw))
        .unwrap_or_default();
    tracing::init(format);
}

/// Tracing configuration (filters, formats).
pub mod tracing;
