//! Process-wide tracing setup shared by the service binaries.

pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize logging from the environment (`RUST_LOG`, `LOG_FORMAT`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("LOG_FORMAT")
        .ok()
        .map(|raw| LogFormat::parse(&raw))
        .unwrap_or_default();
    tracing::init(format);
}
