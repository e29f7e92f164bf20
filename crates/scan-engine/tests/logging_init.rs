//! Global subscriber installation, kept in its own test binary.

use scan_engine::config::LoggingConfig;
use scan_engine::logging::{self, OutputFormat};

#[test]
fn init_is_idempotent() {
    let config = LoggingConfig {
        format: OutputFormat::Compact,
        ..Default::default()
    };
    assert!(logging::init(&config).is_ok());
    assert!(logging::init(&config).is_ok());
    tracing::info!("logging installed");
}
