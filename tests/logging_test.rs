//! Global subscriber installation
//!
//! Lives in its own test binary: installing the global subscriber would clash
//! with `#[traced_test]` in the library's unit tests.

use scan_daq::config::AppConfig;
use scan_daq::logging::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    let config = TracingConfig::new(Level::WARN).with_ansi(false);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config.with_format(OutputFormat::Compact)).is_ok());

    let mut app = AppConfig::default();
    app.application.log_format = "json".to_string();
    assert!(logging::init_from_config(&app).is_ok());

    tracing::warn!(step = 1, "Logging still works after repeated init");
}

#[test]
fn test_invalid_level_is_rejected_before_install() {
    let mut app = AppConfig::default();
    app.application.log_level = "loud".to_string();
    assert!(logging::init_from_config(&app).is_err());
}
