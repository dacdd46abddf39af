//! Global subscriber installation. Kept in its own test binary because
//! it installs a process-wide subscriber.

use rust_mx::logging::{init, LoggingConfig, OutputFormat};
use tracing::Level;

#[test]
fn init_is_idempotent() {
    let config = LoggingConfig::new(Level::WARN).with_format(OutputFormat::Compact);
    assert!(init(config.clone()).is_ok());
    assert!(init(config).is_ok());
}
