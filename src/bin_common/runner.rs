//! Binary runner utilities
//!
//! Logging setup and the startup/shutdown banners shared by the binaries.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Configuration for running a binary application
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Name of the binary (for logging)
    pub name: String,
    /// Interval between metrics reports in seconds
    pub stats_interval_secs: u64,
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats_interval_secs: 60,
        }
    }

    pub fn with_stats_interval(mut self, secs: u64) -> Self {
        self.stats_interval_secs = secs;
        self
    }
}

/// Initialize tracing; `RUST_LOG` wins over the configured level
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .try_init();
}

pub fn print_banner(config: &RunConfig) {
    info!("");
    info!("========================================");
    info!("Starting {}", config.name);
    info!("Press Ctrl+C to stop");
    info!("========================================");
    info!("");
}

pub fn print_shutdown(config: &RunConfig, stats: Option<&str>) {
    info!("");
    info!("========================================");
    info!("{} stopped gracefully", config.name);
    if let Some(stats) = stats {
        info!("{}", stats);
    }
    info!("========================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_config_builder() {
        let config = RunConfig::new("test-binary").with_stats_interval(15);

        assert_eq!(config.name, "test-binary");
        assert_eq!(config.stats_interval_secs, 15);
    }

    #[test]
    fn test_default_config() {
        let config = RunConfig::new("default");
        assert_eq!(config.stats_interval_secs, 60);
    }

    #[test]
    fn test_logging_init_is_idempotent() {
        init_logging_with_level("debug");
        init_logging_with_level("info");
    }
}
