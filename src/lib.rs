//! Realtime SDK - Main Library
//!
//! Thin application layer over the `realtime-core` engine: configuration
//! loading and process setup shared by the command-line tools.
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (CLI, runners)
//! - **realtime_core**: Connection and channel engine (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust,ignore
//! use realtime_sdk::bin_common::{load_options, ConfigType};
//! use realtime_sdk::realtime_core::RealtimeClientBuilder;
//! ```

// Re-export workspace libraries for convenience
pub use realtime_core;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod runner;

    pub use cli::{load_config_from_env, load_options, parse_args, ConfigType};
    pub use runner::{init_logging_with_level, print_banner, print_shutdown, RunConfig};
}
