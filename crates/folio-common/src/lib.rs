//! # Folio Common
//!
//! Shared setup for the Folio crates. Currently this is the logging
//! configuration used by the binaries; libraries only emit `tracing` events.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
