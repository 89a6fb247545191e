//! # dommesh Common
//!
//! Shared utilities for the dommesh components.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use dommesh_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(domain = "web-1", "Domain reconciled");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
