//! apiprobe - API test case execution engine.
//!
//! Runs stored HTTP test cases with optional pre/post scripts, either one
//! at a time or as ordered collection runs that produce a report.

pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod script;
pub mod store;
pub mod variables;

pub use config::*;
pub use error::EngineError;
pub use model::*;
pub use orchestrator::*;
pub use runner::*;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
