//! Citadel Edge gateway
//!
//! Serves the violation report endpoint and fronts an upstream app with
//! the policy-enforcing interceptor.

pub mod config;
pub mod context;
pub mod server;
pub mod tasks;

pub use config::{ConfigError, EdgeConfig, REPORT_PATH};
pub use context::{EdgeContext, EdgeParts};
pub use server::{handle, serve};
pub use tasks::spawn_background_tasks;
