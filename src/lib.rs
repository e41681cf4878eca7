pub mod annotations;
pub mod clone_request;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod reconciler;
pub mod source_pod;
pub mod telemetry;
pub mod token;

pub use error::{Error, Result};
