pub mod config;
pub mod error;
pub mod health;
pub mod platform;
pub mod port_alloc;
pub mod profiles;
pub mod registry;
pub mod ring_buffer;
pub mod runner;
pub mod supervisor;
pub mod validation;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{OrchestratorConfig, StopTimings};
pub use error::{Error, ErrorKind, Result};
pub use profiles::ProfileResolver;
pub use registry::Orchestrator;
