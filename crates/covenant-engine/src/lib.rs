//! Covenant Engine — composition root.
//!
//! Reads [`EngineConfig`] from the environment, installs the tracing
//! subscriber and assembles an [`Engine`]: event store, aggregate
//! repository, command and query buses, projections, saga orchestrator and
//! two-phase commit coordinator.

pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use config::{EngineConfig, LogFormat};
pub use engine::Engine;
pub use error::EngineError;
