pub mod aggregate;
pub mod collector;
pub mod config;
pub mod error;
pub mod filters;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod service;
pub mod trend;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use filters::{Facet, FilterState, ScopeConstraint};
pub use models::Snapshot;
pub use orchestrator::{Orchestrator, Pipeline, PipelineState};
