//! Patrol library for AI-assisted infrastructure monitoring
//!
//! This crate provides the core functionality for:
//! - Scheduled and event-triggered patrol runs over an inventory snapshot
//! - Token-budgeted context assembly for LLM analysis
//! - Finding lifecycle tracking with regression and loop-state guards
//! - Runbook execution with structured verification
//! - Baseline, correlation, and pattern detection feeding triage and scope

pub mod analyzer;
pub mod baseline;
pub mod circuit;
pub mod correlation;
pub mod engine;
pub mod findings;
pub mod health;
pub mod history;
pub mod investigation;
pub mod logs;
pub mod models;
pub mod observability;
pub mod patterns;
pub mod providers;
pub mod runbook;
pub mod snapshot;
pub mod thresholds;
pub mod trigger;

pub use engine::{EngineConfig, PatrolEngine, PatrolEngineBuilder, PatrolStatus};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthReport};
pub use models::*;
pub use observability::{PatrolLogger, PatrolMetrics};
