//! Synthetic administrative health-records cohort generator.
//!
//! A run turns one validated configuration into a population of cohort
//! members, each with demographic attributes, disease exposures and the
//! hospitalizations, clinic visits and prescriptions those exposures
//! cause. Members are generated concurrently and their records are
//! streamed into one output per category.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod generator;
pub mod lookup;
pub mod member;
pub mod orchestrator;
pub mod rng;
pub mod sampler;
pub mod sink;
pub mod types;

pub use config::{CohortConfig, ConfigFile};
pub use dispatch::{Category, Dispatcher, Record};
pub use error::{CohortError, CohortResult};
pub use orchestrator::{Orchestrator, RunPhase, RunSummary};
