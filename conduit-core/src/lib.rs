//! Conduit Core Library
//!
//! Supervisor and telemetry aggregator for running several Psiphon Conduit
//! relay workers side by side. Provides status-line scraping, the per-worker
//! restart state machine, cross-instance stats aggregation with idle
//! detection, configuration parsing, and the single-instance relay service
//! each worker runs.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod multi;
pub mod notice;
pub mod persist;
pub mod process;
pub mod scraper;
pub mod service;
pub mod sizing;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod types;
pub mod units;

// Re-export commonly used types
pub use aggregator::{Aggregate, Aggregator, AggregatorSettings};
pub use config::{Config, ConfigLoader, Options};
pub use engine::{EngineBundle, ExternalEngine, RelayEngine};
pub use error::{
    ConduitError, ConduitResult, EngineError, HardValidationError, StateTransitionError,
    SupervisorError,
};
pub use multi::{MultiService, StopHandle};
pub use service::RelayService;
pub use sizing::{calculate_instances, InstancePlan};
pub use state::{SupervisorState, SupervisorStateMachine};
pub use stats::{AggregateSnapshot, InstanceStats};
pub use supervisor::{InstanceSupervisor, RetryPolicy, WorkerRunner, WorkerSpec};
pub use types::{Bandwidth, InstanceId, MaxClients};
pub use units::{format_bytes, format_duration, parse_byte_value};
