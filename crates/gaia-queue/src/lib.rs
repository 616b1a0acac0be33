//! Task queue coordination for the gaia orchestrator.
//!
//! The coordinator is the single serialization point for claims; workers and
//! producers share its public contract. The agent supervisor enforces
//! single-instance starts, and the reclaimer returns expired leases.

pub mod agent_supervisor;
pub mod coordinator;
pub mod worker;

pub use agent_supervisor::{
    process_alive, retry_with_backoff, AgentHandle, AgentSupervisor, SpawnRetryConfig,
};
pub use coordinator::Coordinator;
pub use worker::{run_reclaimer, TaskHandler, Worker, WorkerConfig};
