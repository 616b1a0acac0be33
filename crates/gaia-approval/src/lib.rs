//! Approval pipeline: inbound ingestion and dedup, classification, the
//! pending-command state machine, and gated execution.

mod classify;
mod inbound;
mod pipeline;
mod poller;

pub use classify::{classify, Inbound, Origin, SeqVerb};
pub use inbound::{InboundQueue, InboundUpdate};
pub use pipeline::{
    short_id, ApprovalConfig, ApprovalPipeline, ExecutionPolicy, DEFAULT_RETENTION_DAYS,
};
pub use poller::{poll_once, run_inbound_poller};
