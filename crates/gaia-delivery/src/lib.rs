//! Outbound delivery pipeline: classified retry, dead-letter quarantine,
//! auto-requeue, operator requeue, and persisted retry counters.

mod files;
mod job;
mod metrics;
mod worker;

pub use files::JobFile;
pub use job::{classify, FailureClass, OutboundAction, OutboundJob};
pub use metrics::{
    MetricsFile, METRIC_ATTEMPT_ERROR, METRIC_ATTEMPT_START, METRIC_ATTEMPT_SUCCEEDED,
    METRIC_MOVED_PERMANENT,
};
pub use worker::{Delivery, DeliveryConfig, RequeueSelector, RetryPassReport};
