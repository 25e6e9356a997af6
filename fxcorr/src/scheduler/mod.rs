//! Global scheduling: slice clock, job expansion, worker readiness and the
//! manager state machine.

pub mod barrier;
pub mod context;
pub mod expander;
pub mod handle;
pub mod messages;
pub mod plan;
pub mod registry;
pub mod service;

pub use barrier::ConnectionBarrier;
pub use context::{SchedulerContext, TimeSlice};
pub use expander::{Job, JobExpander};
pub use handle::{DEFAULT_INBOX_CAPACITY, NodeHandle, SendError};
pub use plan::{PlannedJob, plan};
pub use registry::ReadinessRegistry;
pub use service::{
    AssignmentSummary, ManagerScheduler, OUTPUT_ENDPOINT, RunReport, SchedulerLinks,
    SchedulerState, worker_endpoint,
};
