//! Steppe coordinator: worker registry, query admission, superstep barrier
//! driver, global checkpoint quorum tracker, rollback orchestrator, and
//! client response.

#[allow(clippy::module_inception)]
mod coord;
mod reactor;
mod reigner;

pub use coord::{CoordConfig, Coordinator};
pub use reactor::{QueryReply, QueryRequest};
pub use reigner::{
    CtrlMsg, ProgressSuperStep, ProgressSuperStepResult, StartSuperStep,
};

pub(crate) use reactor::ClientReactor;
pub(crate) use reigner::WorkerReigner;
