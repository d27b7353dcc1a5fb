//! Steppe worker node: holds a partition's vertices, runs compute for one
//! superstep on command, routes outbound messages to peer workers, manages
//! local checkpoints, and replays from checkpoint on command.

mod checkpoint;
pub(crate) mod control;
mod transport;
#[allow(clippy::module_inception)]
mod worker;

pub use worker::{GraphWorker, WorkerConfig};
