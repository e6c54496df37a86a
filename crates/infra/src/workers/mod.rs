//! Worker loops, the worker registry and the pool that runs them.

pub mod pool;
pub mod registry;
pub mod worker;

pub use pool::{StopReport, WorkerPool};
pub use registry::WorkerRegistry;
pub use worker::{PhaseCell, Worker, WorkerPhase, WorkerStats};
