//! SwapServe Coordinator
//!
//! The control plane of the fleet: spawns and supervises the shard
//! processes, chunks request batches across data-parallel ranks, and
//! exposes the HTTP surface the trainer talks to.

pub mod api;
pub mod dispatch;
pub mod pool;

pub use api::AppState;
pub use pool::WorkerPool;
