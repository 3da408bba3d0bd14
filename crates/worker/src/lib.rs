//! SwapServe Worker
//!
//! One shard process per data-parallel rank: a deterministic local
//! inference engine behind the shard capability trait, the
//! strictly-sequential command loop, and the weight-sync state machine
//! that hot-swaps broadcast parameters into the live engine.

pub mod engine;
pub mod session;
pub mod sync;

pub use engine::{GuidedSpec, LocalEngine, ShardEngine};
pub use session::ShardSession;
pub use sync::CommunicatorState;
