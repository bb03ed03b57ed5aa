//! Swap orchestration
//!
//! The engine:
//! 1. Accepts matched orders from the API queue
//! 2. Drops duplicate deliveries of orders already in flight
//! 3. Builds both legs' binders and runs each swap on its own task
//! 4. Reports every finished swap on an outcome channel

pub mod cache;
pub mod engine;

pub use cache::{CacheGuard, MutexCache};
pub use engine::{SwapEngine, SwapOutcome};
