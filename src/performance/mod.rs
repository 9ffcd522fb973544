//! Performance helpers: the per-farmer response cache and concurrent execution of
//! independent lookups.

mod cache;
mod parallel;

pub use cache::{normalize_message, CacheStats, ResponseCache};
pub use parallel::ParallelProcessor;
