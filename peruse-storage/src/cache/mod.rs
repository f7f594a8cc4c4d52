//! In-process caching for expensive per-key computations.

mod config;
pub mod lock;
mod ttl;

pub use config::CacheConfig;
pub use lock::mutex_lock;
pub use ttl::{CacheEntry, TtlCache};
