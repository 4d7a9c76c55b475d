//! Cache materialisation layer.
//!
//! Redis-backed when a URL is configured, otherwise an in-process TTL store
//! with the same logical keys. All writes are best-effort: callers log
//! failures and move on.

pub mod keys;
pub mod store;

pub use keys::TtlSet;
pub use store::{CacheStore, MemoryStore};
