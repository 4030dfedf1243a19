//! # Dependency-Aware Query Cache
//!
//! Keeps read-heavy, rarely-changing query results (menu, categories, table
//! status) in process so handlers skip the slow database link.
//!
//! ## Design Decisions
//!
//! - **TTL as safety net**: each entry expires after its category's TTL
//!   (`config::QueryCacheConfig`), checked lazily on read.
//! - **Dependency invalidation as primary mechanism**: write paths call
//!   [`DependencyCache::invalidate_table`] after commit; the reverse index
//!   finds every dependent entry.
//! - **Stale fills rejected**: loads that race with an invalidation go
//!   through a [`FillTicket`] and are discarded instead of stored.
//! - **In-process only**: no coherence across processes.
//!
//! Dependency declarations are supplied by callers and not verified. A
//! query cached without naming one of its source tables will not be dropped
//! when that table is written.

pub mod dependency_cache;
pub mod errors;

pub use dependency_cache::{CacheEntry, CacheStats, DependencyCache, FillTicket};
pub use errors::{CacheError, CacheResult};
