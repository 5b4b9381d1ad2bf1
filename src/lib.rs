//! A process-wide typed key/value store over a fixed shared-memory arena.
//!
//! A master process initializes the region before forking; workers connect
//! through a [`Handle`] and share one content-addressed hash table, blob
//! heap and dependency-edge table without further system calls. Each
//! process layers speculative overlay frames and a two-tier local cache on
//! top. The [`layout`] module carries the sealed lattice of array layouts
//! the jit dispatches over.

pub mod cache;
pub mod config;
pub mod deps;
pub mod error;
pub mod key;
pub mod layout;
pub mod shmem;
pub mod store;
pub mod telemetry;
pub mod tmpfs;

pub use config::{CacheConfig, GcAggressiveness, ShmConfig};
pub use error::{Error, Result};
pub use shmem::{Arena, Handle};
