//! Cache substrate abstraction.
//!
//! The proxy, hooks and flush worker only ever see [`CacheStore`]. The
//! in-memory implementation is the reference for the atomicity every
//! substrate must provide:
//!
//! - `add` is set-if-absent
//! - `increment`/`decrement` never recreate an absent counter
//! - `pull` is read-and-delete
//! - named locks carry a lease and are released by owner only

pub mod memory;
pub mod traits;

pub use memory::InMemoryCacheStore;
pub use traits::{CacheStore, CacheStoreExt, CacheValue};
