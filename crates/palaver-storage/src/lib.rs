//! Durable client-side persistence for the widget runtime.
//!
//! Provides a namespaced key-value store over SQLite with an in-memory
//! fallback, and the `SessionStore` that owns visitor identity and the
//! small counters the orchestrator persists across reloads.

pub mod kv;
pub mod session;

pub use kv::{KeyValueStore, MemoryStore, SqliteStore};
pub use session::SessionStore;
