//! Session document storage for Turnkeep.
//!
//! Both backends implement `turnkeep_core::SessionStore`: a compare-and-swap
//! `commit` on the document version plus an unconditional `force_commit`.
//! Every key carries the user id, so one user's sessions are never visible
//! through another user's key.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemorySessionStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;
