//! Per-peer session state and its durable store.
//!
//! A [`Session`] carries the negotiated initialize pair, a typed attribute
//! bag with an explicitly persistable subset, an env overlay inherited from
//! its parent, ordered message filters, the hook pipeline, the
//! pending-request table for server-initiated exchanges, and the outbound
//! mailbox the SSE stream drains. The [`SessionStore`] serialises exclusive
//! acquisition per session id and round-trips the persistable state.

mod attrs;
mod db;
mod progress;
mod resources;
mod session;
mod store;

pub use attrs::{AttrBag, AttrKey};
pub use progress::ProgressFloor;
pub use resources::{ResourceStore, StoredResource};
pub use session::{FilterFn, MessageHandler, PersistedSession, Session};
pub use store::{
    extract_session_id, MemorySessionStore, SessionStore, SqliteSessionStore, StoreError,
};
