//! Reconciliation loops keeping IDE conversations and chat threads in
//! sync: the chat watcher (creation + archive mirroring) and the name
//! sync watcher (renames).

pub mod chat;
pub mod name_sync;

pub use chat::ChatWatcher;
pub use name_sync::NameSyncWatcher;
