//! Local store for Cartsync

mod connection;
mod listener;
mod migrations;
mod repository;

pub use connection::Database;
pub use listener::{ChangeOp, EntityListener, ListenerId, ListenerRegistry, LocalChange};
pub use repository::{LocalStore, SqliteLocalStore};
