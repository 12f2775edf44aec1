//! cartsync-core - Core library for Cartsync
//!
//! This crate contains the shopping-list models, the `SQLite` local store,
//! the remote store abstraction and the synchronizer that keeps the two in
//! step for the signed-in identity's shared list.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod state;
pub mod sync;
pub mod util;

pub use auth::{Identity, IdentityProvider, LocalIdentityProvider};
pub use config::SyncSettings;
pub use db::{LocalStore, SqliteLocalStore};
pub use error::{Error, RemoteError, Result};
pub use models::{Category, EntityKind, EntityRef, LocalId, Product, ShopItem};
pub use remote::{MemoryRemoteStore, RemotePath, RemoteStore};
pub use state::SyncState;
pub use sync::{FailureListener, ReconcileReport, Synchronizer};
