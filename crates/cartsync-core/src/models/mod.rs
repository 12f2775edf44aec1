//! Data models for Cartsync

mod category;
mod kind;
mod product;
mod shop_item;
mod sync_record;

pub use category::Category;
pub use kind::{EntityKind, EntityRef, LocalId};
pub use product::Product;
pub use shop_item::ShopItem;
pub use sync_record::{NewSyncRecord, SyncRecord};
