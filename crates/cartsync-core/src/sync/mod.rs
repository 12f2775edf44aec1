//! Two-way synchronization between the local store and a shared remote list.

use std::sync::Arc;

use crate::db::LocalStore;
use crate::remote::RemoteStore;

/// Run `$body` with `$translator` bound to the translator of `$kind`
macro_rules! with_translator {
    ($ctx:expr, $kind:expr, $translator:ident => $body:expr) => {
        match $kind {
            $crate::models::EntityKind::Category => {
                let $translator = &$ctx.categories;
                $body
            }
            $crate::models::EntityKind::Product => {
                let $translator = &$ctx.products;
                $body
            }
            $crate::models::EntityKind::ShopItem => {
                let $translator = &$ctx.shop_items;
                $body
            }
        }
    };
}

mod apply;
mod codec;
mod conflict;
mod failure;
mod incremental;
mod markers;
mod orchestrator;
mod reconcile;
pub mod sharing;
mod translator;

pub use conflict::{decide, Resolution};
pub use failure::{FailureListener, LoggingFailureListener};
pub use orchestrator::Synchronizer;
pub use reconcile::ReconcileReport;
pub use translator::{
    CategoryTranslator, EntityTranslator, ProductTranslator, ShopItemTranslator,
};

use markers::SuppressionMarkers;

/// Everything the per-item handlers need for one attached list
pub(crate) struct SyncContext {
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub markers: SuppressionMarkers,
    pub categories: CategoryTranslator,
    pub products: ProductTranslator,
    pub shop_items: ShopItemTranslator,
}

impl SyncContext {
    pub fn new(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            categories: CategoryTranslator::new(Arc::clone(&store)),
            products: ProductTranslator::new(Arc::clone(&store)),
            shop_items: ShopItemTranslator::new(Arc::clone(&store)),
            markers: SuppressionMarkers::default(),
            store,
            remote,
        }
    }
}
