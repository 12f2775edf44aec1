use cartsync_core::{EntityKind, LocalId, LocalStore};

use crate::error::CliError;

pub fn run_remove(store: &dyn LocalStore, kind: EntityKind, id: i64) -> Result<(), CliError> {
    let id = LocalId::new(id);
    match kind {
        EntityKind::Category => store.remove_category(id)?,
        EntityKind::Product => store.remove_product(id)?,
        EntityKind::ShopItem => store.remove_shop_item(id)?,
    }
    println!("Removed {kind} {id}");
    Ok(())
}
