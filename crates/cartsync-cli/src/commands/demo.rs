//! Two simulated devices of one user sharing an in-memory remote list.

use std::sync::Arc;
use std::time::Duration;

use cartsync_core::{
    Category, Identity, LocalIdentityProvider, LocalStore, MemoryRemoteStore, Product, ShopItem,
    SqliteLocalStore, SyncSettings, SyncState, Synchronizer,
};

use crate::commands::add::{find_or_create_product, find_product};
use crate::commands::list::ListView;
use crate::error::CliError;

const DEMO_USER: &str = "demo-user";
const SETTLE_ATTEMPTS: usize = 100;

struct Device {
    name: &'static str,
    store: Arc<SqliteLocalStore>,
    identity: Arc<LocalIdentityProvider>,
    sync: Synchronizer,
}

impl Device {
    fn new(
        name: &'static str,
        remote: &Arc<MemoryRemoteStore>,
        settings: &SyncSettings,
    ) -> Result<Self, CliError> {
        let store = Arc::new(SqliteLocalStore::open_in_memory()?);
        let identity = Arc::new(LocalIdentityProvider::new());
        let sync = Synchronizer::new(store.clone(), remote.clone(), identity.clone())
            .with_settings(settings.clone());
        sync.start()?;
        Ok(Self {
            name,
            store,
            identity,
            sync,
        })
    }

    async fn sign_in(&self) -> Result<(), CliError> {
        self.identity.sign_in(Identity::new(DEMO_USER)?);
        let mut states = self.sync.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == SyncState::Subscribed),
        )
        .await
        .map_err(|_| CliError::DemoFailed(format!("{} did not subscribe", self.name)))?
        .map_err(|_| CliError::DemoFailed(format!("{} stopped", self.name)))?;

        println!("{} subscribed to list {}", self.name, self.sync.active_list().unwrap_or_default());
        for report in self.sync.last_reports() {
            println!("  {report}");
        }
        Ok(())
    }

    fn lines(&self) -> Result<Vec<String>, CliError> {
        let mut lines = ListView::load(self.store.as_ref())?.lines();
        lines.sort();
        Ok(lines)
    }
}

pub async fn run_demo(settings: &SyncSettings) -> Result<(), CliError> {
    let remote = Arc::new(MemoryRemoteStore::new());
    let laptop = Device::new("laptop", &remote, settings)?;
    let phone = Device::new("phone", &remote, settings)?;

    // Both devices start with overlapping offline data
    let fruit = laptop
        .store
        .insert_category(&Category::new("Fruit").with_color(0xff00_aa00))?;
    let apple = laptop.store.insert_product(&Product {
        category_id: fruit.id,
        ..Product::new("Apple")
    })?;
    if let Some(apple) = apple.id {
        laptop
            .store
            .insert_shop_item(&ShopItem::new(apple).with_quantity("6"))?;
    }
    phone.store.insert_category(&Category::new(" fruit "))?;
    let bread = find_or_create_product(phone.store.as_ref(), "Bread")?;
    phone.store.insert_shop_item(&ShopItem::new(bread))?;

    laptop.sign_in().await?;
    phone.sign_in().await?;

    // A live edit on the phone
    let apple_on_phone = find_product(phone.store.as_ref(), "apple")?
        .ok_or_else(|| CliError::DemoFailed("apple did not reach the phone".to_string()))?;
    for mut item in phone.store.list_shop_items()? {
        if item.product_id == apple_on_phone {
            item.checked = true;
            phone.store.update_shop_item(&item)?;
        }
    }

    let converged = settle(&laptop, &phone).await?;
    for device in [&laptop, &phone] {
        println!("\n{}:", device.name);
        for line in device.lines()? {
            println!("  {line}");
        }
    }

    laptop.sync.stop().await;
    phone.sync.stop().await;

    if converged {
        println!("\nBoth devices agree.");
        Ok(())
    } else {
        Err(CliError::DemoFailed(
            "devices still differ after settling".to_string(),
        ))
    }
}

async fn settle(laptop: &Device, phone: &Device) -> Result<bool, CliError> {
    for _ in 0..SETTLE_ATTEMPTS {
        laptop.sync.flush().await;
        phone.sync.flush().await;
        let laptop_lines = laptop.lines()?;
        if !laptop_lines.is_empty() && laptop_lines == phone.lines()? && all_checked(laptop)? {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(false)
}

/// The phone's edit has arrived on the laptop
fn all_checked(device: &Device) -> Result<bool, CliError> {
    let Some(apple) = find_product(device.store.as_ref(), "apple")? else {
        return Ok(false);
    };
    Ok(device
        .store
        .list_shop_items()?
        .iter()
        .filter(|item| item.product_id == apple)
        .all(|item| item.checked))
}
