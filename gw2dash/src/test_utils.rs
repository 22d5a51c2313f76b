//! Shared helpers for unit and handler tests.

use crate::items::upstream::MockItemLookup;
use crate::items::{ItemDetail, Rarity};
use crate::types::ItemId;
use crate::{Application, BackgroundServices, Config};

pub fn item_id(raw: u32) -> ItemId {
    ItemId::try_from(i64::from(raw)).expect("test item ids are positive")
}

/// A plausible item payload; only id and name vary.
pub fn sample_item(id: u32, name: &str) -> ItemDetail {
    ItemDetail {
        id: item_id(id),
        name: name.to_string(),
        icon: format!("https://render.guildwars2.com/file/TEST/{id}.png"),
        rarity: Rarity::Basic,
        kind: "CraftingMaterial".to_string(),
        level: 0,
        description: String::new(),
        chat_link: "[&AgEAAAAA]".to_string(),
        vendor_value: 8,
        flags: Vec::new(),
    }
}

/// Defaults, minus the global Prometheus recorder.
pub fn create_test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        enable_metrics: false,
        ..Default::default()
    }
}

/// Full application on top of `lookup`, wrapped in an axum-test server.
///
/// Keep the returned [`BackgroundServices`] alive for the duration of the test; dropping it stops
/// the batch dispatcher.
pub fn create_test_app(lookup: MockItemLookup) -> (axum_test::TestServer, BackgroundServices) {
    Application::with_lookup(create_test_config(), lookup)
        .expect("Failed to create application")
        .into_test_server()
}
