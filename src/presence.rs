use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::types::{now_iso, PresenceEntry, PresenceStatus};

type PresenceKey = (i64, String);

/// Last known status per visitor of each shop. In memory only; lost on restart.
#[derive(Default)]
pub struct PresenceTracker {
    entries: RwLock<HashMap<PresenceKey, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the visitor's status in that shop and returns the entry to broadcast.
    pub async fn update(&self, visitor_id: &str, shop_id: i64, status: PresenceStatus) -> PresenceEntry {
        let entry = PresenceEntry {
            visitor_id: visitor_id.to_string(),
            shop_id,
            status,
            last_seen: (status == PresenceStatus::Offline).then(now_iso),
        };
        self.entries
            .write()
            .await
            .insert((shop_id, visitor_id.to_string()), entry.clone());
        entry
    }

    pub async fn get(&self, shop_id: i64, visitor_id: &str) -> Option<PresenceEntry> {
        self.entries
            .read()
            .await
            .get(&(shop_id, visitor_id.to_string()))
            .cloned()
    }

    pub async fn online(&self, shop_id: i64) -> Vec<PresenceEntry> {
        let mut visitors: Vec<PresenceEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.shop_id == shop_id && entry.status != PresenceStatus::Offline)
            .cloned()
            .collect();
        visitors.sort_by(|a, b| a.visitor_id.cmp(&b.visitor_id));
        visitors
    }
}
