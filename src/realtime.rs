use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, Mutex};

use crate::events::ServerEvent;

struct HubClient {
    shop_id: Option<i64>,
    tx: mpsc::UnboundedSender<String>,
}

/// Outbound channels of every live connection, used for shop-scoped broadcasts.
///
/// A connection only ever reads its own session state; this registry only holds senders.
#[derive(Default)]
pub struct RealtimeHub {
    clients: Mutex<HashMap<usize, HubClient>>,
    next_client_id: AtomicUsize,
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tx: mpsc::UnboundedSender<String>) -> usize {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.clients
            .lock()
            .await
            .insert(client_id, HubClient { shop_id: None, tx });
        client_id
    }

    /// Makes the connection visible to broadcasts for `shop_id`.
    pub async fn join_shop(&self, client_id: usize, shop_id: i64) {
        if let Some(client) = self.clients.lock().await.get_mut(&client_id) {
            client.shop_id = Some(shop_id);
        }
    }

    pub async fn unregister(&self, client_id: usize) {
        self.clients.lock().await.remove(&client_id);
    }

    pub async fn emit_to_client(&self, client_id: usize, event: &ServerEvent) {
        let Some(payload) = event.to_frame() else {
            return;
        };
        let tx = {
            let clients = self.clients.lock().await;
            clients.get(&client_id).map(|client| client.tx.clone())
        };
        if let Some(sender) = tx {
            let _ = sender.send(payload);
        }
    }

    /// Sends to every other connection authenticated for the same shop.
    pub async fn broadcast_to_shop(&self, shop_id: i64, except: usize, event: &ServerEvent) {
        let Some(payload) = event.to_frame() else {
            return;
        };
        let senders = {
            let clients = self.clients.lock().await;
            clients
                .iter()
                .filter(|(id, client)| **id != except && client.shop_id == Some(shop_id))
                .map(|(_, client)| client.tx.clone())
                .collect::<Vec<_>>()
        };
        for sender in senders {
            let _ = sender.send(payload.clone());
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

/// One connection's view of the hub.
#[derive(Clone)]
pub struct ClientHandle {
    hub: Arc<RealtimeHub>,
    client_id: usize,
}

impl ClientHandle {
    pub async fn register(hub: Arc<RealtimeHub>, tx: mpsc::UnboundedSender<String>) -> Self {
        let client_id = hub.register(tx).await;
        Self { hub, client_id }
    }

    pub fn client_id(&self) -> usize {
        self.client_id
    }

    pub fn hub(&self) -> Arc<RealtimeHub> {
        self.hub.clone()
    }

    pub async fn emit(&self, event: &ServerEvent) {
        self.hub.emit_to_client(self.client_id, event).await;
    }

    pub async fn broadcast(&self, shop_id: i64, event: &ServerEvent) {
        self.hub
            .broadcast_to_shop(shop_id, self.client_id, event)
            .await;
    }

    pub async fn join_shop(&self, shop_id: i64) {
        self.hub.join_shop(self.client_id, shop_id).await;
    }

    pub async fn unregister(&self) {
        self.hub.unregister(self.client_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcasts_stay_inside_the_shop() {
        let hub = RealtimeHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        let a = hub.register(tx_a).await;
        let b = hub.register(tx_b).await;
        let c = hub.register(tx_c).await;
        hub.join_shop(a, 1).await;
        hub.join_shop(b, 1).await;
        hub.join_shop(c, 2).await;

        hub.broadcast_to_shop(1, a, &ServerEvent::typing(true, Some(5)))
            .await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().unwrap().contains("\"isTyping\":true"));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_clients_receive_nothing() {
        let hub = RealtimeHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(tx).await;
        hub.unregister(id).await;
        hub.emit_to_client(id, &ServerEvent::typing(false, None)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.connection_count().await, 0);
    }
}
