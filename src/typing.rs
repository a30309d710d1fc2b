use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};

use crate::{events::ServerEvent, realtime::RealtimeHub};

pub const TYPING_AUTO_CLEAR: Duration = Duration::from_secs(3);

#[derive(Default)]
struct TypingState {
    active: bool,
    generation: u64,
    session_id: Option<i64>,
}

/// Visitor typing flag relayed to the shop's other connections. Clears itself
/// after [`TYPING_AUTO_CLEAR`] unless re-armed or stopped first.
pub struct TypingIndicator {
    hub: Arc<RealtimeHub>,
    client_id: usize,
    shop_id: i64,
    state: Arc<Mutex<TypingState>>,
    timer: Option<JoinHandle<()>>,
}

impl TypingIndicator {
    pub fn new(hub: Arc<RealtimeHub>, client_id: usize, shop_id: i64) -> Self {
        Self {
            hub,
            client_id,
            shop_id,
            state: Arc::new(Mutex::new(TypingState::default())),
            timer: None,
        }
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    pub async fn start(&mut self, session_id: Option<i64>) {
        self.cancel_timer();
        let (was_active, generation) = {
            let mut state = self.state.lock().await;
            let was_active = state.active;
            state.active = true;
            state.generation += 1;
            state.session_id = session_id;
            (was_active, state.generation)
        };

        if !was_active {
            self.hub
                .broadcast_to_shop(
                    self.shop_id,
                    self.client_id,
                    &ServerEvent::typing(true, session_id),
                )
                .await;
        }

        let hub = self.hub.clone();
        let state = self.state.clone();
        let (client_id, shop_id) = (self.client_id, self.shop_id);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(TYPING_AUTO_CLEAR).await;
            let session_id = {
                let mut state = state.lock().await;
                if !state.active || state.generation != generation {
                    return;
                }
                state.active = false;
                state.session_id
            };
            hub.broadcast_to_shop(shop_id, client_id, &ServerEvent::typing(false, session_id))
                .await;
        }));
    }

    pub async fn stop(&mut self) {
        self.cancel_timer();
        let session_id = {
            let mut state = self.state.lock().await;
            if !state.active {
                return;
            }
            state.active = false;
            state.generation += 1;
            state.session_id
        };
        self.hub
            .broadcast_to_shop(
                self.shop_id,
                self.client_id,
                &ServerEvent::typing(false, session_id),
            )
            .await;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Peer {
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<bool> {
            let mut seen = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                let value: Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(value["event"], "typing");
                seen.push(value["data"]["isTyping"].as_bool().unwrap());
            }
            seen
        }
    }

    async fn setup() -> (TypingIndicator, Peer) {
        let hub = Arc::new(RealtimeHub::new());
        let (own_tx, _own_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let own = hub.register(own_tx).await;
        let peer = hub.register(peer_tx).await;
        hub.join_shop(own, 1).await;
        hub.join_shop(peer, 1).await;
        (TypingIndicator::new(hub, own, 1), Peer { rx: peer_rx })
    }

    async fn advance(duration: Duration) {
        tokio::time::advance(duration).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_stop_clears_once_after_three_seconds() {
        let (mut typing, mut peer) = setup().await;
        typing.start(Some(3)).await;
        assert_eq!(peer.drain(), vec![true]);

        advance(Duration::from_millis(2900)).await;
        assert!(peer.drain().is_empty());

        advance(Duration::from_millis(200)).await;
        assert_eq!(peer.drain(), vec![false]);

        advance(Duration::from_secs(10)).await;
        assert!(peer.drain().is_empty());
        assert!(!typing.is_active().await);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_starts_reset_the_timer_without_stacking() {
        let (mut typing, mut peer) = setup().await;
        typing.start(None).await;
        advance(Duration::from_secs(2)).await;
        typing.start(None).await;
        advance(Duration::from_secs(2)).await;
        assert_eq!(peer.drain(), vec![true]);

        advance(Duration::from_millis(1100)).await;
        assert_eq!(peer.drain(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_wins_over_the_timer() {
        let (mut typing, mut peer) = setup().await;
        typing.start(None).await;
        typing.stop().await;
        advance(Duration::from_secs(5)).await;
        assert_eq!(peer.drain(), vec![true, false]);

        typing.stop().await;
        assert!(peer.drain().is_empty());
    }
}
