use std::{ops::ControlFlow, sync::Arc};

use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{
    app::AppState,
    auth::{Handshake, ShopServices},
    behavior::{proactive_text, should_emit},
    error::{AppError, Result},
    events::{ClientEvent, InterventionFeedbackPayload, ServerEvent, SessionInitPayload},
    realtime::ClientHandle,
    session::ConnectionSession,
    types::{BehaviorData, PresenceStatus},
    typing::TypingIndicator,
};

/// Event dispatcher for one WebSocket connection.
///
/// Events are handled one at a time in arrival order. Behavior analysis is the
/// exception: it runs on its own task so a slow scorer never delays chat.
pub struct Connection {
    state: Arc<AppState>,
    client: ClientHandle,
    session: ConnectionSession,
    services: Option<ShopServices>,
    typing: Option<TypingIndicator>,
    last_intervention: Arc<Mutex<Option<i64>>>,
    analyses: JoinSet<()>,
}

impl Connection {
    pub async fn new(state: Arc<AppState>, tx: mpsc::UnboundedSender<String>) -> Self {
        let client = ClientHandle::register(state.hub.clone(), tx).await;
        let session = ConnectionSession::new(client.client_id());
        Self {
            state,
            client,
            session,
            services: None,
            typing: None,
            last_intervention: Arc::new(Mutex::new(None)),
            analyses: JoinSet::new(),
        }
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    /// Gates the connection. On failure the error is emitted and the caller
    /// must close the socket; nothing about the session is kept.
    pub async fn authenticate(&mut self, handshake: &Handshake) -> Result<()> {
        let services = match self.state.authenticator.authenticate(handshake).await {
            Ok(services) => services,
            Err(err) => {
                warn!(connection_id = self.client.client_id(), error = %err, "authentication failed");
                self.client.emit(&ServerEvent::error(&err)).await;
                return Err(err);
            }
        };

        self.session.mark_ready(services.shop_id, services.platform.clone());
        self.client.join_shop(services.shop_id).await;
        self.typing = Some(TypingIndicator::new(
            self.client.hub(),
            self.client.client_id(),
            services.shop_id,
        ));
        self.services = Some(services);
        self.client
            .emit(&ServerEvent::ServicesReady { status: "ready" })
            .await;

        if let Some(visitor_id) = handshake.visitor_id.as_deref() {
            self.session.set_visitor(visitor_id);
            self.announce_presence(PresenceStatus::Online).await;
        }
        info!(
            connection_id = self.client.client_id(),
            shop_id = self.session.shop_id(),
            platform = self.session.platform(),
            "connection ready"
        );
        Ok(())
    }

    /// Parses and dispatches one text frame. `Break` means the session ended.
    pub async fn handle_text(&mut self, text: &str) -> ControlFlow<()> {
        let result = match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(event).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(flow) => flow,
            Err(err) => {
                self.report(&err);
                self.client.emit(&ServerEvent::error(&err)).await;
                ControlFlow::Continue(())
            }
        }
    }

    pub async fn handle_event(&mut self, event: ClientEvent) -> Result<ControlFlow<()>> {
        if !self.session.is_ready() {
            warn!(
                connection_id = self.client.client_id(),
                event = event.name(),
                "event before services initialized"
            );
            self.client
                .emit(&ServerEvent::ServicesStatus {
                    status: "not_ready",
                    message: "Waiting for services to initialize".to_string(),
                })
                .await;
            return Ok(ControlFlow::Continue(()));
        }
        self.reap_analyses();

        match event {
            ClientEvent::SessionInit(payload) => self.on_session_init(payload).await?,
            ClientEvent::Message(payload) => {
                let services = self.services()?.clone();
                self.state
                    .relay
                    .relay(&mut self.session, &services.context, &self.client, &payload)
                    .await?;
            }
            ClientEvent::BehaviorUpdate(snapshot) => self.on_behavior_update(*snapshot)?,
            ClientEvent::Typing(payload) => {
                let session_id = self.session.conversation_id();
                if let Some(typing) = self.typing.as_mut() {
                    if payload.is_typing {
                        typing.start(session_id).await;
                    } else {
                        typing.stop().await;
                    }
                }
            }
            ClientEvent::Presence(payload) => {
                if self.session.visitor_id().is_none() {
                    return Err(AppError::validation("visitorId is required"));
                }
                self.announce_presence(payload.status).await;
            }
            ClientEvent::InterventionFeedback(payload) => self.on_feedback(payload).await,
            ClientEvent::EndSession => {
                if let Some(typing) = self.typing.as_mut() {
                    typing.stop().await;
                }
                let conversation_id = self.session.end(self.state.store.as_ref()).await?;
                self.client
                    .emit(&ServerEvent::SessionEnded { conversation_id })
                    .await;
                return Ok(ControlFlow::Break(()));
            }
            ClientEvent::Unknown(name) => {
                debug!(connection_id = self.client.client_id(), event = %name, "ignoring unknown event");
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Waits for in-flight behavior analyses.
    pub async fn settle(&mut self) {
        while self.analyses.join_next().await.is_some() {}
    }

    /// Disconnect. The conversation stays active; only `end_session` ends it.
    pub async fn close(mut self) {
        if let Some(typing) = self.typing.as_mut() {
            typing.stop().await;
        }
        self.typing = None;
        if self.services.is_some() && self.session.visitor_id().is_some() {
            self.announce_presence(PresenceStatus::Offline).await;
        }
        self.session.close();
        self.analyses.detach_all();
        self.client.unregister().await;
        info!(
            connection_id = self.client.client_id(),
            conversation_id = self.session.conversation_id(),
            "connection closed"
        );
    }

    fn services(&self) -> Result<&ShopServices> {
        self.services
            .as_ref()
            .ok_or_else(|| AppError::internal("shop services missing on a ready session"))
    }

    async fn on_session_init(&mut self, payload: SessionInitPayload) -> Result<()> {
        self.session.check_shop(payload.shop_id)?;
        let had_visitor = self.session.visitor_id().is_some();
        let binding = self
            .session
            .init_session(
                self.state.store.as_ref(),
                &payload.visitor_id,
                &payload.metadata,
                payload.conversation_id,
            )
            .await?;
        self.client
            .emit(&ServerEvent::ConversationCreated {
                conversation_id: binding.conversation_id,
            })
            .await;
        if !had_visitor {
            self.announce_presence(PresenceStatus::Online).await;
        }
        Ok(())
    }

    fn on_behavior_update(&mut self, snapshot: BehaviorData) -> Result<()> {
        let engine = self.services()?.engine.clone();
        let shop_id = self.session.check_shop(None)?;
        let Some(visitor_id) = self.session.visitor_id().map(str::to_string) else {
            warn!(
                connection_id = self.client.client_id(),
                "behavior update from an unidentified visitor"
            );
            return Ok(());
        };
        let client = self.client.clone();
        let last_intervention = self.last_intervention.clone();

        self.analyses.spawn(async move {
            let analysis = engine.analyze(&visitor_id, shop_id, &snapshot).await;
            let decision = &analysis.decision;
            if !should_emit(decision) {
                debug!(
                    shop_id,
                    visitor_id,
                    should_intervene = decision.should_intervene,
                    confidence = decision.confidence,
                    "intervention withheld"
                );
                return;
            }
            *last_intervention.lock().await = analysis.snapshot_id;
            client
                .emit(&ServerEvent::ProactiveMessage {
                    message: proactive_text(decision),
                    intervention_type: decision.intervention_type,
                    timing: decision.timing,
                })
                .await;
            info!(shop_id, visitor_id, confidence = decision.confidence, "proactive message sent");
        });
        Ok(())
    }

    async fn on_feedback(&mut self, payload: InterventionFeedbackPayload) {
        let Some(snapshot_id) = self.last_intervention.lock().await.take() else {
            warn!(connection_id = self.client.client_id(), "feedback without a recorded intervention");
            return;
        };
        let Some(services) = self.services.as_ref() else {
            return;
        };
        if let Err(err) = services
            .engine
            .record_outcome(snapshot_id, payload.accepted)
            .await
        {
            warn!(snapshot_id, error = %err, "failed to record intervention outcome");
        }
    }

    async fn announce_presence(&self, status: PresenceStatus) {
        let (Some(visitor_id), Some(shop_id)) = (self.session.visitor_id(), self.session.shop_id())
        else {
            return;
        };
        let entry = self.state.presence.update(visitor_id, shop_id, status).await;
        self.client
            .broadcast(shop_id, &ServerEvent::Presence(entry))
            .await;
    }

    fn reap_analyses(&mut self) {
        while let Some(joined) = self.analyses.try_join_next() {
            if let Err(err) = joined {
                error!(connection_id = self.client.client_id(), error = %err, "behavior analysis task failed");
            }
        }
    }

    fn report(&self, err: &AppError) {
        let connection_id = self.client.client_id();
        if err.code() >= 500 {
            error!(connection_id, error = %err, "event handling failed");
        } else {
            warn!(connection_id, error = %err, "event rejected");
        }
    }
}
