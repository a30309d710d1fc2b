use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    store::ConversationStore,
    types::{ConversationStatus, NewConversation, SessionMetadata},
};

pub const CONVERSATION_SOURCE: &str = "chat_widget";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Ready,
    Bound,
    Closed,
}

/// Conversation the session is bound to after a binding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub conversation_id: i64,
    /// True only when this call inserted the conversation row.
    pub created: bool,
}

/// In-memory state of one connection. Owned by its handler and never shared.
#[derive(Debug)]
pub struct ConnectionSession {
    connection_id: usize,
    visitor_id: Option<String>,
    shop_id: Option<i64>,
    platform: Option<String>,
    verified: bool,
    services_initialized: bool,
    conversation_id: Option<i64>,
    metadata: SessionMetadata,
    closed: bool,
}

impl ConnectionSession {
    pub fn new(connection_id: usize) -> Self {
        Self {
            connection_id,
            visitor_id: None,
            shop_id: None,
            platform: None,
            verified: false,
            services_initialized: false,
            conversation_id: None,
            metadata: SessionMetadata::new(),
            closed: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if self.closed {
            SessionPhase::Closed
        } else if !self.verified || !self.services_initialized {
            SessionPhase::Connecting
        } else if self.conversation_id.is_some() {
            SessionPhase::Bound
        } else {
            SessionPhase::Ready
        }
    }

    pub fn visitor_id(&self) -> Option<&str> {
        self.visitor_id.as_deref()
    }

    pub fn shop_id(&self) -> Option<i64> {
        self.shop_id
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn conversation_id(&self) -> Option<i64> {
        self.conversation_id
    }

    /// Accepts message and behavior events only once authenticated and wired.
    pub fn is_ready(&self) -> bool {
        matches!(self.phase(), SessionPhase::Ready | SessionPhase::Bound)
    }

    /// Connecting -> Ready. Called once the authenticator has built the shop services.
    pub fn mark_ready(&mut self, shop_id: i64, platform: impl Into<String>) {
        self.shop_id = Some(shop_id);
        self.platform = Some(platform.into());
        self.verified = true;
        self.services_initialized = true;
    }

    pub fn set_visitor(&mut self, visitor_id: impl Into<String>) {
        let visitor_id = visitor_id.into();
        if !visitor_id.trim().is_empty() {
            self.visitor_id = Some(visitor_id);
        }
    }

    pub fn merge_metadata(&mut self, metadata: &SessionMetadata) {
        for (key, value) in metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
    }

    /// Rejects payloads that name a shop other than the authenticated one.
    pub fn check_shop(&self, claimed: Option<i64>) -> Result<i64> {
        let shop_id = self
            .shop_id
            .ok_or_else(|| AppError::unauthorized("Session is not authenticated"))?;
        match claimed {
            Some(claimed) if claimed != shop_id => {
                Err(AppError::validation("Shop does not match the authenticated store"))
            }
            _ => Ok(shop_id),
        }
    }

    /// Ready -> Bound. Repeating it on a bound session changes nothing and
    /// returns the existing conversation.
    pub async fn init_session(
        &mut self,
        store: &dyn ConversationStore,
        visitor_id: &str,
        metadata: &SessionMetadata,
        resume: Option<i64>,
    ) -> Result<Binding> {
        if let Some(conversation_id) = self.conversation_id {
            return Ok(Binding {
                conversation_id,
                created: false,
            });
        }
        if visitor_id.trim().is_empty() {
            return Err(AppError::validation("visitorId is required"));
        }
        self.set_visitor(visitor_id);
        self.merge_metadata(metadata);
        self.bind(store, resume).await
    }

    /// Lazy binding for a message that arrives before `session_init`.
    pub async fn ensure_conversation(
        &mut self,
        store: &dyn ConversationStore,
        visitor_hint: Option<&str>,
        resume: Option<i64>,
    ) -> Result<Binding> {
        if let Some(conversation_id) = self.conversation_id {
            if resume.is_some_and(|requested| requested != conversation_id) {
                warn!(
                    connection_id = self.connection_id,
                    conversation_id,
                    requested = resume,
                    "ignoring conversation hint on a bound session"
                );
            }
            return Ok(Binding {
                conversation_id,
                created: false,
            });
        }
        if self.visitor_id.is_none() {
            match visitor_hint.map(str::trim).filter(|v| !v.is_empty()) {
                Some(visitor_id) => self.set_visitor(visitor_id),
                None => self.set_visitor(format!("anon_{}", Uuid::new_v4().simple())),
            }
        }
        self.bind(store, resume).await
    }

    /// Marks the bound conversation ended and closes the session.
    pub async fn end(&mut self, store: &dyn ConversationStore) -> Result<Option<i64>> {
        let ended = self.conversation_id;
        if let Some(conversation_id) = ended {
            store.end_conversation(conversation_id).await?;
            info!(connection_id = self.connection_id, conversation_id, "conversation ended");
        }
        self.close();
        Ok(ended)
    }

    /// Bound/Ready -> Closed without touching the conversation.
    pub fn close(&mut self) {
        self.closed = true;
    }

    async fn bind(&mut self, store: &dyn ConversationStore, resume: Option<i64>) -> Result<Binding> {
        let shop_id = self.check_shop(None)?;

        if let Some(requested) = resume {
            match store.get_conversation(requested).await? {
                Some(conversation)
                    if conversation.shop_id == shop_id
                        && conversation.status == ConversationStatus::Active =>
                {
                    self.conversation_id = Some(conversation.id);
                    info!(
                        connection_id = self.connection_id,
                        shop_id,
                        conversation_id = conversation.id,
                        "resumed conversation"
                    );
                    return Ok(Binding {
                        conversation_id: conversation.id,
                        created: false,
                    });
                }
                _ => warn!(
                    connection_id = self.connection_id,
                    shop_id,
                    requested,
                    "conversation cannot be resumed, starting a new one"
                ),
            }
        }

        let visitor_id = self
            .visitor_id
            .clone()
            .ok_or_else(|| AppError::validation("visitorId is required"))?;
        let url = self
            .metadata
            .get("currentUrl")
            .and_then(Value::as_str)
            .map(str::to_string);
        let metadata = (!self.metadata.is_empty()).then(|| Value::Object(self.metadata.clone()));

        let conversation_id = store
            .create_conversation(NewConversation {
                shop_id,
                visitor_id: visitor_id.clone(),
                source: CONVERSATION_SOURCE.to_string(),
                url,
                metadata,
            })
            .await?;
        self.conversation_id = Some(conversation_id);
        info!(
            connection_id = self.connection_id,
            shop_id,
            visitor_id,
            conversation_id,
            "conversation created"
        );
        Ok(Binding {
            conversation_id,
            created: true,
        })
    }
}
