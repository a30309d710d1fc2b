use std::sync::Arc;

use tracing::{error, info, warn};

use crate::{
    completion::{CompletionService, PromptMessage},
    error::{AppError, Result},
    events::{MessagePayload, ServerEvent},
    platform::StoreContextProvider,
    prompting::{render_store_assistant_prompt, StoreAssistantContext},
    realtime::ClientHandle,
    session::ConnectionSession,
    store::ConversationStore,
    types::{Message, NewMessage, SenderType},
};

const REPLY_FAILED: &str = "Failed to generate response";

/// Reactive path: persist the visitor's message, ask for a store-grounded
/// reply, persist and emit it.
pub struct MessageRelay {
    store: Arc<dyn ConversationStore>,
    completion: Arc<dyn CompletionService>,
    history_window: usize,
}

impl MessageRelay {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        completion: Arc<dyn CompletionService>,
        history_window: usize,
    ) -> Self {
        Self {
            store,
            completion,
            history_window,
        }
    }

    /// Emits `typing=false` exactly once per attempt on every exit path,
    /// including rejections that never reached the typing indicator.
    pub async fn relay(
        &self,
        session: &mut ConnectionSession,
        context: &StoreContextProvider,
        client: &ClientHandle,
        payload: &MessagePayload,
    ) -> Result<Message> {
        let result = self.attempt(session, context, client, payload).await;
        let conversation_id = session.conversation_id();
        client
            .emit(&ServerEvent::typing(false, conversation_id))
            .await;

        if let Err(err) = &result {
            error!(conversation_id, error = %err, "message relay failed");
        }
        result
    }

    async fn attempt(
        &self,
        session: &mut ConnectionSession,
        context: &StoreContextProvider,
        client: &ClientHandle,
        payload: &MessagePayload,
    ) -> Result<Message> {
        let content = payload.content.trim();
        if content.is_empty() {
            return Err(AppError::validation("Message content is required"));
        }
        session.check_shop(payload.shop_id)?;
        let resume = payload.conversation_hint()?;
        if let Some(metadata) = &payload.metadata {
            session.merge_metadata(metadata);
        }

        let binding = session
            .ensure_conversation(self.store.as_ref(), payload.visitor_id.as_deref(), resume)
            .await?;
        let conversation_id = binding.conversation_id;
        if binding.created {
            client
                .emit(&ServerEvent::ConversationCreated { conversation_id })
                .await;
        }

        let inbound = self
            .store
            .append_message(NewMessage::text(conversation_id, SenderType::User, content))
            .await?;
        self.store.touch_conversation(conversation_id).await?;

        client
            .emit(&ServerEvent::typing(true, Some(conversation_id)))
            .await;
        self.reply(context, client, &inbound).await
    }

    async fn reply(
        &self,
        context: &StoreContextProvider,
        client: &ClientHandle,
        inbound: &Message,
    ) -> Result<Message> {
        let conversation_id = inbound.conversation_id;
        let messages = self.build_prompt(context, inbound).await?;

        let generated = self.completion.generate(&messages).await.map_err(|err| {
            AppError::upstream_with_client_message(err.to_string(), REPLY_FAILED)
        })?;
        let text = generated
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| {
                AppError::upstream_with_client_message(
                    "completion returned no content",
                    REPLY_FAILED,
                )
            })?;

        let reply = self
            .store
            .append_message(NewMessage::text(conversation_id, SenderType::Assistant, text))
            .await?;
        self.store.touch_conversation(conversation_id).await?;

        client
            .emit(&ServerEvent::MessageResponse {
                id: reply.id,
                content: reply.content.clone(),
                timestamp: reply.created_at.clone(),
            })
            .await;
        info!(conversation_id, message_id = reply.id, "assistant reply sent");
        Ok(reply)
    }

    async fn build_prompt(
        &self,
        context: &StoreContextProvider,
        inbound: &Message,
    ) -> Result<Vec<PromptMessage>> {
        let settings = context.get_store_settings().await.into_result()?;
        let products = context.get_products().await.into_result()?;

        let store_details = serde_json::to_string(&settings)?;
        let catalog = serde_json::to_string(&products)?;
        let system = render_store_assistant_prompt(&StoreAssistantContext {
            store_name: &settings.name,
            store_details: &store_details,
            products: &catalog,
            support_email: &settings.support_email,
        });

        let history = match self
            .store
            .recent_messages(inbound.conversation_id, self.history_window + 1)
            .await
        {
            Ok(history) => history,
            Err(err) => {
                warn!(
                    conversation_id = inbound.conversation_id,
                    error = %err,
                    "conversation history unavailable"
                );
                Vec::new()
            }
        };
        let prior: Vec<&Message> = history
            .iter()
            .filter(|message| message.id != inbound.id)
            .collect();
        let skip = prior.len().saturating_sub(self.history_window);

        let mut messages = Vec::with_capacity(prior.len() + 2);
        messages.push(PromptMessage::system(system));
        messages.extend(
            prior
                .into_iter()
                .skip(skip)
                .map(|message| PromptMessage::new(message.sender.role(), message.content.clone())),
        );
        messages.push(PromptMessage::user(inbound.content.clone()));
        Ok(messages)
    }
}
