use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    error::{AppError, Result},
    types::{
        now_iso, BehaviorData, BehaviorLogEntry, Conversation, ConversationStatus,
        InterventionDecision, Message, NewConversation, NewMessage, SenderType, StoreConfig,
        StoreCredentials,
    },
};

/// Durable conversations, messages and the store configurations that gate connections.
///
/// Every write is a single-row insert or update; implementations must make those atomic.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_store_config(
        &self,
        shop_id: i64,
        platform: &str,
        api_key: &str,
    ) -> Result<Option<StoreConfig>>;

    async fn create_conversation(&self, conversation: NewConversation) -> Result<i64>;

    async fn get_conversation(&self, conversation_id: i64) -> Result<Option<Conversation>>;

    async fn touch_conversation(&self, conversation_id: i64) -> Result<()>;

    /// Moves an active conversation to `ended`. Ending twice is a no-op.
    async fn end_conversation(&self, conversation_id: i64) -> Result<()>;

    /// Fails with `NotFound` when the conversation does not exist.
    async fn append_message(&self, message: NewMessage) -> Result<Message>;

    async fn recent_messages(&self, conversation_id: i64, limit: usize) -> Result<Vec<Message>>;
}

/// Append-only log of behavior snapshots and the decisions attached to them.
#[async_trait]
pub trait BehaviorLog: Send + Sync {
    async fn log_snapshot(&self, visitor_id: &str, shop_id: i64, data: &BehaviorData)
        -> Result<i64>;

    async fn attach_decision(&self, snapshot_id: i64, decision: &InterventionDecision)
        -> Result<()>;

    /// Newest first, only rows older than `before_id` when given.
    async fn recent_snapshots(
        &self,
        visitor_id: &str,
        shop_id: i64,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BehaviorLogEntry>>;

    async fn record_outcome(&self, snapshot_id: i64, successful: bool) -> Result<()>;
}

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn conversation_from_row(row: &PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        shop_id: row.get("shop_id"),
        visitor_id: row.get("visitor_id"),
        status: ConversationStatus::parse(&row.get::<String, _>("status")),
        last_message_at: row.get("last_message_at"),
        ended_at: row.get("ended_at"),
        source: row.get("source"),
        url: row.get("url"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}

fn message_from_row(row: &PgRow) -> Message {
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        content: row.get("content"),
        sender: SenderType::parse(&row.get::<String, _>("sender_type")),
        message_type: row.get("type"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn find_store_config(
        &self,
        shop_id: i64,
        platform: &str,
        api_key: &str,
    ) -> Result<Option<StoreConfig>> {
        let row = sqlx::query(
            "SELECT shop_id, platform, credentials FROM store_configurations \
             WHERE shop_id = $1 AND platform = $2 AND api_key = $3 LIMIT 1",
        )
        .bind(shop_id)
        .bind(platform)
        .bind(api_key)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| {
            let credentials = row
                .get::<Option<Value>, _>("credentials")
                .and_then(|value| serde_json::from_value::<StoreCredentials>(value).ok())
                .unwrap_or_default();
            StoreConfig {
                shop_id: row.get("shop_id"),
                platform: row.get("platform"),
                credentials,
            }
        }))
    }

    async fn create_conversation(&self, conversation: NewConversation) -> Result<i64> {
        let now = now_iso();
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO conversations (
                shop_id, visitor_id, status, last_message_at, source, url, metadata, created_at, updated_at
            ) VALUES ($1,$2,'active',$3,$4,$5,$6,$3,$3)
            RETURNING id
            "#,
        )
        .bind(conversation.shop_id)
        .bind(&conversation.visitor_id)
        .bind(&now)
        .bind(&conversation.source)
        .bind(&conversation.url)
        .bind(&conversation.metadata)
        .fetch_one(&self.db)
        .await?;
        Ok(id)
    }

    async fn get_conversation(&self, conversation_id: i64) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, shop_id, visitor_id, status, last_message_at, ended_at, source, url, metadata, created_at \
             FROM conversations WHERE id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn touch_conversation(&self, conversation_id: i64) -> Result<()> {
        let now = now_iso();
        sqlx::query("UPDATE conversations SET last_message_at = $1, updated_at = $1 WHERE id = $2")
            .bind(&now)
            .bind(conversation_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn end_conversation(&self, conversation_id: i64) -> Result<()> {
        let now = now_iso();
        sqlx::query(
            "UPDATE conversations SET status = 'ended', ended_at = $1, updated_at = $1 \
             WHERE id = $2 AND status = 'active'",
        )
        .bind(&now)
        .bind(conversation_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM conversations WHERE id = $1")
            .bind(message.conversation_id)
            .fetch_one(&self.db)
            .await?
            > 0;
        if !exists {
            return Err(AppError::not_found("Conversation not found"));
        }

        let now = now_iso();
        let row = sqlx::query(
            r#"
            INSERT INTO messages (conversation_id, content, sender_type, type, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$5)
            RETURNING id, conversation_id, content, sender_type, type, created_at
            "#,
        )
        .bind(message.conversation_id)
        .bind(&message.content)
        .bind(message.sender.as_str())
        .bind(&message.message_type)
        .bind(&now)
        .fetch_one(&self.db)
        .await?;
        Ok(message_from_row(&row))
    }

    async fn recent_messages(&self, conversation_id: i64, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, content, sender_type, type, created_at FROM messages \
             WHERE conversation_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;
        let mut messages: Vec<Message> = rows.iter().map(message_from_row).collect();
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl BehaviorLog for PgStore {
    async fn log_snapshot(
        &self,
        visitor_id: &str,
        shop_id: i64,
        data: &BehaviorData,
    ) -> Result<i64> {
        let behavior = serde_json::to_value(data)
            .map_err(|err| AppError::internal(format!("snapshot encode failed: {err}")))?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO behavior_logs (visitor_id, shop_id, behavior_data, created_at) \
             VALUES ($1,$2,$3,$4) RETURNING id",
        )
        .bind(visitor_id)
        .bind(shop_id)
        .bind(&behavior)
        .bind(now_iso())
        .fetch_one(&self.db)
        .await?;
        Ok(id)
    }

    async fn attach_decision(
        &self,
        snapshot_id: i64,
        decision: &InterventionDecision,
    ) -> Result<()> {
        let intervention = serde_json::to_value(decision)
            .map_err(|err| AppError::internal(format!("decision encode failed: {err}")))?;
        let result = sqlx::query("UPDATE behavior_logs SET intervention = $1 WHERE id = $2")
            .bind(&intervention)
            .bind(snapshot_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("behavior log {snapshot_id} not found")));
        }
        Ok(())
    }

    async fn recent_snapshots(
        &self,
        visitor_id: &str,
        shop_id: i64,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BehaviorLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, visitor_id, shop_id, behavior_data, intervention, successful, created_at \
             FROM behavior_logs \
             WHERE visitor_id = $1 AND shop_id = $2 AND ($3::BIGINT IS NULL OR id < $3) \
             ORDER BY id DESC LIMIT $4",
        )
        .bind(visitor_id)
        .bind(shop_id)
        .bind(before_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .iter()
            .map(|row| BehaviorLogEntry {
                id: row.get("id"),
                visitor_id: row.get("visitor_id"),
                shop_id: row.get("shop_id"),
                behavior: row.get("behavior_data"),
                intervention: row
                    .get::<Option<Value>, _>("intervention")
                    .and_then(|value| serde_json::from_value(value).ok()),
                successful: row.get("successful"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn record_outcome(&self, snapshot_id: i64, successful: bool) -> Result<()> {
        sqlx::query("UPDATE behavior_logs SET successful = $1 WHERE id = $2")
            .bind(successful)
            .bind(snapshot_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
