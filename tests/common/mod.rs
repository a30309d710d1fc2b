#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{json, Value};
use storefront_assistant::{
    app::AppState,
    auth::Handshake,
    completion::{CompletionService, PromptMessage},
    connection::Connection,
    error::{AppError, Result},
    platform::{PlatformFactory, StorePlatform},
    store::{BehaviorLog, ConversationStore},
    types::{
        now_iso, BehaviorData, BehaviorLogEntry, Cart, Conversation, ConversationStatus,
        InterventionDecision, Message, NewConversation, NewMessage, Product, StoreConfig,
        StoreCredentials, StoreSettings,
    },
};
use tokio::sync::mpsc;

pub const SHOP_ID: i64 = 42;
pub const API_KEY: &str = "whrf_pk_test_key";

#[derive(Default)]
struct Tables {
    configs: Vec<(i64, String, String)>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    snapshots: Vec<BehaviorLogEntry>,
}

/// In-memory stand-in for Postgres, implementing both storage traits.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    pub fail_appends: Mutex<bool>,
}

impl MemoryStore {
    pub fn with_store(shop_id: i64, platform: &str, api_key: &str) -> Arc<Self> {
        let store = Self::default();
        store
            .tables
            .lock()
            .unwrap()
            .configs
            .push((shop_id, platform.to_string(), api_key.to_string()));
        Arc::new(store)
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.tables.lock().unwrap().conversations.clone()
    }

    pub fn messages(&self, conversation_id: i64) -> Vec<Message> {
        self.tables
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn snapshots(&self) -> Vec<BehaviorLogEntry> {
        self.tables.lock().unwrap().snapshots.clone()
    }

    pub fn insert_conversation(&self, shop_id: i64, status: ConversationStatus) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.conversations.len() as i64 + 1;
        tables.conversations.push(Conversation {
            id,
            shop_id,
            visitor_id: "seeded".to_string(),
            status,
            last_message_at: now_iso(),
            ended_at: None,
            source: Some("chat_widget".to_string()),
            url: None,
            metadata: None,
            created_at: now_iso(),
        });
        id
    }

    pub fn insert_snapshot(&self, visitor_id: &str, shop_id: i64, successful: Option<bool>) -> i64 {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.snapshots.len() as i64 + 1;
        tables.snapshots.push(BehaviorLogEntry {
            id,
            visitor_id: visitor_id.to_string(),
            shop_id,
            behavior: json!({}),
            intervention: None,
            successful,
            created_at: now_iso(),
        });
        id
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_store_config(
        &self,
        shop_id: i64,
        platform: &str,
        api_key: &str,
    ) -> Result<Option<StoreConfig>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .configs
            .iter()
            .find(|(s, p, k)| *s == shop_id && p == platform && k == api_key)
            .map(|(shop_id, platform, _)| StoreConfig {
                shop_id: *shop_id,
                platform: platform.clone(),
                credentials: StoreCredentials {
                    store_name: "demo.myshopify.com".to_string(),
                    access_token: "shpat_test".to_string(),
                },
            }))
    }

    async fn create_conversation(&self, conversation: NewConversation) -> Result<i64> {
        let mut tables = self.tables.lock().unwrap();
        let id = tables.conversations.len() as i64 + 1;
        tables.conversations.push(Conversation {
            id,
            shop_id: conversation.shop_id,
            visitor_id: conversation.visitor_id,
            status: ConversationStatus::Active,
            last_message_at: now_iso(),
            ended_at: None,
            source: Some(conversation.source),
            url: conversation.url,
            metadata: conversation.metadata,
            created_at: now_iso(),
        });
        Ok(id)
    }

    async fn get_conversation(&self, conversation_id: i64) -> Result<Option<Conversation>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned())
    }

    async fn touch_conversation(&self, conversation_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(c) = tables.conversations.iter_mut().find(|c| c.id == conversation_id) {
            c.last_message_at = now_iso();
        }
        Ok(())
    }

    async fn end_conversation(&self, conversation_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(c) = tables
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id && c.status == ConversationStatus::Active)
        {
            c.status = ConversationStatus::Ended;
            c.ended_at = Some(now_iso());
        }
        Ok(())
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        if *self.fail_appends.lock().unwrap() {
            return Err(AppError::database("connection reset by peer"));
        }
        let mut tables = self.tables.lock().unwrap();
        if !tables
            .conversations
            .iter()
            .any(|c| c.id == message.conversation_id)
        {
            return Err(AppError::not_found("Conversation not found"));
        }
        let stored = Message {
            id: tables.messages.len() as i64 + 1,
            conversation_id: message.conversation_id,
            content: message.content,
            sender: message.sender,
            message_type: message.message_type,
            created_at: now_iso(),
        };
        tables.messages.push(stored.clone());
        Ok(stored)
    }

    async fn recent_messages(&self, conversation_id: i64, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages(conversation_id);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }
}

#[async_trait]
impl BehaviorLog for MemoryStore {
    async fn log_snapshot(&self, visitor_id: &str, shop_id: i64, data: &BehaviorData) -> Result<i64> {
        let id = self.insert_snapshot(visitor_id, shop_id, None);
        let mut tables = self.tables.lock().unwrap();
        if let Some(row) = tables.snapshots.iter_mut().find(|row| row.id == id) {
            row.behavior = serde_json::to_value(data)?;
        }
        Ok(id)
    }

    async fn attach_decision(&self, snapshot_id: i64, decision: &InterventionDecision) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .snapshots
            .iter_mut()
            .find(|row| row.id == snapshot_id)
            .ok_or_else(|| AppError::not_found("behavior log not found"))?;
        row.intervention = Some(decision.clone());
        Ok(())
    }

    async fn recent_snapshots(
        &self,
        visitor_id: &str,
        shop_id: i64,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<BehaviorLogEntry>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<BehaviorLogEntry> = tables
            .snapshots
            .iter()
            .filter(|row| row.visitor_id == visitor_id && row.shop_id == shop_id)
            .filter(|row| before_id.map_or(true, |before| row.id < before))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn record_outcome(&self, snapshot_id: i64, successful: bool) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(row) = tables.snapshots.iter_mut().find(|row| row.id == snapshot_id) {
            row.successful = Some(successful);
        }
        Ok(())
    }
}

/// Scripted completion backend. Chat replies and behavior decisions are
/// scripted separately, keyed off the analyst system prompt.
#[derive(Default)]
pub struct FakeCompletion {
    replies: Mutex<VecDeque<Result<Option<String>>>>,
    decisions: Mutex<VecDeque<Result<Option<String>>>>,
    pub requests: Mutex<Vec<Vec<PromptMessage>>>,
}

impl FakeCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, response: Result<Option<String>>) {
        self.replies.lock().unwrap().push_back(response);
    }

    pub fn decide(&self, response: Result<Option<String>>) {
        self.decisions.lock().unwrap().push_back(response);
    }

    pub fn decide_json(&self, value: Value) {
        self.decide(Ok(Some(value.to_string())));
    }

    pub fn chat_requests(&self) -> Vec<Vec<PromptMessage>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|messages| !is_analysis(messages))
            .cloned()
            .collect()
    }

    pub fn analysis_requests(&self) -> Vec<Vec<PromptMessage>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|messages| is_analysis(messages))
            .cloned()
            .collect()
    }
}

fn is_analysis(messages: &[PromptMessage]) -> bool {
    messages
        .first()
        .is_some_and(|m| m.content.contains("behavioral analyst"))
}

#[async_trait]
impl CompletionService for FakeCompletion {
    async fn generate(&self, messages: &[PromptMessage]) -> Result<Option<String>> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let queue = if is_analysis(messages) {
            &self.decisions
        } else {
            &self.replies
        };
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Some("Happy to help!".to_string())))
    }
}

#[derive(Default)]
pub struct FakePlatform {
    pub cart: Mutex<Option<Cart>>,
    pub settings_fail: Mutex<bool>,
    pub credentials_revoked: Mutex<bool>,
}

impl FakePlatform {
    fn check_credentials(&self) -> Result<()> {
        if *self.credentials_revoked.lock().unwrap() {
            return Err(AppError::unauthorized("Store platform credentials were rejected"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorePlatform for FakePlatform {
    async fn store_settings(&self) -> Result<StoreSettings> {
        self.check_credentials()?;
        if *self.settings_fail.lock().unwrap() {
            return Err(AppError::upstream("shop.json returned 503"));
        }
        Ok(StoreSettings {
            currency: "EUR".to_string(),
            language: "en".to_string(),
            name: "Linen & Co".to_string(),
            support_email: "help@linen.example".to_string(),
            custom_domain: None,
        })
    }

    async fn products(&self, _limit: usize) -> Result<Vec<Product>> {
        self.check_credentials()?;
        Ok(vec![Product {
            id: "1".to_string(),
            title: "Linen Shirt".to_string(),
            description: "Breathable linen shirt".to_string(),
            price: 59.0,
            compare_at_price: None,
            tags: vec!["shirts".to_string()],
            url: "/products/linen-shirt".to_string(),
            variants: Vec::new(),
        }])
    }

    async fn cart(&self, _visitor_id: &str) -> Result<Option<Cart>> {
        Ok(self.cart.lock().unwrap().clone())
    }
}

pub struct FakePlatforms {
    pub platform: Arc<FakePlatform>,
}

impl PlatformFactory for FakePlatforms {
    fn for_store(&self, config: &StoreConfig) -> Result<Arc<dyn StorePlatform>> {
        if config.platform != "shopify" {
            return Err(AppError::unauthorized(format!(
                "Unsupported platform: {}",
                config.platform
            )));
        }
        Ok(self.platform.clone())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub completion: Arc<FakeCompletion>,
    pub platform: Arc<FakePlatform>,
    pub state: Arc<AppState>,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryStore::with_store(SHOP_ID, "shopify", API_KEY);
        let completion = FakeCompletion::new();
        let platform = Arc::new(FakePlatform::default());
        let state = Arc::new(AppState::new(
            store.clone(),
            store.clone(),
            completion.clone(),
            Arc::new(FakePlatforms {
                platform: platform.clone(),
            }),
            "whrf_pk_",
            10,
        ));
        Self {
            store,
            completion,
            platform,
            state,
        }
    }

    pub async fn connect(&self) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(self.state.clone(), tx).await;
        Client { connection, rx }
    }

    /// A connection that has completed the handshake, with `services_ready` consumed.
    pub async fn ready_client(&self, visitor_id: Option<&str>) -> Client {
        let mut client = self.connect().await;
        client
            .connection
            .authenticate(&handshake(SHOP_ID, API_KEY, visitor_id))
            .await
            .expect("handshake accepted");
        let frames = client.frames();
        assert_eq!(frames[0]["event"], "services_ready");
        client
    }
}

pub struct Client {
    pub connection: Connection,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl Client {
    pub async fn send(&mut self, event: &str, data: Value) -> std::ops::ControlFlow<()> {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.connection.handle_text(&frame).await
    }

    /// Drains every frame emitted so far.
    pub fn frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    pub fn events(&mut self) -> Vec<String> {
        self.frames()
            .into_iter()
            .map(|frame| frame["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

pub fn handshake(shop_id: i64, api_key: &str, visitor_id: Option<&str>) -> Handshake {
    Handshake {
        shop_id: Some(shop_id.to_string()),
        platform: Some("shopify".to_string()),
        api_key: Some(api_key.to_string()),
        visitor_id: visitor_id.map(str::to_string),
    }
}

pub fn behavior(cart_value: Option<f64>) -> Value {
    let mut payload = json!({
        "timeOnPage": 95,
        "scrollDepth": 82,
        "mouseMovements": 140,
        "pageInactivity": 41,
        "pageViews": 5,
        "previousPages": ["/", "/collections/shirts"],
        "productViews": 3,
        "exitIntent": true,
        "currentPage": "/products/linen-shirt",
        "deviceType": "desktop",
        "sessionDuration": 420
    });
    if let Some(cart_value) = cart_value {
        payload["cartValue"] = json!(cart_value);
    }
    payload
}

pub fn decision(should_intervene: bool, confidence: f64) -> Value {
    json!({
        "shouldIntervene": should_intervene,
        "confidence": confidence,
        "reason": "Idle on a product page with exit intent",
        "suggestedMessage": "Need help choosing a size?",
        "interventionType": "help_offer",
        "priority": 3,
        "timing": "immediate"
    })
}
