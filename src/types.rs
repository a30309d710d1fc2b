use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

/// Fixed-width RFC 3339 so that text ordering in the database is time ordering.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Ended,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "ended" {
            Self::Ended
        } else {
            Self::Active
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub shop_id: i64,
    pub visitor_id: String,
    pub status: ConversationStatus,
    pub last_message_at: String,
    pub ended_at: Option<String>,
    pub source: Option<String>,
    pub url: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub shop_id: i64,
    pub visitor_id: String,
    pub source: String,
    pub url: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Assistant,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "assistant" {
            Self::Assistant
        } else {
            Self::User
        }
    }

    /// Role tag understood by the completion backend.
    pub fn role(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub content: String,
    pub sender: SenderType,
    #[serde(rename = "type")]
    pub message_type: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub content: String,
    pub sender: SenderType,
    pub message_type: String,
}

impl NewMessage {
    pub fn text(conversation_id: i64, sender: SenderType, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            sender,
            message_type: "text".to_string(),
        }
    }
}

/// Row of `store_configurations`, the credentials a storefront installs the widget with.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub shop_id: i64,
    pub platform: String,
    pub credentials: StoreCredentials,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCredentials {
    #[serde(default)]
    pub store_name: String,
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSettings {
    pub currency: String,
    pub language: String,
    pub name: String,
    pub support_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            language: "en".to_string(),
            name: "Store".to_string(),
            support_email: String::new(),
            custom_domain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compare_at_price: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub url: String,
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductVariant {
    pub id: String,
    pub title: String,
    pub price: f64,
    #[serde(default)]
    pub sku: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub id: String,
    pub total_price: f64,
    pub currency: String,
    pub item_count: u32,
}

/// One snapshot of passive telemetry reported by the storefront widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorData {
    pub time_on_page: f64,
    pub scroll_depth: f64,
    pub mouse_movements: u32,
    pub page_inactivity: f64,
    pub page_views: u32,
    #[serde(default)]
    pub previous_pages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cart_value: Option<f64>,
    pub product_views: u32,
    pub exit_intent: bool,
    pub current_page: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub session_duration: f64,
}

impl BehaviorData {
    pub fn validate(&self) -> Result<()> {
        let seconds = [
            ("timeOnPage", self.time_on_page),
            ("pageInactivity", self.page_inactivity),
            ("sessionDuration", self.session_duration),
        ];
        for (field, value) in seconds {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::validation(format!(
                    "{field} must be a non-negative number"
                )));
            }
        }
        if !self.scroll_depth.is_finite() || !(0.0..=100.0).contains(&self.scroll_depth) {
            return Err(AppError::validation("scrollDepth must be between 0 and 100"));
        }
        if let Some(cart_value) = self.cart_value {
            if !cart_value.is_finite() || cart_value < 0.0 {
                return Err(AppError::validation("cartValue must be a non-negative number"));
            }
        }
        Ok(())
    }
}

/// Snapshot plus the context the engine adds before asking for a decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedBehavior {
    #[serde(flatten)]
    pub behavior: BehaviorData,
    pub currency: String,
    pub previous_interventions: usize,
    pub successful_interventions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    Discount,
    ProductRecommendation,
    HelpOffer,
    CartReminder,
    EmailCollection,
}

impl InterventionType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "discount" => Some(Self::Discount),
            "product_recommendation" => Some(Self::ProductRecommendation),
            "help_offer" => Some(Self::HelpOffer),
            "cart_reminder" => Some(Self::CartReminder),
            "email_collection" => Some(Self::EmailCollection),
            _ => None,
        }
    }

    /// Shown when the scorer chose a type but wrote no message.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Discount => "We have a special offer for you today. Want to hear about it?",
            Self::ProductRecommendation => "Can I suggest a few products you might like?",
            Self::HelpOffer => "Need a hand finding something? I'm here to help.",
            Self::CartReminder => "You still have items in your cart. Any questions before checkout?",
            Self::EmailCollection => "Want updates on new arrivals and offers? Share your email with us.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionTiming {
    Immediate,
    Delayed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterventionDecision {
    pub should_intervene: bool,
    pub confidence: f64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_message: Option<String>,
    pub intervention_type: Option<InterventionType>,
    pub priority: u8,
    pub timing: InterventionTiming,
}

#[derive(Debug, Clone)]
pub struct BehaviorLogEntry {
    pub id: i64,
    pub visitor_id: String,
    pub shop_id: i64,
    pub behavior: Value,
    pub intervention: Option<InterventionDecision>,
    pub successful: Option<bool>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub visitor_id: String,
    pub shop_id: i64,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
}

/// Free-form context the widget sends on `session_init`.
pub type SessionMetadata = Map<String, Value>;
