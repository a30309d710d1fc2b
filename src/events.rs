use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{AppError, Result},
    types::{
        BehaviorData, InterventionTiming, InterventionType, PresenceEntry, PresenceStatus,
        SessionMetadata,
    },
};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default = "default_version")]
    pub v: u32,
    #[serde(default)]
    pub data: Value,
}

fn default_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInitPayload {
    pub visitor_id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub shop_id: Option<i64>,
    /// Existing conversation the widget wants to continue.
    #[serde(default)]
    pub conversation_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub shop_id: Option<i64>,
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<SessionMetadata>,
}

impl MessagePayload {
    /// The widget sends the conversation id back as `sessionId`, stringly typed.
    pub fn conversation_hint(&self) -> Result<Option<i64>> {
        match self.session_id.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|_| AppError::validation("Invalid conversation ID")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub is_typing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresencePayload {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterventionFeedbackPayload {
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionInit(SessionInitPayload),
    Message(MessagePayload),
    BehaviorUpdate(Box<BehaviorData>),
    Typing(TypingPayload),
    Presence(PresencePayload),
    InterventionFeedback(InterventionFeedbackPayload),
    EndSession,
    Unknown(String),
}

impl ClientEvent {
    /// Validates the envelope and the payload schema for its event name.
    pub fn parse(text: &str) -> Result<Self> {
        let envelope = serde_json::from_str::<EventEnvelopeIn>(text)?;
        if envelope.v != SCHEMA_VERSION {
            return Err(AppError::validation(format!(
                "unsupported event schema version {}",
                envelope.v
            )));
        }

        let event = match envelope.event.as_str() {
            "session_init" => Self::SessionInit(payload(envelope.data)?),
            "message" => Self::Message(payload(envelope.data)?),
            "behavior_update" => {
                let data: BehaviorData = payload(envelope.data)?;
                data.validate()?;
                Self::BehaviorUpdate(Box::new(data))
            }
            "typing" => Self::Typing(payload(envelope.data)?),
            "presence" => Self::Presence(payload(envelope.data)?),
            "intervention_feedback" => Self::InterventionFeedback(payload(envelope.data)?),
            "end_session" => Self::EndSession,
            other => Self::Unknown(other.to_string()),
        };
        Ok(event)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::SessionInit(_) => "session_init",
            Self::Message(_) => "message",
            Self::BehaviorUpdate(_) => "behavior_update",
            Self::Typing(_) => "typing",
            Self::Presence(_) => "presence",
            Self::InterventionFeedback(_) => "intervention_feedback",
            Self::EndSession => "end_session",
            Self::Unknown(name) => name,
        }
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T> {
    Ok(serde_json::from_value(data)?)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ServicesReady {
        status: &'static str,
    },
    ServicesStatus {
        status: &'static str,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ConversationCreated {
        conversation_id: i64,
    },
    MessageResponse {
        id: i64,
        content: String,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        is_typing: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<i64>,
    },
    ProactiveMessage {
        message: String,
        #[serde(rename = "type")]
        intervention_type: Option<InterventionType>,
        timing: InterventionTiming,
    },
    Presence(PresenceEntry),
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        conversation_id: Option<i64>,
    },
    Error {
        message: String,
        code: u16,
    },
}

impl ServerEvent {
    pub fn error(err: &AppError) -> Self {
        Self::Error {
            message: err.client_message(),
            code: err.code(),
        }
    }

    pub fn typing(is_typing: bool, session_id: Option<i64>) -> Self {
        Self::Typing {
            is_typing,
            session_id,
        }
    }

    pub fn to_frame(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}
