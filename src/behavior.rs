//! Behavioral intervention engine.
//!
//! Snapshots are logged first, enriched with cart, currency and intervention
//! history, and handed to the completion backend together with the heuristic
//! thresholds. The backend's answer is parsed and clamped field by field; any
//! failure degrades to [`fallback_decision`] and is never surfaced to callers.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    completion::{CompletionService, PromptMessage},
    error::{Outcome, Result},
    platform::StoreContextProvider,
    prompting::{render_behavior_analysis_prompt, render_behavior_analyst_prompt, BehaviorAnalysisContext},
    store::BehaviorLog,
    types::{
        BehaviorData, BehaviorLogEntry, EnrichedBehavior, InterventionDecision, InterventionTiming,
        InterventionType,
    },
};

pub const INACTIVITY_THRESHOLD_SECS: u32 = 30;
pub const SCROLL_DEPTH_THRESHOLD_PCT: u32 = 70;
pub const MIN_SESSION_TIME_SECS: u32 = 10;
pub const HIGH_INTENT_CART_VALUE: f64 = 50.0;
pub const HISTORY_LIMIT: usize = 10;
/// A decision is shown only when its confidence is strictly above this.
pub const EMIT_CONFIDENCE_THRESHOLD: f64 = 0.7;
pub const FALLBACK_REASON: &str = "Failed to generate intervention strategy";

const MAX_SUGGESTED_MESSAGE_CHARS: usize = 500;
const DECISION_FIELDS: [&str; 7] = [
    "shouldIntervene",
    "confidence",
    "reason",
    "suggestedMessage",
    "interventionType",
    "priority",
    "timing",
];

static JSON_OBJECT: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").ok());

pub fn fallback_decision() -> InterventionDecision {
    InterventionDecision {
        should_intervene: false,
        confidence: 0.0,
        reason: FALLBACK_REASON.to_string(),
        suggested_message: None,
        intervention_type: None,
        priority: 1,
        timing: InterventionTiming::Delayed,
    }
}

/// The double gate: the model says yes and its confidence clears the bar.
pub fn should_emit(decision: &InterventionDecision) -> bool {
    decision.should_intervene && decision.confidence > EMIT_CONFIDENCE_THRESHOLD
}

pub const GENERIC_PROACTIVE_MESSAGE: &str = "Hi there! Let me know if you have any questions.";

/// Text carried by a `proactive_message`: the scorer's own wording, else a
/// default for its intervention type.
pub fn proactive_text(decision: &InterventionDecision) -> String {
    match (&decision.suggested_message, decision.intervention_type) {
        (Some(message), _) => message.clone(),
        (None, Some(kind)) => kind.default_message().to_string(),
        (None, None) => GENERIC_PROACTIVE_MESSAGE.to_string(),
    }
}

/// Finds the first JSON object in free-form model output.
fn extract_object(raw: &str) -> Option<Map<String, Value>> {
    if let Some(found) = JSON_OBJECT.as_ref().and_then(|re| re.find(raw)) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(found.as_str()) {
            return Some(map);
        }
    }
    // The greedy span can swallow trailing prose or a second object; try each
    // opening brace and take the first value that parses on its own.
    raw.match_indices('{').find_map(|(start, _)| {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(map))) => Some(map),
            _ => None,
        }
    })
}

fn coerce_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn coerce_number(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn validate_confidence(value: Option<&Value>) -> f64 {
    coerce_number(value).unwrap_or(0.0).clamp(0.0, 1.0)
}

fn validate_priority(value: Option<&Value>) -> u8 {
    coerce_number(value)
        .map(|p| p.round().clamp(1.0, 5.0) as u8)
        .unwrap_or(1)
}

fn validate_timing(value: Option<&Value>) -> InterventionTiming {
    match value.and_then(Value::as_str) {
        Some("immediate") => InterventionTiming::Immediate,
        _ => InterventionTiming::Delayed,
    }
}

fn validate_intervention_type(value: Option<&Value>) -> Option<InterventionType> {
    value.and_then(Value::as_str).and_then(InterventionType::parse)
}

fn validate_message(value: Option<&Value>) -> Option<String> {
    let message = value.and_then(Value::as_str)?.trim();
    if message.is_empty() {
        return None;
    }
    Some(message.chars().take(MAX_SUGGESTED_MESSAGE_CHARS).collect())
}

fn validate_reason(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Null) | None => "No reason provided".to_string(),
        Some(Value::String(_)) => "No reason provided".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Parses and clamps a decision. `None` when the text holds no usable object.
pub fn parse_decision(raw: &str) -> Option<InterventionDecision> {
    let object = extract_object(raw)?;
    if !DECISION_FIELDS.iter().any(|field| object.contains_key(*field)) {
        return None;
    }

    Some(InterventionDecision {
        should_intervene: coerce_bool(object.get("shouldIntervene")),
        confidence: validate_confidence(object.get("confidence")),
        reason: validate_reason(object.get("reason")),
        suggested_message: validate_message(object.get("suggestedMessage")),
        intervention_type: validate_intervention_type(object.get("interventionType")),
        priority: validate_priority(object.get("priority")),
        timing: validate_timing(object.get("timing")),
    })
}

/// Result of one analysis. `snapshot_id` is the log row the decision was attached to.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub snapshot_id: Option<i64>,
    pub decision: InterventionDecision,
    /// Why the fallback decision was used, if it was.
    pub degraded: Option<String>,
}

impl Analysis {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

pub struct BehavioralEngine {
    context: StoreContextProvider,
    completion: Arc<dyn CompletionService>,
    log: Arc<dyn BehaviorLog>,
}

impl BehavioralEngine {
    pub fn new(
        context: StoreContextProvider,
        completion: Arc<dyn CompletionService>,
        log: Arc<dyn BehaviorLog>,
    ) -> Self {
        Self {
            context,
            completion,
            log,
        }
    }

    pub async fn analyze(&self, visitor_id: &str, shop_id: i64, snapshot: &BehaviorData) -> Analysis {
        let snapshot_id = match self.log.log_snapshot(visitor_id, shop_id, snapshot).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(shop_id, visitor_id, error = %err, "failed to log behavior snapshot");
                None
            }
        };

        let outcome = match self.enrich(visitor_id, shop_id, snapshot, snapshot_id).await {
            Ok(enriched) => self.decide(&enriched).await,
            Err(err) => Outcome::Fatal(err),
        };
        let (decision, degraded) = match outcome {
            Outcome::Ok(decision) => (decision, None),
            Outcome::Degraded { value, reason } => (value, Some(reason)),
            Outcome::Fatal(err) => (fallback_decision(), Some(err.to_string())),
        };
        if let Some(reason) = &degraded {
            warn!(shop_id, visitor_id, %reason, "behavior analysis degraded to fallback");
        }

        if let Some(id) = snapshot_id {
            if let Err(err) = self.log.attach_decision(id, &decision).await {
                warn!(shop_id, visitor_id, snapshot_id = id, error = %err, "failed to attach decision");
            }
        }

        Analysis {
            snapshot_id,
            decision,
            degraded,
        }
    }

    pub async fn record_outcome(&self, snapshot_id: i64, successful: bool) -> Result<()> {
        self.log.record_outcome(snapshot_id, successful).await
    }

    async fn enrich(
        &self,
        visitor_id: &str,
        shop_id: i64,
        snapshot: &BehaviorData,
        snapshot_id: Option<i64>,
    ) -> Result<EnrichedBehavior> {
        let mut behavior = snapshot.clone();
        match self.context.platform().cart(visitor_id).await {
            Ok(Some(cart)) => behavior.cart_value = Some(cart.total_price),
            Ok(None) => {}
            Err(err) => warn!(shop_id, visitor_id, error = %err, "cart lookup failed"),
        }
        if behavior.cart_value.is_none() {
            behavior.cart_value = Some(0.0);
        }

        let settings = self.context.get_store_settings().await.into_result()?;

        let history = self
            .log
            .recent_snapshots(visitor_id, shop_id, snapshot_id, HISTORY_LIMIT)
            .await
            .unwrap_or_else(|err| {
                warn!(shop_id, visitor_id, error = %err, "failed to load intervention history");
                Vec::new()
            });

        Ok(EnrichedBehavior {
            behavior,
            currency: settings.currency,
            previous_interventions: history.len(),
            successful_interventions: count_successful(&history),
        })
    }

    async fn decide(&self, enriched: &EnrichedBehavior) -> Outcome<InterventionDecision> {
        let behavior = serde_json::to_string_pretty(enriched).unwrap_or_else(|_| "{}".to_string());
        let prompt = render_behavior_analysis_prompt(&BehaviorAnalysisContext {
            behavior: &behavior,
            currency: &enriched.currency,
            inactivity_threshold: INACTIVITY_THRESHOLD_SECS,
            scroll_depth_threshold: SCROLL_DEPTH_THRESHOLD_PCT,
            min_session_time: MIN_SESSION_TIME_SECS,
            high_intent_cart_value: HIGH_INTENT_CART_VALUE,
        });
        let messages = [
            PromptMessage::system(render_behavior_analyst_prompt()),
            PromptMessage::user(prompt),
        ];

        let raw = match self.completion.generate(&messages).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Outcome::degraded(fallback_decision(), "completion returned no content"),
            Err(err) => return Outcome::degraded(fallback_decision(), err.to_string()),
        };

        match parse_decision(&raw) {
            Some(decision) => {
                debug!(
                    should_intervene = decision.should_intervene,
                    confidence = decision.confidence,
                    "parsed intervention decision"
                );
                Outcome::Ok(decision)
            }
            None => Outcome::degraded(fallback_decision(), "no decision object in completion"),
        }
    }
}

fn count_successful(history: &[BehaviorLogEntry]) -> usize {
    history
        .iter()
        .filter(|entry| entry.successful == Some(true))
        .count()
}
