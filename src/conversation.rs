//! Conversation identity and session aggregation.
//!
//! A conversation is every message of a tenant sharing one session key. The
//! key comes from `conversation_context.session_id`; messages without one
//! become singleton conversations keyed by their own message id. The
//! conversation id is a UUIDv5 of (tenant, session key), so ingestion,
//! backfill and reports always agree on which conversation a message
//! belongs to.

use bigdecimal::{BigDecimal, Zero};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::models::{Conversation, ConversationMessage};

/// Prefix of the session key given to messages without a `session_id`.
pub const SINGLETON_SESSION_PREFIX: &str = "message:";

/// Namespace for conversation ids. Changing it re-keys every conversation.
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b8e_4d0a_4c55_9a3e_51f0_c2d7_8b19);

/// Session key for a message.
pub fn session_key(context: Option<&Value>, message_id: Uuid) -> String {
    context
        .and_then(|c| c.get("session_id"))
        .and_then(|v| match v {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("{}{}", SINGLETON_SESSION_PREFIX, message_id))
}

/// Stable conversation id for (tenant, session key).
pub fn conversation_id(tenant_id: Uuid, session_key: &str) -> Uuid {
    let name = format!("{}:{}", tenant_id, session_key);
    Uuid::new_v5(&CONVERSATION_NAMESPACE, name.as_bytes())
}

/// `duration_minutes` from a message context, accepting numbers or numeric strings.
pub fn context_duration_minutes(context: Option<&Value>) -> Option<i32> {
    let raw = context?.get("duration_minutes")?;
    let minutes = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !minutes.is_finite() || minutes < 0.0 || minutes > f64::from(i32::MAX) {
        return None;
    }
    Some(minutes.round() as i32)
}

/// What a conversation's messages say about its outcome.
///
/// Contradictory per-message outcomes are kept as `Conflicting`; no label is
/// picked on the caller's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeResolution {
    Unresolved,
    Resolved(String),
    Conflicting(Vec<String>),
}

impl OutcomeResolution {
    pub fn from_observed<I, S>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let distinct: BTreeSet<String> = outcomes
            .into_iter()
            .map(|o| o.as_ref().trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let mut labels: Vec<String> = distinct.into_iter().collect();
        match labels.len() {
            0 => OutcomeResolution::Unresolved,
            1 => OutcomeResolution::Resolved(labels.remove(0)),
            _ => OutcomeResolution::Conflicting(labels),
        }
    }

    pub fn is_conflicting(&self) -> bool {
        matches!(self, OutcomeResolution::Conflicting(_))
    }
}

impl Conversation {
    pub fn outcome(&self) -> OutcomeResolution {
        OutcomeResolution::from_observed(&self.observed_outcomes)
    }
}

/// Adds `outcome` to a sorted, distinct outcome list.
pub fn merge_outcome(observed: &mut Vec<String>, outcome: Option<&str>) {
    let Some(label) = outcome.map(str::trim).filter(|o| !o.is_empty()) else {
        return;
    };
    if let Err(pos) = observed.binary_search_by(|existing| existing.as_str().cmp(label)) {
        observed.insert(pos, label.to_string());
    }
}

/// Groups history rows into conversations.
///
/// Messages are grouped per (tenant, session key). Costs are summed, never
/// averaged. The result is ordered by `started_at`, then id.
pub fn aggregate_sessions(messages: &[ConversationMessage]) -> Vec<Conversation> {
    let mut ordered: Vec<&ConversationMessage> = messages.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let mut conversations: HashMap<Uuid, Conversation> = HashMap::new();

    for message in ordered {
        let key = session_key(message.conversation_context.as_ref(), message.id);
        let id = conversation_id(message.tenant_id, &key);

        let conversation = conversations.entry(id).or_insert_with(|| Conversation {
            id,
            tenant_id: message.tenant_id,
            session_key: key,
            user_id: Some(message.user_id),
            started_at: message.created_at,
            last_message_at: message.created_at,
            message_count: 0,
            user_message_count: 0,
            api_cost_usd: BigDecimal::zero(),
            processing_cost_usd: BigDecimal::zero(),
            duration_minutes: None,
            observed_outcomes: Vec::new(),
        });

        apply_message(conversation, message);
    }

    let mut result: Vec<Conversation> = conversations.into_values().collect();
    result.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
    result
}

/// Folds one message into a conversation's running totals.
pub fn apply_message(conversation: &mut Conversation, message: &ConversationMessage) {
    if message.created_at < conversation.started_at {
        conversation.started_at = message.created_at;
        conversation.user_id = Some(message.user_id);
    }
    if message.created_at > conversation.last_message_at {
        conversation.last_message_at = message.created_at;
    }

    conversation.message_count += 1;
    if message.is_from_user {
        conversation.user_message_count += 1;
    }
    if let Some(cost) = &message.api_cost_usd {
        conversation.api_cost_usd += cost;
    }
    if let Some(cost) = &message.processing_cost_usd {
        conversation.processing_cost_usd += cost;
    }

    let reported = context_duration_minutes(message.conversation_context.as_ref());
    conversation.duration_minutes = match (conversation.duration_minutes, reported) {
        (Some(current), Some(new)) => Some(current.max(new)),
        (current, new) => current.or(new),
    };

    merge_outcome(
        &mut conversation.observed_outcomes,
        message.conversation_outcome.as_deref(),
    );
}
