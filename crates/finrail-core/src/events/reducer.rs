//! Pure fold from event streams to aggregate state.
//!
//! Replay must be deterministic: the same event sequence always produces the
//! same state, so [`apply_event`] reads nothing but its arguments. No clock,
//! no randomness, no store access. Event types this build does not recognize
//! advance the version and change nothing else, which keeps old readers
//! compatible with newer writers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::record::{EventType, FinancialEvent};

/// Derived state of one aggregate, produced only by folding its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Aggregate type this state was folded for.
    pub aggregate_type: String,

    /// Aggregate identifier.
    pub aggregate_id: String,

    /// Version of the last event folded in; 0 for an empty stream.
    pub version: u64,

    /// Lifecycle status derived from the events seen so far.
    pub status: Option<String>,

    /// Accumulated aggregate fields.
    pub data: Map<String, Value>,
}

impl AggregateState {
    /// The state of an aggregate with no events.
    #[must_use]
    pub fn empty(aggregate_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            version: 0,
            status: None,
            data: Map::new(),
        }
    }

    /// Convenience accessor into the accumulated fields.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Folds one event into the aggregate state.
///
/// Payload objects are merged key-by-key into `data`, so later events
/// overwrite fields earlier events set and add fields they did not.
/// Balance-affecting wallet events additionally fold their `amount` into a
/// running `balance` field.
#[must_use]
pub fn apply_event(mut state: AggregateState, event: &FinancialEvent) -> AggregateState {
    state.version = event.version;

    match &event.event_type {
        EventType::InvestmentCreated => {
            merge_payload(&mut state.data, &event.payload);
            state.status = Some("active".to_string());
        },
        EventType::InvestmentMatured => {
            merge_payload(&mut state.data, &event.payload);
            state.status = Some("matured".to_string());
        },
        EventType::InvestmentCancelled => {
            merge_payload(&mut state.data, &event.payload);
            state.status = Some("cancelled".to_string());
        },
        EventType::FundsDeposited => {
            merge_payload(&mut state.data, &event.payload);
            adjust_balance(&mut state.data, &event.payload, 1.0);
        },
        EventType::FundsWithdrawn => {
            merge_payload(&mut state.data, &event.payload);
            adjust_balance(&mut state.data, &event.payload, -1.0);
        },
        EventType::RoiDistributed => {
            merge_payload(&mut state.data, &event.payload);
        },
        EventType::SecondarySaleCompleted => {
            merge_payload(&mut state.data, &event.payload);
            state.status = Some("transferred".to_string());
        },
        EventType::Other(_) => {
            // Unknown event type: pass state through unchanged.
        },
    }

    state
}

/// Replays a full event sequence from the empty state.
#[must_use]
pub fn replay(
    aggregate_type: &str,
    aggregate_id: &str,
    events: &[FinancialEvent],
) -> AggregateState {
    events.iter().fold(
        AggregateState::empty(aggregate_type, aggregate_id),
        apply_event,
    )
}

fn merge_payload(data: &mut Map<String, Value>, payload: &Value) {
    if let Value::Object(fields) = payload {
        for (key, value) in fields {
            // `amount` participates in balance folding for wallet events and
            // is still recorded verbatim here.
            data.insert(key.clone(), value.clone());
        }
    }
}

fn adjust_balance(data: &mut Map<String, Value>, payload: &Value, sign: f64) {
    let amount = payload.get("amount").and_then(Value::as_f64);
    if let Some(amount) = amount {
        let balance = data
            .get("balance")
            .and_then(Value::as_f64)
            .unwrap_or_default();
        let updated = sign.mul_add(amount, balance);
        if let Some(number) = serde_json::Number::from_f64(updated) {
            data.insert("balance".to_string(), Value::Number(number));
        }
    }
}
