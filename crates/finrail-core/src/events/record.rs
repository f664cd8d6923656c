//! Event record types for the financial event store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain event types recognized by the store.
///
/// The set is open: types this build does not know arrive as
/// [`EventType::Other`] and flow through storage and replay untouched, so a
/// newer writer never breaks an older reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// An investment was created.
    InvestmentCreated,
    /// An investment reached maturity.
    InvestmentMatured,
    /// An investment was cancelled (compensating event).
    InvestmentCancelled,
    /// Funds were deposited into a wallet.
    FundsDeposited,
    /// Funds were withdrawn from a wallet.
    FundsWithdrawn,
    /// Returns were distributed to investors.
    RoiDistributed,
    /// A secondary-market sale settled.
    SecondarySaleCompleted,
    /// Any event type this build does not recognize.
    Other(String),
}

impl EventType {
    /// Canonical string form, as stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvestmentCreated => "INVESTMENT_CREATED",
            Self::InvestmentMatured => "INVESTMENT_MATURED",
            Self::InvestmentCancelled => "INVESTMENT_CANCELLED",
            Self::FundsDeposited => "FUNDS_DEPOSITED",
            Self::FundsWithdrawn => "FUNDS_WITHDRAWN",
            Self::RoiDistributed => "ROI_DISTRIBUTED",
            Self::SecondarySaleCompleted => "SECONDARY_SALE_COMPLETED",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "INVESTMENT_CREATED" => Self::InvestmentCreated,
            "INVESTMENT_MATURED" => Self::InvestmentMatured,
            "INVESTMENT_CANCELLED" => Self::InvestmentCancelled,
            "FUNDS_DEPOSITED" => Self::FundsDeposited,
            "FUNDS_WITHDRAWN" => Self::FundsWithdrawn,
            "ROI_DISTRIBUTED" => Self::RoiDistributed,
            "SECONDARY_SALE_COMPLETED" => Self::SecondarySaleCompleted,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

/// A stored, immutable financial event.
///
/// Versions are scoped to `(aggregate_type, aggregate_id)` and form a
/// gapless sequence starting at 1. Events are never updated or deleted;
/// corrections are new compensating events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct FinancialEvent {
    /// Globally unique event identifier.
    pub id: String,

    /// Domain event type.
    pub event_type: EventType,

    /// Aggregate type, e.g. `"investment"` or `"wallet"`.
    pub aggregate_type: String,

    /// Aggregate identifier within its type.
    pub aggregate_id: String,

    /// User on whose behalf the event was produced, if any.
    pub user_id: Option<String>,

    /// Structured event payload.
    pub payload: Value,

    /// Structured metadata (correlation ids, request context).
    pub metadata: Value,

    /// Version within the aggregate's stream, starting at 1.
    pub version: u64,

    /// When the event was durably recorded.
    pub recorded_at: DateTime<Utc>,
}

/// An event awaiting append: everything the caller supplies, nothing the
/// store assigns.
#[derive(Debug, Clone)]
pub struct EventDraft {
    /// Domain event type.
    pub event_type: EventType,

    /// Structured event payload.
    pub payload: Value,

    /// User on whose behalf the event was produced, if any.
    pub user_id: Option<String>,

    /// Structured metadata.
    pub metadata: Value,
}

impl EventDraft {
    /// Creates a draft with empty metadata and no user.
    #[must_use]
    pub fn new(event_type: impl Into<EventType>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            user_id: None,
            metadata: Value::Null,
        }
    }

    /// Attributes the event to a user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attaches structured metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}
