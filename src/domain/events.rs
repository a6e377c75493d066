//! Economic events
//!
//! The envelope exchanged over the event bus. On the wire the payload is an
//! open JSON object; in memory it is decoded into a typed payload chosen by the
//! event's family. Fields a payload type does not know about are kept in its
//! `extensions` map, so decoding and re-encoding never loses data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::DomainError;
use super::taxonomy::{EventType, PayloadKind};

/// Wire form of an economic event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEconomicEvent {
    pub event_type: String,
    pub aggregate_id: String,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

/// Money movement: spend, revenue, royalty and ledger events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonetaryPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_delta: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// Campaign, round, commitment, allocation and settlement lifecycle events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecyclePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// App terms and royalty configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppTermsPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub royalty_bps: Option<u32>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// KPI and budget signals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformancePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// Attribution of conversions to campaigns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue_minor: Option<i64>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// Payload tagged by event family
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Monetary(MonetaryPayload),
    Lifecycle(LifecyclePayload),
    AppTerms(AppTermsPayload),
    Performance(PerformancePayload),
    Attribution(AttributionPayload),
}

impl EventPayload {
    /// Decode a raw payload object into the shape `event_type` carries.
    pub fn decode(event_type: EventType, payload: Value) -> Result<Self, DomainError> {
        let object = match payload {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(DomainError::malformed_payload(
                    event_type.as_str(),
                    format!("payload must be an object, got {}", json_kind(&other)),
                ))
            }
        };

        let malformed = |e: serde_json::Error| DomainError::malformed_payload(event_type.as_str(), e);

        Ok(match event_type.payload_kind() {
            PayloadKind::Monetary => {
                EventPayload::Monetary(serde_json::from_value(object).map_err(malformed)?)
            }
            PayloadKind::Lifecycle => {
                EventPayload::Lifecycle(serde_json::from_value(object).map_err(malformed)?)
            }
            PayloadKind::AppTerms => {
                EventPayload::AppTerms(serde_json::from_value(object).map_err(malformed)?)
            }
            PayloadKind::Performance => {
                EventPayload::Performance(serde_json::from_value(object).map_err(malformed)?)
            }
            PayloadKind::Attribution => {
                EventPayload::Attribution(serde_json::from_value(object).map_err(malformed)?)
            }
        })
    }

    /// Encode back into an open JSON object.
    pub fn to_value(&self) -> Value {
        let encoded = match self {
            EventPayload::Monetary(p) => serde_json::to_value(p),
            EventPayload::Lifecycle(p) => serde_json::to_value(p),
            EventPayload::AppTerms(p) => serde_json::to_value(p),
            EventPayload::Performance(p) => serde_json::to_value(p),
            EventPayload::Attribution(p) => serde_json::to_value(p),
        };
        encoded.unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A validated economic event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEconomicEvent", into = "RawEconomicEvent")]
pub struct EconomicEvent {
    pub event_type: EventType,
    pub aggregate_id: String,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EconomicEvent {
    /// Build an event occurring now from an open payload object.
    pub fn new(
        event_type: EventType,
        aggregate_id: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Result<Self, DomainError> {
        Self::try_from(RawEconomicEvent {
            event_type: event_type.as_str().to_string(),
            aggregate_id: aggregate_id.into(),
            correlation_id: correlation_id.into(),
            occurred_at: Utc::now(),
            payload,
        })
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// A caused event: same correlation id and occurrence time, payload
    /// carried over and re-decoded for the new event type.
    pub fn follow_on(
        &self,
        event_type: EventType,
        aggregate_id: impl Into<String>,
    ) -> Result<Self, DomainError> {
        Self::new(
            event_type,
            aggregate_id,
            self.correlation_id.clone(),
            self.payload.to_value(),
        )
        .map(|follow| follow.with_occurred_at(self.occurred_at))
    }

    pub fn monetary(&self) -> Option<&MonetaryPayload> {
        match &self.payload {
            EventPayload::Monetary(p) => Some(p),
            _ => None,
        }
    }

    pub fn lifecycle(&self) -> Option<&LifecyclePayload> {
        match &self.payload {
            EventPayload::Lifecycle(p) => Some(p),
            _ => None,
        }
    }

    /// Stable identity of this delivery, used to dedupe dead letters
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.aggregate_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.correlation_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.occurred_at.to_rfc3339().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn to_raw(&self) -> RawEconomicEvent {
        RawEconomicEvent {
            event_type: self.event_type.as_str().to_string(),
            aggregate_id: self.aggregate_id.clone(),
            correlation_id: self.correlation_id.clone(),
            occurred_at: self.occurred_at,
            payload: self.payload.to_value(),
        }
    }
}

impl TryFrom<RawEconomicEvent> for EconomicEvent {
    type Error = DomainError;

    fn try_from(raw: RawEconomicEvent) -> Result<Self, Self::Error> {
        let event_type: EventType = raw.event_type.parse()?;

        if raw.aggregate_id.trim().is_empty() {
            return Err(DomainError::MalformedEvent("aggregate_id is empty".into()));
        }
        if raw.correlation_id.trim().is_empty() {
            return Err(DomainError::MalformedEvent("correlation_id is empty".into()));
        }

        let payload = EventPayload::decode(event_type, raw.payload)?;

        Ok(Self {
            event_type,
            aggregate_id: raw.aggregate_id,
            correlation_id: raw.correlation_id,
            occurred_at: raw.occurred_at,
            payload,
        })
    }
}

impl From<EconomicEvent> for RawEconomicEvent {
    fn from(event: EconomicEvent) -> Self {
        event.to_raw()
    }
}
