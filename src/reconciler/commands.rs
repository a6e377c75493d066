//! Reconciler inputs
//!
//! Payment-provider webhooks and the subset of economic events that move
//! money are both reduced to a [`ReconciliationCommand`]. Amounts are the
//! signed balance effect in minor units: spends and corrections arrive
//! negative, revenue positive.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AmountDelta, DomainError, EconomicEvent, EventType};
use crate::wallet::WalletTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookKind {
    #[serde(rename = "checkout.session.completed")]
    CheckoutSessionCompleted,
    #[serde(rename = "payment_intent.succeeded")]
    PaymentIntentSucceeded,
    #[serde(rename = "payment_intent.payment_failed")]
    PaymentIntentFailed,
}

impl WebhookKind {
    pub fn is_success(&self) -> bool {
        !matches!(self, WebhookKind::PaymentIntentFailed)
    }
}

/// Provider webhook after signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentWebhook {
    #[serde(rename = "type")]
    pub kind: WebhookKind,
    pub payment_intent_id: String,
    /// Settled amount; defaults to the amount recorded on the pending transaction
    #[serde(default)]
    pub amount_delta: Option<i64>,
    /// Skips the global intent lookup when present
    #[serde(default)]
    pub wallet_id: Option<Uuid>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl PaymentWebhook {
    pub fn validate(&self) -> Result<Option<AmountDelta>, DomainError> {
        if self.payment_intent_id.trim().is_empty() {
            return Err(DomainError::InvalidRequest("payment_intent_id is empty".into()));
        }
        Ok(self.amount_delta.map(AmountDelta::new).transpose()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    /// Append a pending transaction; an existing one is fine
    EnsurePending,
    /// Settle a transaction that must already exist
    Settle,
    /// Append if missing, then settle
    EnsureAndSettle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationCommand {
    pub action: CommandAction,
    pub source: EventType,
    pub wallet_id: Option<Uuid>,
    pub payment_intent_id: String,
    pub amount_delta: Option<AmountDelta>,
    /// Refunds and chargebacks: the ledger entry is a reversal
    pub correction: bool,
    /// Intent of the transaction a correction reverses
    pub reverses_intent: Option<String>,
    pub correlation_id: String,
}

impl ReconciliationCommand {
    /// Map an economic event onto a command. Only money-moving spend and
    /// revenue events are accepted.
    pub fn from_event(event: &EconomicEvent) -> Result<Self, DomainError> {
        let (action, correction) = match event.event_type {
            EventType::SpendAuthorized => (CommandAction::EnsurePending, false),
            EventType::SpendExecuted => (CommandAction::Settle, false),
            EventType::InvoicePaid => (CommandAction::EnsureAndSettle, false),
            EventType::SpendRefunded | EventType::RefundIssued | EventType::Chargeback => {
                (CommandAction::EnsureAndSettle, true)
            }
            other => {
                return Err(DomainError::InvalidRequest(format!(
                    "{} is not a reconciliation input",
                    other
                )))
            }
        };

        let type_name = event.event_type.as_str();
        let payload = event
            .monetary()
            .ok_or_else(|| DomainError::malformed_payload(type_name, "expected a monetary payload"))?;

        let intent = match &payload.payment_intent_id {
            Some(id) if id.trim().is_empty() => {
                return Err(DomainError::malformed_payload(type_name, "payment_intent_id is empty"))
            }
            other => other.clone(),
        };

        // Corrections never share a key with the transaction they correct. A
        // named intent is the original being reversed.
        let (payment_intent_id, reverses_intent) = match intent {
            Some(id) if correction => {
                (format!("{}:{}:{}", id, type_name, event.correlation_id), Some(id))
            }
            Some(id) => (id, None),
            None if correction => (format!("{}:{}", event.correlation_id, type_name), None),
            None => (event.correlation_id.clone(), None),
        };

        let amount_delta = payload.amount_delta.map(AmountDelta::new).transpose()?;

        if action != CommandAction::Settle {
            if payload.wallet_id.is_none() {
                return Err(DomainError::missing_field(type_name, "wallet_id"));
            }
            if amount_delta.is_none() {
                return Err(DomainError::missing_field(type_name, "amount_delta"));
            }
        }

        Ok(Self {
            action,
            source: event.event_type,
            wallet_id: payload.wallet_id,
            payment_intent_id,
            amount_delta,
            correction,
            reverses_intent,
            correlation_id: event.correlation_id.clone(),
        })
    }

    pub fn from_webhook(webhook: &PaymentWebhook, correlation_id: String) -> Result<Self, DomainError> {
        let amount_delta = webhook.validate()?;
        Ok(Self {
            action: CommandAction::Settle,
            source: EventType::SpendExecuted,
            wallet_id: webhook.wallet_id,
            payment_intent_id: webhook.payment_intent_id.clone(),
            amount_delta,
            correction: false,
            reverses_intent: None,
            correlation_id,
        })
    }

    /// The pending transaction this command would create. `reverses` is the
    /// id of the corrected transaction, when one was located.
    pub fn pending_transaction(&self, reverses: Option<Uuid>) -> Option<WalletTransaction> {
        self.amount_delta.map(|delta| {
            if self.correction {
                WalletTransaction::correction(self.payment_intent_id.clone(), delta, reverses)
            } else {
                WalletTransaction::pending(self.payment_intent_id.clone(), delta)
            }
        })
    }
}

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub wallet_id: Uuid,
    pub transaction: WalletTransaction,
    /// This call changed the transaction status
    pub applied: bool,
    pub ledger_recorded: bool,
    pub published: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType, payload: serde_json::Value) -> EconomicEvent {
        EconomicEvent::new(event_type, "alloc-1", "corr-1", payload).unwrap()
    }

    #[test]
    fn test_webhook_wire_form() {
        let webhook: PaymentWebhook = serde_json::from_value(json!({
            "type": "payment_intent.payment_failed",
            "payment_intent_id": "pi_1"
        }))
        .unwrap();
        assert_eq!(webhook.kind, WebhookKind::PaymentIntentFailed);
        assert!(!webhook.kind.is_success());
        assert_eq!(webhook.validate().unwrap(), None);
    }

    #[test]
    fn test_webhook_rejects_zero_amount() {
        let webhook: PaymentWebhook = serde_json::from_value(json!({
            "type": "checkout.session.completed",
            "payment_intent_id": "pi_1",
            "amount_delta": 0
        }))
        .unwrap();
        assert!(webhook.validate().is_err());
    }

    #[test]
    fn test_spend_authorized_requires_wallet_and_amount() {
        let wallet_id = Uuid::new_v4();
        let cmd = ReconciliationCommand::from_event(&event(
            EventType::SpendAuthorized,
            json!({ "wallet_id": wallet_id, "payment_intent_id": "pi_9", "amount_delta": -300 }),
        ))
        .unwrap();
        assert_eq!(cmd.action, CommandAction::EnsurePending);
        assert_eq!(cmd.wallet_id, Some(wallet_id));
        assert_eq!(cmd.amount_delta.unwrap().value(), -300);

        let missing = ReconciliationCommand::from_event(&event(
            EventType::SpendAuthorized,
            json!({ "payment_intent_id": "pi_9", "amount_delta": -300 }),
        ));
        assert!(matches!(missing, Err(DomainError::MissingField { field: "wallet_id", .. })));
    }

    #[test]
    fn test_spend_executed_falls_back_to_correlation_id() {
        let cmd = ReconciliationCommand::from_event(&event(EventType::SpendExecuted, json!({}))).unwrap();
        assert_eq!(cmd.action, CommandAction::Settle);
        assert_eq!(cmd.payment_intent_id, "corr-1");
        assert_eq!(cmd.amount_delta, None);
    }

    #[test]
    fn test_corrections_get_their_own_key() {
        let cmd = ReconciliationCommand::from_event(&event(
            EventType::Chargeback,
            json!({ "wallet_id": Uuid::new_v4(), "amount_delta": -500 }),
        ))
        .unwrap();
        assert!(cmd.correction);
        assert_eq!(cmd.payment_intent_id, "corr-1:revenue.chargeback");
        assert_eq!(cmd.reverses_intent, None);
    }

    #[test]
    fn test_refund_of_named_intent_references_it() {
        let wallet_id = Uuid::new_v4();
        let cmd = ReconciliationCommand::from_event(&event(
            EventType::RefundIssued,
            json!({ "wallet_id": wallet_id, "payment_intent_id": "pi_1", "amount_delta": -500 }),
        ))
        .unwrap();
        assert!(cmd.correction);
        assert_eq!(cmd.payment_intent_id, "pi_1:revenue.refund_issued:corr-1");
        assert_eq!(cmd.reverses_intent.as_deref(), Some("pi_1"));

        let original = Uuid::new_v4();
        let pending = cmd.pending_transaction(Some(original)).unwrap();
        assert!(pending.is_correction());
        assert_eq!(pending.reverses, Some(original));
        assert_eq!(pending.payment_intent_id, cmd.payment_intent_id);
    }

    #[test]
    fn test_non_monetary_events_rejected() {
        let result = ReconciliationCommand::from_event(&event(EventType::CampaignCreated, json!({})));
        assert!(matches!(result, Err(DomainError::InvalidRequest(_))));
        let result = ReconciliationCommand::from_event(&event(EventType::LedgerAccrued, json!({})));
        assert!(result.is_err());
    }
}
