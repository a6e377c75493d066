//! Economic event taxonomy
//!
//! The closed vocabulary of event types exchanged between services. Every
//! mapping below is an exhaustive match, so adding a variant forces each
//! consumer to decide how to treat it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::DomainError;

/// Lifecycle family an event type belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFamily {
    AppEconomics,
    Campaign,
    Round,
    Commitment,
    Allocation,
    SpendPerformance,
    Attribution,
    Revenue,
    LedgerSettlement,
}

/// Aggregate families governed by a protocol state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Campaign,
    Round,
    Commitment,
    Allocation,
    Settlement,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 5] = [
        AggregateKind::Campaign,
        AggregateKind::Round,
        AggregateKind::Commitment,
        AggregateKind::Allocation,
        AggregateKind::Settlement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateKind::Campaign => "campaign",
            AggregateKind::Round => "round",
            AggregateKind::Commitment => "commitment",
            AggregateKind::Allocation => "allocation",
            AggregateKind::Settlement => "settlement",
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AggregateKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DomainError::InvalidRequest(format!("unknown aggregate kind: {}", s)))
    }
}

/// Shape of the payload an event type carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Monetary,
    Lifecycle,
    AppTerms,
    Performance,
    Attribution,
}

macro_rules! event_types {
    ($($variant:ident => $wire:literal),+ $(,)?) => {
        /// Every economic event type known to the platform
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EventType {
            $($variant),+
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[$(EventType::$variant),+];

            /// Canonical wire name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventType::$variant => $wire),+
                }
            }
        }

        impl FromStr for EventType {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(EventType::$variant),)+
                    other => Err(DomainError::UnknownEventType(other.to_string())),
                }
            }
        }
    };
}

event_types! {
    AppTermsProposed => "app.terms_proposed",
    AppTermsAccepted => "app.terms_accepted",
    AppRoyaltyRateChanged => "app.royalty_rate_changed",
    AppRoyaltyAccrued => "app.royalty_accrued",

    CampaignCreated => "campaign.created",
    CampaignOpenedForFunding => "campaign.opened_for_funding",
    CampaignFundingClosed => "campaign.funding_closed",
    CampaignActivated => "campaign.activated",
    CampaignPaused => "campaign.paused",
    CampaignResumed => "campaign.resumed",
    CampaignCompleted => "campaign.completed",
    CampaignCancelled => "campaign.cancelled",

    RoundCreated => "round.created",
    RoundApproved => "round.approved",
    RoundOpened => "round.opened",
    RoundClosed => "round.closed",
    RoundCancelled => "round.cancelled",
    RoundVoteCast => "round.vote_cast",

    CommitmentCreated => "commitment.created",
    CommitmentConfirmed => "commitment.confirmed",
    CommitmentCancelled => "commitment.cancelled",

    AllocationCreated => "allocation.created",
    AllocationDeployed => "allocation.deployed",

    SpendAuthorized => "spend.authorized",
    SpendExecuted => "spend.executed",
    SpendRefunded => "spend.refunded",
    KpiReported => "performance.kpi_reported",
    BudgetExhausted => "performance.budget_exhausted",

    AttributionTouchRecorded => "attribution.touch_recorded",
    AttributionAssigned => "attribution.assigned",

    InvoiceIssued => "revenue.invoice_issued",
    InvoicePaid => "revenue.invoice_paid",
    RefundIssued => "revenue.refund_issued",
    Chargeback => "revenue.chargeback",

    LedgerAccrued => "ledger.accrued",
    LedgerAdjusted => "ledger.adjusted",
    SettlementInitiated => "settlement.initiated",
    SettlementPaid => "settlement.paid",
    SettlementFailed => "settlement.failed",
}

impl EventType {
    pub fn family(&self) -> EventFamily {
        use EventType::*;
        match self {
            AppTermsProposed | AppTermsAccepted | AppRoyaltyRateChanged | AppRoyaltyAccrued => {
                EventFamily::AppEconomics
            }
            CampaignCreated | CampaignOpenedForFunding | CampaignFundingClosed
            | CampaignActivated | CampaignPaused | CampaignResumed | CampaignCompleted
            | CampaignCancelled => EventFamily::Campaign,
            RoundCreated | RoundApproved | RoundOpened | RoundClosed | RoundCancelled
            | RoundVoteCast => EventFamily::Round,
            CommitmentCreated | CommitmentConfirmed | CommitmentCancelled => {
                EventFamily::Commitment
            }
            AllocationCreated | AllocationDeployed => EventFamily::Allocation,
            SpendAuthorized | SpendExecuted | SpendRefunded | KpiReported | BudgetExhausted => {
                EventFamily::SpendPerformance
            }
            AttributionTouchRecorded | AttributionAssigned => EventFamily::Attribution,
            InvoiceIssued | InvoicePaid | RefundIssued | Chargeback => EventFamily::Revenue,
            LedgerAccrued | LedgerAdjusted | SettlementInitiated | SettlementPaid
            | SettlementFailed => EventFamily::LedgerSettlement,
        }
    }

    /// The state machine that consumes this event, if any.
    ///
    /// `round.vote_cast` belongs to the round family but does not move the
    /// round's lifecycle.
    pub fn aggregate_kind(&self) -> Option<AggregateKind> {
        use EventType::*;
        match self {
            CampaignCreated | CampaignOpenedForFunding | CampaignFundingClosed
            | CampaignActivated | CampaignPaused | CampaignResumed | CampaignCompleted
            | CampaignCancelled => Some(AggregateKind::Campaign),
            RoundCreated | RoundApproved | RoundOpened | RoundClosed | RoundCancelled => {
                Some(AggregateKind::Round)
            }
            CommitmentCreated | CommitmentConfirmed | CommitmentCancelled => {
                Some(AggregateKind::Commitment)
            }
            AllocationCreated | AllocationDeployed => Some(AggregateKind::Allocation),
            SettlementInitiated | SettlementPaid | SettlementFailed => {
                Some(AggregateKind::Settlement)
            }
            RoundVoteCast | AppTermsProposed | AppTermsAccepted | AppRoyaltyRateChanged
            | AppRoyaltyAccrued | SpendAuthorized | SpendExecuted | SpendRefunded
            | KpiReported | BudgetExhausted | AttributionTouchRecorded | AttributionAssigned
            | InvoiceIssued | InvoicePaid | RefundIssued | Chargeback | LedgerAccrued
            | LedgerAdjusted => None,
        }
    }

    pub fn payload_kind(&self) -> PayloadKind {
        use EventType::*;
        match self {
            AppTermsProposed | AppTermsAccepted | AppRoyaltyRateChanged => PayloadKind::AppTerms,
            AppRoyaltyAccrued | SpendAuthorized | SpendExecuted | SpendRefunded
            | InvoiceIssued | InvoicePaid | RefundIssued | Chargeback | LedgerAccrued
            | LedgerAdjusted => PayloadKind::Monetary,
            KpiReported | BudgetExhausted => PayloadKind::Performance,
            AttributionTouchRecorded | AttributionAssigned => PayloadKind::Attribution,
            CampaignCreated | CampaignOpenedForFunding | CampaignFundingClosed
            | CampaignActivated | CampaignPaused | CampaignResumed | CampaignCompleted
            | CampaignCancelled | RoundCreated | RoundApproved | RoundOpened | RoundClosed
            | RoundCancelled | RoundVoteCast | CommitmentCreated | CommitmentConfirmed
            | CommitmentCancelled | AllocationCreated | AllocationDeployed
            | SettlementInitiated | SettlementPaid | SettlementFailed => PayloadKind::Lifecycle,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
