//! Settlement lifecycle: initiated → paid | failed.

use crate::domain::{AggregateKind, EventType};

use super::StateMachine;

lifecycle_states! {
    SettlementState {
        Initiated => "initiated",
        Paid => "paid",
        Failed => "failed",
    }
}

pub struct Settlement;

impl Settlement {
    /// Aggregate id of the settlement that pays out `source_id`.
    pub fn aggregate_id_for(source_id: &str) -> String {
        format!("settlement:{}", source_id)
    }
}

impl StateMachine for Settlement {
    type State = SettlementState;

    const KIND: AggregateKind = AggregateKind::Settlement;
    const CREATED_BY: EventType = EventType::SettlementInitiated;

    fn target(event_type: EventType) -> Option<SettlementState> {
        match event_type {
            EventType::SettlementInitiated => Some(SettlementState::Initiated),
            EventType::SettlementPaid => Some(SettlementState::Paid),
            EventType::SettlementFailed => Some(SettlementState::Failed),
            _ => None,
        }
    }

    fn allows(from: SettlementState, to: SettlementState, _via: EventType) -> bool {
        matches!(
            (from, to),
            (SettlementState::Initiated, SettlementState::Paid | SettlementState::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::assert_covers_family;
    use crate::aggregate::{decide, Decision};

    #[test]
    fn test_covers_settlement_events() {
        assert_covers_family::<Settlement>();
    }

    #[test]
    fn test_paid_settlement_cannot_fail() {
        assert!(matches!(
            decide::<Settlement>(Some(SettlementState::Paid), EventType::SettlementFailed),
            Some(Decision::Rejected { .. })
        ));
    }

    #[test]
    fn test_aggregate_id_for() {
        assert_eq!(Settlement::aggregate_id_for("c-1"), "settlement:c-1");
    }
}
