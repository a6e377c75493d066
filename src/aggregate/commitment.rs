//! Commitment lifecycle: created → confirmed | cancelled.

use crate::domain::{AggregateKind, EventType};

use super::StateMachine;

lifecycle_states! {
    CommitmentState {
        Created => "created",
        Confirmed => "confirmed",
        Cancelled => "cancelled",
    }
}

pub struct Commitment;

impl StateMachine for Commitment {
    type State = CommitmentState;

    const KIND: AggregateKind = AggregateKind::Commitment;
    const CREATED_BY: EventType = EventType::CommitmentCreated;

    fn target(event_type: EventType) -> Option<CommitmentState> {
        match event_type {
            EventType::CommitmentCreated => Some(CommitmentState::Created),
            EventType::CommitmentConfirmed => Some(CommitmentState::Confirmed),
            EventType::CommitmentCancelled => Some(CommitmentState::Cancelled),
            _ => None,
        }
    }

    fn allows(from: CommitmentState, to: CommitmentState, _via: EventType) -> bool {
        matches!(
            (from, to),
            (CommitmentState::Created, CommitmentState::Confirmed | CommitmentState::Cancelled)
        )
    }
}
