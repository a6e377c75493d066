//! Funding round lifecycle
//!
//! created → approved → opened → closed; cancellable until closed.
//! `round.vote_cast` is governance chatter and does not move the round.

use crate::domain::{AggregateKind, EventType};

use super::StateMachine;

lifecycle_states! {
    RoundState {
        Created => "created",
        Approved => "approved",
        Opened => "opened",
        Closed => "closed",
        Cancelled => "cancelled",
    }
}

pub struct Round;

impl StateMachine for Round {
    type State = RoundState;

    const KIND: AggregateKind = AggregateKind::Round;
    const CREATED_BY: EventType = EventType::RoundCreated;

    fn target(event_type: EventType) -> Option<RoundState> {
        match event_type {
            EventType::RoundCreated => Some(RoundState::Created),
            EventType::RoundApproved => Some(RoundState::Approved),
            EventType::RoundOpened => Some(RoundState::Opened),
            EventType::RoundClosed => Some(RoundState::Closed),
            EventType::RoundCancelled => Some(RoundState::Cancelled),
            _ => None,
        }
    }

    fn allows(from: RoundState, to: RoundState, _via: EventType) -> bool {
        use RoundState::*;
        matches!(
            (from, to),
            (Created, Approved)
                | (Approved, Opened)
                | (Opened, Closed)
                | (Created | Approved | Opened, Cancelled)
        )
    }
}
