//! Allocation lifecycle: created → deployed.
//!
//! Deployment is what authorizes spend; the engine emits `spend.authorized`
//! when an allocation deploys.

use crate::domain::{AggregateKind, EventType};

use super::StateMachine;

lifecycle_states! {
    AllocationState {
        Created => "created",
        Deployed => "deployed",
    }
}

pub struct Allocation;

impl StateMachine for Allocation {
    type State = AllocationState;

    const KIND: AggregateKind = AggregateKind::Allocation;
    const CREATED_BY: EventType = EventType::AllocationCreated;

    fn target(event_type: EventType) -> Option<AllocationState> {
        match event_type {
            EventType::AllocationCreated => Some(AllocationState::Created),
            EventType::AllocationDeployed => Some(AllocationState::Deployed),
            _ => None,
        }
    }

    fn allows(from: AllocationState, to: AllocationState, _via: EventType) -> bool {
        matches!((from, to), (AllocationState::Created, AllocationState::Deployed))
    }
}
