//! Aggregate module
//!
//! Lifecycle state machines for the protocol aggregates. Each family is a
//! unit type implementing [`StateMachine`] with its own state enum and
//! transition table; [`ProtocolEngine`] dispatches to them with an exhaustive
//! match over [`AggregateKind`].

use std::fmt;
use std::str::FromStr;

use crate::bus::BusError;
use crate::domain::{AggregateKind, DomainError, EventType};

/// Declares a lifecycle state enum with its snake_case wire names.
macro_rules! lifecycle_states {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
        }

        impl $crate::aggregate::LifecycleState for $name {
            fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($crate::aggregate::LifecycleState::as_str(self))
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(format!("unknown {} state: {}", stringify!($name), other)),
                }
            }
        }
    };
}

pub mod allocation;
pub mod campaign;
pub mod commitment;
pub mod engine;
pub mod round;
pub mod settlement;
pub mod store;

pub use allocation::{Allocation, AllocationState};
pub use campaign::{Campaign, CampaignState};
pub use commitment::{Commitment, CommitmentState};
pub use engine::{ProtocolEngine, Transition};
pub use round::{Round, RoundState};
pub use settlement::{Settlement, SettlementState};
pub use store::{
    AggregateRecord, AggregateStateStore, MemoryStateStore, PgStateStore, StateStoreError,
};

pub trait LifecycleState:
    Copy + Eq + fmt::Debug + fmt::Display + FromStr<Err = String> + Send + Sync + 'static
{
    fn as_str(&self) -> &'static str;
}

/// One aggregate family's transition table
pub trait StateMachine: Send + Sync + 'static {
    type State: LifecycleState;

    const KIND: AggregateKind;

    /// The event that brings an aggregate of this family into existence
    const CREATED_BY: EventType;

    /// State an event moves the aggregate to; `None` for events this
    /// machine does not consume.
    fn target(event_type: EventType) -> Option<Self::State>;

    /// Whether `via` may move the aggregate from `from` to `to`. Several
    /// events can share a target state, so the event takes part.
    fn allows(from: Self::State, to: Self::State, via: EventType) -> bool;
}

/// What to do with an event, given the aggregate's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision<S> {
    Create(S),
    Advance { from: S, to: S },
    /// Already in the target state; replay is a no-op
    Duplicate(S),
    /// Not a legal transition; state unchanged, event considered handled
    Rejected { current: S, attempted: S },
    /// Aggregate not created yet; retry to absorb reordering
    Missing,
}

/// Decide how `event_type` applies to an aggregate in state `current`
/// (`None` when absent). Returns `None` if the machine ignores the event.
pub fn decide<M: StateMachine>(
    current: Option<M::State>,
    event_type: EventType,
) -> Option<Decision<M::State>> {
    let target = M::target(event_type)?;
    Some(match current {
        None if event_type == M::CREATED_BY => Decision::Create(target),
        None => Decision::Missing,
        Some(state) if state == target => Decision::Duplicate(state),
        Some(state) if M::allows(state, target, event_type) => Decision::Advance {
            from: state,
            to: target,
        },
        Some(state) => Decision::Rejected {
            current: state,
            attempted: target,
        },
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error("Failed to publish follow-on event: {0}")]
    Publish(#[from] BusError),

    #[error("{kind} {aggregate_id} does not exist yet")]
    Missing {
        kind: AggregateKind,
        aggregate_id: String,
    },
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_absent_aggregate() {
        assert_eq!(
            decide::<Round>(None, EventType::RoundCreated),
            Some(Decision::Create(RoundState::Created))
        );
        assert_eq!(decide::<Round>(None, EventType::RoundOpened), Some(Decision::Missing));
        assert_eq!(decide::<Round>(None, EventType::CampaignCreated), None);
    }

    #[test]
    fn test_decide_existing_aggregate() {
        assert_eq!(
            decide::<Round>(Some(RoundState::Approved), EventType::RoundOpened),
            Some(Decision::Advance {
                from: RoundState::Approved,
                to: RoundState::Opened
            })
        );
        assert_eq!(
            decide::<Round>(Some(RoundState::Opened), EventType::RoundOpened),
            Some(Decision::Duplicate(RoundState::Opened))
        );
        assert_eq!(
            decide::<Round>(Some(RoundState::Closed), EventType::RoundOpened),
            Some(Decision::Rejected {
                current: RoundState::Closed,
                attempted: RoundState::Opened
            })
        );
    }

    #[test]
    fn test_recreate_is_rejected_unless_still_initial() {
        assert_eq!(
            decide::<Commitment>(Some(CommitmentState::Created), EventType::CommitmentCreated),
            Some(Decision::Duplicate(CommitmentState::Created))
        );
        assert!(matches!(
            decide::<Commitment>(Some(CommitmentState::Confirmed), EventType::CommitmentCreated),
            Some(Decision::Rejected { .. })
        ));
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(CampaignState::OpenedForFunding.as_str(), "opened_for_funding");
        assert_eq!("funding_closed".parse::<CampaignState>(), Ok(CampaignState::FundingClosed));
        assert!("exploded".parse::<SettlementState>().is_err());
        assert_eq!(
            serde_json::to_string(&SettlementState::Paid).unwrap(),
            "\"paid\""
        );
    }
}
