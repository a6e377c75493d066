//! Campaign lifecycle
//!
//! created → opened_for_funding → funding_closed → activated, with
//! activated ⇄ paused, ending in completed or cancelled from activated or
//! funding_closed. `campaign.resumed` returns a paused campaign to activated.

use crate::domain::{AggregateKind, EventType};

use super::StateMachine;

lifecycle_states! {
    CampaignState {
        Created => "created",
        OpenedForFunding => "opened_for_funding",
        FundingClosed => "funding_closed",
        Activated => "activated",
        Paused => "paused",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

pub struct Campaign;

impl StateMachine for Campaign {
    type State = CampaignState;

    const KIND: AggregateKind = AggregateKind::Campaign;
    const CREATED_BY: EventType = EventType::CampaignCreated;

    fn target(event_type: EventType) -> Option<CampaignState> {
        match event_type {
            EventType::CampaignCreated => Some(CampaignState::Created),
            EventType::CampaignOpenedForFunding => Some(CampaignState::OpenedForFunding),
            EventType::CampaignFundingClosed => Some(CampaignState::FundingClosed),
            EventType::CampaignActivated | EventType::CampaignResumed => {
                Some(CampaignState::Activated)
            }
            EventType::CampaignPaused => Some(CampaignState::Paused),
            EventType::CampaignCompleted => Some(CampaignState::Completed),
            EventType::CampaignCancelled => Some(CampaignState::Cancelled),
            _ => None,
        }
    }

    fn allows(from: CampaignState, to: CampaignState, via: EventType) -> bool {
        use CampaignState::*;
        match (from, to) {
            (FundingClosed, Activated) => via == EventType::CampaignActivated,
            (Paused, Activated) => via == EventType::CampaignResumed,
            (Created, OpenedForFunding)
            | (OpenedForFunding, FundingClosed)
            | (Activated, Paused)
            | (Activated | FundingClosed, Completed | Cancelled) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_support::{assert_covers_family, run};
    use crate::aggregate::{decide, Decision};

    #[test]
    fn test_covers_campaign_events() {
        assert_covers_family::<Campaign>();
    }

    #[test]
    fn test_full_lifecycle_with_pause() {
        let state = run::<Campaign>(&[
            EventType::CampaignCreated,
            EventType::CampaignOpenedForFunding,
            EventType::CampaignFundingClosed,
            EventType::CampaignActivated,
            EventType::CampaignPaused,
            EventType::CampaignResumed,
            EventType::CampaignCompleted,
        ]);
        assert_eq!(state, Some(CampaignState::Completed));
    }

    #[test]
    fn test_completed_is_terminal() {
        for event_type in [
            EventType::CampaignActivated,
            EventType::CampaignPaused,
            EventType::CampaignOpenedForFunding,
            EventType::CampaignCancelled,
        ] {
            assert!(matches!(
                decide::<Campaign>(Some(CampaignState::Completed), event_type),
                Some(Decision::Rejected { current: CampaignState::Completed, .. })
            ));
        }
    }

    #[test]
    fn test_cannot_skip_funding() {
        assert!(matches!(
            decide::<Campaign>(Some(CampaignState::Created), EventType::CampaignActivated),
            Some(Decision::Rejected { .. })
        ));
        assert!(matches!(
            decide::<Campaign>(Some(CampaignState::OpenedForFunding), EventType::CampaignCompleted),
            Some(Decision::Rejected { .. })
        ));
    }

    #[test]
    fn test_resume_while_active_is_noop() {
        assert_eq!(
            decide::<Campaign>(Some(CampaignState::Activated), EventType::CampaignResumed),
            Some(Decision::Duplicate(CampaignState::Activated))
        );
    }

    #[test]
    fn test_only_resume_leaves_pause() {
        assert_eq!(
            decide::<Campaign>(Some(CampaignState::Paused), EventType::CampaignActivated),
            Some(Decision::Rejected {
                current: CampaignState::Paused,
                attempted: CampaignState::Activated
            })
        );
        assert!(matches!(
            decide::<Campaign>(Some(CampaignState::FundingClosed), EventType::CampaignResumed),
            Some(Decision::Rejected { .. })
        ));
        assert_eq!(
            decide::<Campaign>(Some(CampaignState::Paused), EventType::CampaignResumed),
            Some(Decision::Advance {
                from: CampaignState::Paused,
                to: CampaignState::Activated
            })
        );
    }

    #[test]
    fn test_paused_campaign_cannot_complete() {
        assert!(matches!(
            decide::<Campaign>(Some(CampaignState::Paused), EventType::CampaignCompleted),
            Some(Decision::Rejected { .. })
        ));
    }
}
