//! Protocol engine
//!
//! Applies lifecycle events to aggregate state and publishes the follow-on
//! events a transition causes. Follow-ons go through the publisher so every
//! consumer sees them in bus order; the engine never calls another handler
//! directly.

use async_trait::async_trait;
use std::sync::Arc;

use super::store::{AggregateRecord, AggregateStateStore, StateStoreError};
use super::{
    decide, Allocation, Campaign, Commitment, Decision, LifecycleState, ProtocolError, Round,
    Settlement, StateMachine,
};
use crate::bus::{
    BusError, DeadLetter, DeadLetterSink, EventHandler, EventPublisher, HandlerError,
};
use crate::domain::{AggregateKind, EconomicEvent, EventType};
use crate::error::AppError;
use crate::reconciler::RetryPolicy;

/// Dead-letter handler name for follow-ons that could not be delivered
pub const FOLLOW_ON_HANDLER: &str = "engine.follow_on";

/// Effect of one event on its aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Created { state: &'static str },
    Advanced { from: &'static str, to: &'static str },
    Duplicate { state: &'static str },
    Rejected { current: &'static str, attempted: &'static str },
    /// Event is not a lifecycle event for any machine
    Ignored,
}

impl Transition {
    /// Whether state was written
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Created { .. } | Transition::Advanced { .. })
    }
}

pub struct ProtocolEngine {
    store: Arc<dyn AggregateStateStore>,
    publisher: Arc<dyn EventPublisher>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
}

impl ProtocolEngine {
    pub fn new(
        store: Arc<dyn AggregateStateStore>,
        publisher: Arc<dyn EventPublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            store,
            publisher,
            dead_letters,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn state(
        &self,
        kind: AggregateKind,
        aggregate_id: &str,
    ) -> Result<Option<AggregateRecord>, ProtocolError> {
        Ok(self.store.load(kind, aggregate_id).await?)
    }

    pub async fn apply(&self, event: &EconomicEvent) -> Result<Transition, ProtocolError> {
        let Some(kind) = event.event_type.aggregate_kind() else {
            return Ok(Transition::Ignored);
        };

        match kind {
            AggregateKind::Campaign => self.apply_as::<Campaign>(event).await,
            AggregateKind::Round => self.apply_as::<Round>(event).await,
            AggregateKind::Commitment => self.apply_as::<Commitment>(event).await,
            AggregateKind::Allocation => self.apply_as::<Allocation>(event).await,
            AggregateKind::Settlement => self.apply_as::<Settlement>(event).await,
        }
    }

    async fn apply_as<M: StateMachine>(&self, event: &EconomicEvent) -> Result<Transition, ProtocolError> {
        let aggregate_id = event.aggregate_id.as_str();
        let record = self.store.load(M::KIND, aggregate_id).await?;
        let current = record
            .as_ref()
            .map(|r| r.state.parse::<M::State>())
            .transpose()
            .map_err(StateStoreError::Corrupt)?;
        let version = record.as_ref().map_or(0, |r| r.version);
        let fingerprint = event.fingerprint();

        let Some(decision) = decide::<M>(current, event.event_type) else {
            return Ok(Transition::Ignored);
        };

        // A redelivered event is a no-op even if a cycle has since made its
        // transition legal again
        if let (Some(record), Some(state)) = (&record, current) {
            if record.has_applied(&fingerprint) {
                tracing::debug!(
                    kind = %M::KIND,
                    aggregate_id = %aggregate_id,
                    event_type = %event.event_type,
                    state = %state,
                    "Event already applied"
                );
                return Ok(Transition::Duplicate { state: state.as_str() });
            }
        }

        let transition = match decision {
            Decision::Create(state) => {
                self.store
                    .insert(
                        AggregateRecord::new(M::KIND, aggregate_id, state.as_str())
                            .applied_by(fingerprint),
                    )
                    .await?;
                tracing::info!(
                    kind = %M::KIND,
                    aggregate_id = %aggregate_id,
                    state = %state,
                    correlation_id = %event.correlation_id,
                    "Aggregate created"
                );
                Transition::Created { state: state.as_str() }
            }
            Decision::Advance { from, to } => {
                self.store
                    .update(M::KIND, aggregate_id, version, to.as_str(), &fingerprint)
                    .await?;
                tracing::info!(
                    kind = %M::KIND,
                    aggregate_id = %aggregate_id,
                    from = %from,
                    to = %to,
                    correlation_id = %event.correlation_id,
                    "Aggregate transitioned"
                );
                Transition::Advanced {
                    from: from.as_str(),
                    to: to.as_str(),
                }
            }
            Decision::Duplicate(state) => {
                tracing::debug!(
                    kind = %M::KIND,
                    aggregate_id = %aggregate_id,
                    event_type = %event.event_type,
                    state = %state,
                    "Already in target state"
                );
                Transition::Duplicate { state: state.as_str() }
            }
            Decision::Rejected { current, attempted } => {
                tracing::warn!(
                    kind = %M::KIND,
                    aggregate_id = %aggregate_id,
                    event_type = %event.event_type,
                    current = %current,
                    attempted = %attempted,
                    correlation_id = %event.correlation_id,
                    "Transition rejected"
                );
                Transition::Rejected {
                    current: current.as_str(),
                    attempted: attempted.as_str(),
                }
            }
            Decision::Missing => {
                return Err(ProtocolError::Missing {
                    kind: M::KIND,
                    aggregate_id: aggregate_id.to_string(),
                })
            }
        };

        if transition.changed() {
            self.publish_follow_ons(event).await;
        }
        Ok(transition)
    }

    async fn publish_follow_ons(&self, event: &EconomicEvent) {
        for (event_type, aggregate_id) in follow_ons(event) {
            let follow = match event.follow_on(event_type, aggregate_id) {
                Ok(follow) => follow,
                Err(e) => {
                    tracing::error!(
                        event_type = %event_type,
                        cause = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        correlation_id = %event.correlation_id,
                        error = %e,
                        "Could not build follow-on event, dead-lettering its cause"
                    );
                    let error = format!("building {} failed: {}", event_type, e);
                    self.dead_letter(DeadLetter::new(FOLLOW_ON_HANDLER, event.clone(), error, 1))
                        .await;
                    continue;
                }
            };

            let published = self
                .retry
                .run("publish_follow_on", BusError::is_retryable, |_| {
                    self.publisher.publish(follow.clone())
                })
                .await;

            if let Err(e) = published {
                tracing::error!(
                    event_type = %follow.event_type,
                    aggregate_id = %follow.aggregate_id,
                    correlation_id = %follow.correlation_id,
                    error = %e,
                    "Follow-on publish failed"
                );
                let letter = DeadLetter::new(FOLLOW_ON_HANDLER, follow, &e, self.retry.max_attempts());
                self.dead_letter(letter).await;
            }
        }
    }

    async fn dead_letter(&self, letter: DeadLetter) {
        if let Err(e) = self.dead_letters.record(letter).await {
            tracing::error!(error = %e, "Failed to record dead letter");
        }
    }
}

/// Events caused by a transition into the state `event` names.
fn follow_ons(event: &EconomicEvent) -> Vec<(EventType, String)> {
    match event.event_type {
        EventType::AllocationDeployed => {
            vec![(EventType::SpendAuthorized, event.aggregate_id.clone())]
        }
        EventType::CampaignCompleted | EventType::RoundClosed => vec![(
            EventType::SettlementInitiated,
            Settlement::aggregate_id_for(&event.aggregate_id),
        )],
        _ => Vec::new(),
    }
}

#[async_trait]
impl EventHandler for ProtocolEngine {
    fn name(&self) -> &'static str {
        "engine"
    }

    fn handles(&self, event_type: EventType) -> bool {
        event_type.aggregate_kind().is_some()
    }

    async fn handle(&self, event: &EconomicEvent) -> Result<(), HandlerError> {
        self.apply(event)
            .await
            .map(|_| ())
            .map_err(|e| HandlerError::from(AppError::from(e)))
    }
}
