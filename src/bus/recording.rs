use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

use crate::domain::{EconomicEvent, EventType};

use super::{BusError, EventPublisher};

/// Publisher that keeps every event in memory instead of delivering it.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<EconomicEvent>>,
    unavailable_for: AtomicU32,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `calls` publishes fail with `Unavailable`.
    pub fn fail_next(&self, calls: u32) {
        self.unavailable_for.store(calls, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<EconomicEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_of(&self, event_type: EventType) -> Vec<EconomicEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.events.lock().await.clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: EconomicEvent) -> Result<(), BusError> {
        if self
            .unavailable_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::Unavailable("injected failure".into()));
        }
        self.events.lock().await.push(event);
        Ok(())
    }
}
