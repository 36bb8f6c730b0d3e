//! Event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>`. Publishing never blocks and
//! never fails; with no subscribers the event is dropped.

use atelier_core::generation::GenerationRequest;
use atelier_core::types::{DbId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// GenerationEvent
// ---------------------------------------------------------------------------

/// What happened to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationEventKind {
    RequestCreated,
    StatusChanged,
    ImagesAttached,
    ImageAvailable,
    RequestDeleted,
    ImagesDeleted,
}

impl GenerationEventKind {
    /// Dot-separated event name, used as the SSE `event:` field.
    pub fn event_type(self) -> &'static str {
        match self {
            GenerationEventKind::RequestCreated => "generation.request_created",
            GenerationEventKind::StatusChanged => "generation.status_changed",
            GenerationEventKind::ImagesAttached => "generation.images_attached",
            GenerationEventKind::ImageAvailable => "generation.image_available",
            GenerationEventKind::RequestDeleted => "generation.request_deleted",
            GenerationEventKind::ImagesDeleted => "generation.images_deleted",
        }
    }
}

/// A change to one of a user's generation requests.
///
/// `request` carries the full projection after the change when there is one;
/// deletions carry only ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationEvent {
    pub kind: GenerationEventKind,
    pub user_id: DbId,
    pub request_id: Option<DbId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<GenerationRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_ids: Vec<DbId>,
    pub timestamp: Timestamp,
}

impl GenerationEvent {
    /// Event about a request whose current projection is known.
    pub fn for_request(kind: GenerationEventKind, user_id: DbId, request: GenerationRequest) -> Self {
        Self {
            kind,
            user_id,
            request_id: Some(request.id),
            request: Some(request),
            image_ids: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn request_deleted(user_id: DbId, request_id: DbId) -> Self {
        Self {
            kind: GenerationEventKind::RequestDeleted,
            user_id,
            request_id: Some(request_id),
            request: None,
            image_ids: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn images_deleted(user_id: DbId, image_ids: Vec<DbId>) -> Self {
        Self {
            kind: GenerationEventKind::ImagesDeleted,
            user_id,
            request_id: None,
            request: None,
            image_ids,
            timestamp: Utc::now(),
        }
    }

    /// Attach image ids (e.g. the image that just became available).
    pub fn with_image_ids(mut self, image_ids: Vec<DbId>) -> Self {
        self.image_ids = image_ids;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Slow subscribers that fall more than the channel capacity behind observe
/// `RecvError::Lagged` and skip ahead.
pub struct EventBus {
    sender: broadcast::Sender<GenerationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: GenerationEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(GenerationEvent::request_deleted(7, 42));

        let a = rx1.recv().await.unwrap();
        let b = rx2.recv().await.unwrap();
        assert_eq!(a.kind, GenerationEventKind::RequestDeleted);
        assert_eq!(a.request_id, Some(42));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(GenerationEvent::images_deleted(1, vec![3, 4]));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for id in 0..5 {
            bus.publish(GenerationEvent::request_deleted(1, id));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn event_types_are_namespaced() {
        assert_eq!(
            GenerationEventKind::StatusChanged.event_type(),
            "generation.status_changed"
        );
    }

    #[test]
    fn deletion_events_serialize_without_projection() {
        let json = serde_json::to_value(GenerationEvent::images_deleted(5, vec![1, 2])).unwrap();
        assert_eq!(json["kind"], "images_deleted");
        assert_eq!(json["image_ids"], serde_json::json!([1, 2]));
        assert!(json.get("request").is_none());
    }
}
