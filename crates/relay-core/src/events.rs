use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A state change announced by a mutation collaborator.
///
/// Events are transient: they are never stored, and every subscriber
/// registered at publish time sees the same immutable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build an event from a JSON payload. Non-object payloads yield `None`.
    pub fn from_value(event_type: impl Into<String>, payload: Value) -> Option<Self> {
        match payload {
            Value::Object(map) => Some(Self::new(event_type, map)),
            _ => None,
        }
    }

    /// Task-scoped event (`task_created`, `task_updated`, `task_deleted`, `status_changed`).
    pub fn task(kind: EventKind, board_id: &str, task_id: &str) -> Self {
        let mut payload = Map::new();
        let _ = payload.insert("boardId".into(), Value::String(board_id.into()));
        let _ = payload.insert("taskId".into(), Value::String(task_id.into()));
        Self::new(kind.as_str(), payload)
    }

    /// Board-scoped event (`board_created`, `board_updated`, `board_archived`, `board_deleted`).
    pub fn board(kind: EventKind, board_id: &str) -> Self {
        let mut payload = Map::new();
        let _ = payload.insert("boardId".into(), Value::String(board_id.into()));
        Self::new(kind.as_str(), payload)
    }

    pub fn task_created(board_id: &str, task_id: &str) -> Self {
        Self::task(EventKind::TaskCreated, board_id, task_id)
    }

    pub fn activity_new(activity_type: &str) -> Self {
        let mut payload = Map::new();
        let _ = payload.insert("type".into(), Value::String(activity_type.into()));
        Self::new(EventKind::ActivityNew.as_str(), payload)
    }

    pub fn notification_new(user_id: &str) -> Self {
        let mut payload = Map::new();
        let _ = payload.insert("userId".into(), Value::String(user_id.into()));
        Self::new(EventKind::NotificationNew.as_str(), payload)
    }

    /// Attach an extra payload field (e.g. `status` on `status_changed`).
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        let _ = self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Catalog kind, if the type string is one of the published kinds.
    pub fn kind(&self) -> Option<EventKind> {
        self.event_type.parse().ok()
    }

    pub fn board_id(&self) -> Option<&str> {
        self.payload_str("boardId")
    }

    pub fn task_id(&self) -> Option<&str> {
        self.payload_str("taskId")
    }

    pub fn user_id(&self) -> Option<&str> {
        self.payload_str("userId")
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// The catalog of event types published by mutation collaborators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    StatusChanged,
    BoardCreated,
    BoardUpdated,
    BoardArchived,
    BoardDeleted,
    ActivityNew,
    NotificationNew,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        Self::TaskCreated,
        Self::TaskUpdated,
        Self::TaskDeleted,
        Self::StatusChanged,
        Self::BoardCreated,
        Self::BoardUpdated,
        Self::BoardArchived,
        Self::BoardDeleted,
        Self::ActivityNew,
        Self::NotificationNew,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskDeleted => "task_deleted",
            Self::StatusChanged => "status_changed",
            Self::BoardCreated => "board_created",
            Self::BoardUpdated => "board_updated",
            Self::BoardArchived => "board_archived",
            Self::BoardDeleted => "board_deleted",
            Self::ActivityNew => "activity_new",
            Self::NotificationNew => "notification_new",
        }
    }

    /// Whether events of this kind carry a `taskId`.
    pub fn is_task_event(&self) -> bool {
        matches!(
            self,
            Self::TaskCreated | Self::TaskUpdated | Self::TaskDeleted | Self::StatusChanged
        )
    }

    pub fn is_board_event(&self) -> bool {
        matches!(
            self,
            Self::BoardCreated | Self::BoardUpdated | Self::BoardArchived | Self::BoardDeleted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a type string is not part of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Consumer-side relevance check.
///
/// A field constraint only applies when the event payload carries that key:
/// a `board_id` filter does not reject `notification_new`, which has no
/// `boardId`. Restrict `types` to exclude such events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Accepted type strings. Empty accepts every type.
    pub types: Vec<String>,
    pub board_id: Option<String>,
    pub user_id: Option<String>,
}

impl EventFilter {
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_kinds(mut self, kinds: &[EventKind]) -> Self {
        self.types
            .extend(kinds.iter().map(|k| k.as_str().to_string()));
        self
    }

    #[must_use]
    pub fn for_board(mut self, board_id: impl Into<String>) -> Self {
        self.board_id = Some(board_id.into());
        self
    }

    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == event.event_type) {
            return false;
        }
        if let (Some(wanted), Some(actual)) = (&self.board_id, event.board_id()) {
            if wanted != actual {
                return false;
            }
        }
        if let (Some(wanted), Some(actual)) = (&self.user_id, event.user_id()) {
            if wanted != actual {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_type_then_payload() {
        let event = Event::task_created("b1", "t1");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"task_created","payload":{"boardId":"b1","taskId":"t1"}}"#
        );
    }

    #[test]
    fn deserializes_missing_payload_as_empty() {
        let event: Event = serde_json::from_str(r#"{"type":"board_updated"}"#).unwrap();
        assert_eq!(event.event_type, "board_updated");
        assert!(event.payload.is_empty());
    }

    #[test]
    fn rejects_non_object_payload() {
        let result = serde_json::from_str::<Event>(r#"{"type":"x","payload":[1,2]}"#);
        assert!(result.is_err());
        assert!(Event::from_value("x", json!("scalar")).is_none());
    }

    #[test]
    fn accessors_read_payload() {
        let event = Event::task(EventKind::StatusChanged, "b1", "t9").with_field("status", "done");
        assert_eq!(event.kind(), Some(EventKind::StatusChanged));
        assert_eq!(event.board_id(), Some("b1"));
        assert_eq!(event.task_id(), Some("t9"));
        assert_eq!(event.payload["status"], "done");
        assert_eq!(event.user_id(), None);
    }

    #[test]
    fn activity_and_notification_shapes() {
        let activity = Event::activity_new("comment");
        assert_eq!(activity.event_type, "activity_new");
        assert_eq!(activity.payload["type"], "comment");

        let notification = Event::notification_new("u1");
        assert_eq!(notification.user_id(), Some("u1"));
        assert_eq!(notification.kind(), Some(EventKind::NotificationNew));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
        assert!("comment_added".parse::<EventKind>().is_err());
    }

    #[test]
    fn kind_classification() {
        assert!(EventKind::StatusChanged.is_task_event());
        assert!(!EventKind::StatusChanged.is_board_event());
        assert!(EventKind::BoardArchived.is_board_event());
        assert!(!EventKind::NotificationNew.is_task_event());
    }

    #[test]
    fn unknown_kind_is_kept_as_string() {
        let event = Event::new("custom_thing", Map::new());
        assert_eq!(event.kind(), None);
    }

    #[test]
    fn filter_any_matches_everything() {
        assert!(EventFilter::any().matches(&Event::task_created("b1", "t1")));
        assert!(EventFilter::any().matches(&Event::notification_new("u1")));
    }

    #[test]
    fn filter_by_type() {
        let filter = EventFilter::any().with_kinds(&[EventKind::TaskCreated, EventKind::TaskDeleted]);
        assert!(filter.matches(&Event::task_created("b1", "t1")));
        assert!(!filter.matches(&Event::board(EventKind::BoardUpdated, "b1")));
    }

    #[test]
    fn filter_by_board_only_when_present() {
        let filter = EventFilter::any().for_board("b1");
        assert!(filter.matches(&Event::task_created("b1", "t1")));
        assert!(!filter.matches(&Event::task_created("b2", "t1")));
        // No boardId in payload: the board constraint does not apply.
        assert!(filter.matches(&Event::activity_new("comment")));
    }

    #[test]
    fn filter_by_user() {
        let filter = EventFilter::any()
            .with_kinds(&[EventKind::NotificationNew])
            .for_user("u1");
        assert!(filter.matches(&Event::notification_new("u1")));
        assert!(!filter.matches(&Event::notification_new("u2")));
        assert!(!filter.matches(&Event::task_created("b1", "t1")));
    }
}
