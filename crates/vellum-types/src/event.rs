use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TypeError;
use crate::media::{MediaId, MediaInfo, MediaUpdate, MediaUpdateKind};
use crate::uri::PartitionUri;

/// Position of an event within one partition's log.
pub type EventId = u64;

/// Type name that marks an action as a Media sub-action.
pub const MEDIA_TYPE_NAME: &str = "Media";

/// Identifier shared by a command and the truth that confirms it.
///
/// Locally created commands use time-ordered UUID v7 values; ids received
/// from an authority are kept verbatim.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Generate a new time-ordered command id.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({})", self.0)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mutation carried by an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Created {
        id: String,
        type_name: String,
        #[serde(default)]
        initial_state: Value,
    },
    Modified {
        id: String,
        type_name: String,
        #[serde(default)]
        sets: Value,
    },
    Destroyed {
        id: String,
        type_name: String,
    },
    /// Freezes the partition; no further commands are accepted.
    Frozen { id: String },
    /// Compound action applied atomically.
    Transacted { actions: Vec<Action> },
}

impl Action {
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen { .. })
    }

    /// Number of leaf actions, counting compound actions recursively.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Transacted { actions } => actions.iter().map(Self::leaf_count).sum(),
            _ => 1,
        }
    }

    /// All Media create/modify sub-actions, in application order.
    pub fn media_updates(&self) -> Result<Vec<MediaUpdate>, TypeError> {
        let mut updates = Vec::new();
        self.collect_media_updates(&mut updates)?;
        Ok(updates)
    }

    fn collect_media_updates(&self, out: &mut Vec<MediaUpdate>) -> Result<(), TypeError> {
        match self {
            Self::Created { id, type_name, initial_state } if type_name == MEDIA_TYPE_NAME => {
                let media_id = MediaId::new(id.clone());
                let info = MediaInfo::from_action_body(&media_id, initial_state)?;
                out.push(MediaUpdate { media_id, kind: MediaUpdateKind::Created, info });
            }
            Self::Modified { id, type_name, sets } if type_name == MEDIA_TYPE_NAME => {
                let media_id = MediaId::new(id.clone());
                let info = MediaInfo::from_action_body(&media_id, sets)?;
                out.push(MediaUpdate { media_id, kind: MediaUpdateKind::Modified, info });
            }
            Self::Transacted { actions } => {
                for action in actions {
                    action.collect_media_updates(out)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// An authorized truth or a speculative command.
///
/// `partitions` maps every touched partition's raw id to the event's
/// position in that partition's log. A command that has not been claimed
/// yet carries no positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub command_id: CommandId,
    #[serde(default)]
    pub partitions: BTreeMap<String, EventId>,
    pub action: Action,
}

impl Event {
    /// A new, unpositioned command with a fresh command id.
    pub fn command(action: Action) -> Self {
        Self {
            command_id: CommandId::new(),
            partitions: BTreeMap::new(),
            action,
        }
    }

    /// An event positioned in a single partition.
    pub fn for_partition(
        partition: &PartitionUri,
        event_id: EventId,
        command_id: CommandId,
        action: Action,
    ) -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(partition.raw_id().to_string(), event_id);
        Self { command_id, partitions, action }
    }

    /// Set this event's position in `partition`.
    pub fn with_event_id(mut self, partition: &PartitionUri, event_id: EventId) -> Self {
        self.set_event_id(partition, event_id);
        self
    }

    pub fn set_event_id(&mut self, partition: &PartitionUri, event_id: EventId) {
        self.partitions.insert(partition.raw_id().to_string(), event_id);
    }

    pub fn event_id_for(&self, partition: &PartitionUri) -> Option<EventId> {
        self.partitions.get(partition.raw_id()).copied()
    }

    /// Returns `true` if the event must be committed across partitions.
    pub fn is_multi_partition(&self) -> bool {
        self.partitions.len() > 1
    }

    pub fn is_frozen(&self) -> bool {
        self.action.is_frozen()
    }
}

/// Bounds of the authorized event log of one partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogInfo {
    pub first_event_id: EventId,
    /// `None` while no truth has been recorded.
    pub last_event_id: Option<EventId>,
}

impl EventLogInfo {
    pub fn starting_at(first_event_id: EventId) -> Self {
        Self { first_event_id, last_event_id: None }
    }

    /// The only event id the next accepted truth may carry.
    pub fn next_event_id(&self) -> EventId {
        self.last_event_id.map_or(self.first_event_id, |last| last + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.last_event_id.is_none()
    }

    pub fn len(&self) -> u64 {
        self.next_event_id() - self.first_event_id
    }
}

/// Bounds and cached command-id index of the speculative command queue.
///
/// The queue covers the contiguous range
/// `first_event_id .. first_event_id + command_ids.len()`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandQueueInfo {
    pub first_event_id: EventId,
    pub command_ids: Vec<CommandId>,
}

impl CommandQueueInfo {
    pub fn starting_at(first_event_id: EventId) -> Self {
        Self { first_event_id, command_ids: Vec::new() }
    }

    pub fn last_event_id(&self) -> Option<EventId> {
        if self.command_ids.is_empty() {
            None
        } else {
            Some(self.next_event_id() - 1)
        }
    }

    pub fn next_event_id(&self) -> EventId {
        self.first_event_id + self.command_ids.len() as u64
    }

    pub fn len(&self) -> usize {
        self.command_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.command_ids.is_empty()
    }

    /// The command id queued at `event_id`, if any.
    pub fn command_id_at(&self, event_id: EventId) -> Option<&CommandId> {
        let offset = event_id.checked_sub(self.first_event_id)?;
        self.command_ids.get(usize::try_from(offset).ok()?)
    }

    /// Drop every entry before `event_id` and move the floor there.
    pub fn advance_to(&mut self, event_id: EventId) {
        if event_id <= self.first_event_id {
            return;
        }
        let drop = usize::try_from(event_id - self.first_event_id)
            .unwrap_or(usize::MAX)
            .min(self.command_ids.len());
        self.command_ids.drain(..drop);
        self.first_event_id = event_id;
    }

    /// Empty the queue and restart it at `event_id`.
    pub fn reset_to(&mut self, event_id: EventId) {
        self.command_ids.clear();
        self.first_event_id = event_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partition() -> PartitionUri {
        PartitionUri::parse("vellum-local:///p1").unwrap()
    }

    fn media_created(id: &str, body: Value) -> Action {
        Action::Created {
            id: id.into(),
            type_name: MEDIA_TYPE_NAME.into(),
            initial_state: body,
        }
    }

    #[test]
    fn command_ids_are_unique() {
        let a = CommandId::new();
        let b = CommandId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn media_updates_recurse_into_transactions() {
        let action = Action::Transacted {
            actions: vec![
                Action::Created {
                    id: "e1".into(),
                    type_name: "Entity".into(),
                    initial_state: json!({}),
                },
                media_created("m1", json!({ "name": "a.txt" })),
                Action::Transacted {
                    actions: vec![Action::Modified {
                        id: "m1".into(),
                        type_name: MEDIA_TYPE_NAME.into(),
                        sets: json!({ "name": "b.txt" }),
                    }],
                },
            ],
        };
        let updates = action.media_updates().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].kind, MediaUpdateKind::Created);
        assert_eq!(updates[1].kind, MediaUpdateKind::Modified);
        assert_eq!(updates[1].info.name.as_deref(), Some("b.txt"));
        assert_eq!(action.leaf_count(), 3);
    }

    #[test]
    fn event_positions_by_raw_id() {
        let p = partition();
        let event = Event::command(Action::Frozen { id: "root".into() }).with_event_id(&p, 7);
        assert_eq!(event.event_id_for(&p), Some(7));
        assert!(!event.is_multi_partition());
        assert!(event.is_frozen());
    }

    #[test]
    fn action_wire_form_is_tagged() {
        let action = Action::Destroyed { id: "x".into(), type_name: "Entity".into() };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "DESTROYED");
        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn event_log_bounds() {
        let mut log = EventLogInfo::starting_at(3);
        assert!(log.is_empty());
        assert_eq!(log.next_event_id(), 3);
        log.last_event_id = Some(5);
        assert_eq!(log.next_event_id(), 6);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn queue_advance_and_lookup() {
        let mut queue = CommandQueueInfo::starting_at(10);
        let ids: Vec<CommandId> = (0..3).map(|_| CommandId::new()).collect();
        queue.command_ids.extend(ids.iter().cloned());
        assert_eq!(queue.last_event_id(), Some(12));
        assert_eq!(queue.command_id_at(11), Some(&ids[1]));
        assert_eq!(queue.command_id_at(9), None);

        queue.advance_to(12);
        assert_eq!(queue.first_event_id, 12);
        assert_eq!(queue.command_ids, vec![ids[2].clone()]);

        queue.advance_to(20);
        assert!(queue.is_empty());
        assert_eq!(queue.next_event_id(), 20);
    }
}
