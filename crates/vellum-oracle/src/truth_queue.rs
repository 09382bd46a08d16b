use std::collections::VecDeque;

use vellum_scribe::Finalizers;
use vellum_types::{Event, EventId};

/// A confirmed truth waiting for every earlier truth to be applied.
#[derive(Debug)]
pub struct TruthQueueEntry {
    pub event: Event,
    pub event_id: EventId,
    pub finalizers: Finalizers,
    /// Set while the entry is being applied. Diagnostic only; application
    /// is serialized by the session's apply lock.
    pub locked: bool,
    /// Commands purged when the entry was recorded.
    pub purged_commands: Option<Vec<Event>>,
}

impl TruthQueueEntry {
    pub fn new(event: Event, event_id: EventId, finalizers: Finalizers) -> Self {
        Self {
            event,
            event_id,
            finalizers,
            locked: false,
            purged_commands: None,
        }
    }
}

/// Truths keyed by their offset from the next expected event id.
///
/// Slot 0 holds the truth for `last_authorized + 1`; only that slot may be
/// applied. Later slots stay vacant until their truth arrives.
#[derive(Debug, Default)]
pub struct TruthQueue {
    slots: VecDeque<Option<TruthQueueEntry>>,
}

impl TruthQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_occupied(&self, offset: usize) -> bool {
        self.slots.get(offset).is_some_and(Option::is_some)
    }

    /// Place `entry` at `offset`. Returns `false` when the slot is taken or
    /// the offset is out of range.
    pub fn insert(&mut self, offset: usize, entry: TruthQueueEntry) -> bool {
        if self.is_occupied(offset) {
            return false;
        }
        let Some(len) = offset.checked_add(1) else {
            return false;
        };
        if self.slots.len() < len {
            self.slots.resize_with(len, || None);
        }
        self.slots[offset] = Some(entry);
        true
    }

    /// The entry at slot 0, if its truth has arrived.
    pub fn head(&self) -> Option<&TruthQueueEntry> {
        self.slots.front().and_then(Option::as_ref)
    }

    pub fn head_mut(&mut self) -> Option<&mut TruthQueueEntry> {
        self.slots.front_mut().and_then(Option::as_mut)
    }

    /// Remove slot 0, shifting every later slot down by one.
    pub fn pop_head(&mut self) -> Option<TruthQueueEntry> {
        match self.slots.front() {
            Some(Some(_)) => self.slots.pop_front().flatten(),
            _ => None,
        }
    }

    /// Number of truths waiting, excluding vacant slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_types::{Action, CommandId, PartitionUri};

    fn entry(event_id: EventId) -> TruthQueueEntry {
        let partition = PartitionUri::parse("vellum-local:///p").unwrap();
        let event = Event::for_partition(&partition, event_id, CommandId::new(), Action::Frozen { id: "x".into() });
        TruthQueueEntry::new(event, event_id, Finalizers::default())
    }

    #[test]
    fn only_slot_zero_is_the_head() {
        let mut queue = TruthQueue::new();
        assert!(queue.insert(2, entry(7)));
        assert!(queue.head().is_none());
        assert!(queue.pop_head().is_none());
        assert_eq!(queue.len(), 1);

        assert!(queue.insert(0, entry(5)));
        assert_eq!(queue.pop_head().unwrap().event_id, 5);
        // Slot 2 moved to slot 1.
        assert!(queue.is_occupied(1));
        assert!(queue.head().is_none());
    }

    #[test]
    fn occupied_slots_are_not_replaced() {
        let mut queue = TruthQueue::new();
        assert!(queue.insert(0, entry(1)));
        assert!(!queue.insert(0, entry(1)));
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn maximal_offset_is_rejected() {
        let mut queue = TruthQueue::new();
        assert!(!queue.insert(usize::MAX, entry(1)));
        assert!(queue.is_empty());
    }
}
