//! Local occupancy view maintained by a sync client.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::feed::{FeedMessage, OccupancyEvent, SlotView};
use crate::pool::{SlotId, SlotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    status: SlotStatus,
    revision: u64,
    timestamp: Option<DateTime<Utc>>,
}

/// Slot statuses as last seen by this client.
///
/// Slots with no entry are available. A snapshot replaces everything; a
/// delta only lands if it is newer than what the view already holds for
/// that slot, so redelivered or reordered events are harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccupancyView {
    slots: BTreeMap<SlotId, Entry>,
    own_slot: Option<SlotId>,
}

impl OccupancyView {
    /// Returns true if anything changed.
    pub fn apply(&mut self, message: FeedMessage) -> bool {
        match message {
            FeedMessage::Snapshot(views) => self.apply_snapshot(views),
            FeedMessage::Delta(event) => self.apply_event(&event),
        }
    }

    pub fn apply_snapshot(&mut self, views: Vec<SlotView>) -> bool {
        let slots: BTreeMap<SlotId, Entry> = views
            .into_iter()
            .filter(|v| !v.status.is_available())
            .map(|v| {
                (
                    v.slot(),
                    Entry {
                        status: v.status,
                        revision: v.revision,
                        timestamp: None,
                    },
                )
            })
            .collect();

        let incoming: BTreeMap<SlotId, SlotStatus> =
            slots.iter().map(|(id, e)| (*id, e.status)).collect();
        let changed = self.occupied_map() != incoming;
        self.slots = slots;
        changed
    }

    pub fn apply_event(&mut self, event: &OccupancyEvent) -> bool {
        let slot = event.slot();
        let incoming = Entry {
            status: event.status,
            revision: event.revision,
            timestamp: Some(event.timestamp),
        };

        if let Some(current) = self.slots.get(&slot) {
            let newer = incoming.revision > current.revision
                || (incoming.revision == current.revision && incoming.timestamp > current.timestamp);
            if !newer {
                tracing::trace!(slot = %slot, revision = event.revision, "Ignoring stale occupancy event");
                return false;
            }
        }

        let before = self.raw_status(slot);
        self.slots.insert(slot, incoming);
        before != event.status
    }

    fn raw_status(&self, slot: SlotId) -> SlotStatus {
        self.slots
            .get(&slot)
            .map_or(SlotStatus::Available, |e| e.status)
    }

    fn occupied_map(&self) -> BTreeMap<SlotId, SlotStatus> {
        self.slots
            .iter()
            .filter(|(_, e)| !e.status.is_available())
            .map(|(id, e)| (*id, e.status))
            .collect()
    }

    /// Status of `slot`, with the caller's own held slot shown as reserved.
    pub fn status(&self, slot: SlotId) -> SlotStatus {
        let status = self.raw_status(slot);
        if self.own_slot == Some(slot) && !status.is_available() {
            SlotStatus::Reserved
        } else {
            status
        }
    }

    /// Non-available slots in block-then-number order.
    pub fn occupied(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .filter(|(_, e)| !e.status.is_available())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn own_slot(&self) -> Option<SlotId> {
        self.own_slot
    }

    pub fn set_own_slot(&mut self, slot: Option<SlotId>) {
        self.own_slot = slot;
    }
}
