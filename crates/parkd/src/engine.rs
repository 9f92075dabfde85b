//! Allocation engine - Allocate and Release on top of compare-and-set.
//!
//! Neither operation blocks beyond a single slot lock, and neither retries
//! internally: a lost race during Allocate moves on to the next slot, and a
//! lost race during Release is reported as `AlreadyFree`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::clock::Clock;
use crate::feed::{OccupancyEvent, OccupancyFeed};
use crate::pool::{CasError, Hold, HoldToken, SlotId, SlotState, SlotStatus, SlotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocateError {
    #[error("No available slots")]
    NoCapacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReleaseError {
    #[error("Invalid slot")]
    InvalidSlot,
    #[error("Slot is already free")]
    AlreadyFree,
}

/// How long a hold lasted, in whole minutes. Displays as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HoldDuration {
    minutes: u64,
}

impl HoldDuration {
    pub fn from_minutes(minutes: u64) -> Self {
        Self { minutes }
    }

    /// Seconds are truncated; a clock that went backwards yields zero.
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let minutes = (end - start).num_minutes().max(0);
        Self {
            minutes: u64::try_from(minutes).unwrap_or(0),
        }
    }

    pub fn minutes(&self) -> u64 {
        self.minutes
    }
}

impl fmt::Display for HoldDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

impl Serialize for HoldDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

pub struct AllocationEngine {
    store: Arc<dyn SlotStore>,
    feed: OccupancyFeed,
    clock: Arc<dyn Clock>,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn SlotStore>, feed: OccupancyFeed, clock: Arc<dyn Clock>) -> Self {
        Self { store, feed, clock }
    }

    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.store
    }

    pub fn feed(&self) -> &OccupancyFeed {
        &self.feed
    }

    pub fn capacity(&self) -> usize {
        self.store.layout().total_slots()
    }

    pub fn available(&self) -> usize {
        self.store.available()
    }

    fn publish(&self, transition: &crate::pool::Transition) {
        self.feed
            .publish(OccupancyEvent::from_transition(transition, self.clock.now()));
    }

    /// Hold the first available slot in layout order.
    ///
    /// Each slot is tried exactly once; losing a race on one slot moves on
    /// to the next, so the scan is bounded by the pool size.
    pub fn allocate(&self, holder: HoldToken) -> Result<SlotId, AllocateError> {
        let started_at = self.clock.now();

        for id in self.store.layout().slot_ids() {
            let next = SlotState::Occupied(Hold {
                holder: holder.clone(),
                started_at,
            });
            match self.store.compare_and_set(
                id,
                SlotStatus::Available,
                next,
                &mut |t| self.publish(t),
            ) {
                Ok(_) => {
                    tracing::info!(slot = %id, holder = %holder, "Slot allocated");
                    return Ok(id);
                }
                Err(CasError::Mismatch { .. }) => continue,
                Err(CasError::NotFound) => {
                    tracing::error!(slot = %id, "Layout lists a slot the store does not have");
                }
            }
        }

        tracing::warn!(holder = %holder, "Allocation failed - no available slots");
        Err(AllocateError::NoCapacity)
    }

    /// End the hold on `id` and report how long it lasted.
    ///
    /// The duration comes from the hold the compare-and-set actually
    /// replaced, so a concurrent release of the same slot cannot report a
    /// second duration.
    pub fn release(&self, id: SlotId) -> Result<HoldDuration, ReleaseError> {
        if !self.store.layout().contains(id) {
            return Err(ReleaseError::InvalidSlot);
        }

        let observed = self.store.get(id).ok_or(ReleaseError::InvalidSlot)?;
        if observed.status().is_available() {
            return Err(ReleaseError::AlreadyFree);
        }

        let transition = match self.store.compare_and_set(
            id,
            observed.status(),
            SlotState::Available,
            &mut |t| self.publish(t),
        ) {
            Ok(transition) => transition,
            Err(CasError::NotFound) => return Err(ReleaseError::InvalidSlot),
            Err(CasError::Mismatch { actual }) => {
                tracing::debug!(slot = %id, actual = %actual, "Release lost a race");
                return Err(ReleaseError::AlreadyFree);
            }
        };

        let ended_at = self.clock.now();
        let (holder, duration) = match transition.previous.hold() {
            Some(hold) => (
                Some(&hold.holder),
                HoldDuration::between(hold.started_at, ended_at),
            ),
            None => (None, HoldDuration::from_minutes(0)),
        };

        tracing::info!(
            slot = %id,
            holder = holder.map(HoldToken::as_str).unwrap_or_default(),
            duration = %duration,
            "Slot released"
        );
        Ok(duration)
    }
}
