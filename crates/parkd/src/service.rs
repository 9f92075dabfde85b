//! ParkingService: transport-agnostic facade over the slot pool.
//!
//! This service owns:
//! - The slot store and the allocation engine on top of it
//! - The occupancy feed
//! - Shutdown coordination
//!
//! Transports (HTTP today) delegate every operation here.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::clock::{Clock, SystemClock};
use crate::engine::{AllocateError, AllocationEngine, HoldDuration, ReleaseError};
use crate::feed::{FeedConfig, FeedSubscription, OccupancyFeed, SlotView};
use crate::pool::{BlockId, HoldToken, LotLayout, Slot, SlotId, SlotPool, SlotStore};
use crate::version::VersionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ready,
    /// Every slot is held.
    Full,
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub available: usize,
    pub capacity: usize,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_full(&self) -> bool {
        self.available == 0
    }

    pub fn status(&self) -> HealthStatus {
        if self.is_full() {
            HealthStatus::Full
        } else {
            HealthStatus::Ready
        }
    }
}

pub struct ParkingService {
    engine: AllocationEngine,
    version: VersionInfo,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ParkingService {
    /// In-memory pool for `layout` on the system clock.
    pub fn new(layout: LotLayout) -> Self {
        let version = VersionInfo::new().with_layout(layout.to_string());
        let store = Arc::new(SlotPool::new(layout));
        Self::with_parts(store, Arc::new(SystemClock), FeedConfig::default()).with_version(version)
    }

    pub fn with_parts(
        store: Arc<dyn SlotStore>,
        clock: Arc<dyn Clock>,
        feed_config: FeedConfig,
    ) -> Self {
        let feed = OccupancyFeed::new(Arc::clone(&store), feed_config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine: AllocationEngine::new(store, feed, clock),
            version: VersionInfo::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn engine(&self) -> &AllocationEngine {
        &self.engine
    }

    pub fn feed(&self) -> &OccupancyFeed {
        self.engine.feed()
    }

    pub fn layout(&self) -> &LotLayout {
        self.engine.store().layout()
    }

    /// Allocate for `holder`, or for a fresh anonymous token when absent.
    pub fn allocate(&self, holder: Option<HoldToken>) -> Result<SlotId, AllocateError> {
        let holder = holder.unwrap_or_else(|| {
            let token = HoldToken::anonymous();
            tracing::debug!(holder = %token, "Allocating for anonymous holder");
            token
        });
        self.engine.allocate(holder)
    }

    pub fn release(&self, id: SlotId) -> Result<HoldDuration, ReleaseError> {
        self.engine.release(id)
    }

    /// Non-available slots in block-then-number order.
    pub fn occupied(&self) -> Vec<SlotId> {
        let mut ids = Vec::new();
        self.engine.store().for_each(&mut |slot| {
            if !slot.status().is_available() {
                ids.push(slot.id);
            }
        });
        ids
    }

    /// Every slot grouped by block, in layout order.
    pub fn slots(&self) -> IndexMap<BlockId, Vec<Slot>> {
        let mut blocks: IndexMap<BlockId, Vec<Slot>> = self
            .layout()
            .blocks()
            .iter()
            .map(|spec| (spec.block, Vec::with_capacity(spec.capacity as usize)))
            .collect();
        self.engine.store().for_each(&mut |slot| {
            blocks.entry(slot.id.block).or_default().push(slot.clone());
        });
        blocks
    }

    pub fn snapshot(&self) -> Vec<SlotView> {
        self.feed().snapshot()
    }

    pub fn subscribe(&self) -> FeedSubscription {
        self.feed().subscribe()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            available: self.engine.available(),
            capacity: self.engine.capacity(),
            version: self.version.clone(),
        }
    }

    /// Close the feed so push connections end, then signal the server.
    pub fn trigger_shutdown(&self) {
        self.feed().close();
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

impl Default for ParkingService {
    fn default() -> Self {
        Self::new(LotLayout::default())
    }
}
