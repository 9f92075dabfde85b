//! parkd: parking slot allocation and live occupancy.

mod clock;
mod engine;
mod version;

pub mod feed;
pub mod pool;
pub mod service;
pub mod sync;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{AllocateError, AllocationEngine, HoldDuration, ReleaseError};
pub use feed::{FeedConfig, FeedMessage, FeedSubscription, OccupancyEvent, OccupancyFeed, SlotView};
pub use pool::{
    BlockId, HoldToken, LayoutError, LotLayout, SlotId, SlotPool, SlotState, SlotStatus, SlotStore,
};
pub use service::{HealthSnapshot, HealthStatus, ParkingService};
pub use sync::{
    FeedSource, HttpFeedSource, OccupancyView, SyncClient, SyncConfig, SyncError, SyncHandle,
    SyncMode, SyncStatus,
};
pub use version::{PARKD_VERSION, VersionInfo};
