//! Client side of the occupancy feed.
//!
//! A `SyncClient` keeps a local `OccupancyView` up to date from a
//! `FeedSource`: the in-process `OccupancyFeed` or a remote server through
//! `HttpFeedSource`. It prefers the push stream and falls back to polling
//! snapshots when push is unavailable.

mod client;
mod source;
mod sse;
mod view;

pub use client::{SyncClient, SyncConfig, SyncHandle, SyncMode, SyncStatus};
pub use source::{DEFAULT_PUSH_IDLE_TIMEOUT, FeedSource, FeedStream, HttpFeedSource, SyncError};
pub use view::OccupancyView;
