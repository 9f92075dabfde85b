//! Occupancy feed - push events and snapshot reads.
//!
//! Events are published from inside the slot's commit, so per slot they reach
//! the broadcast channel in commit order. Subscribers start with a snapshot
//! and get a fresh one whenever they fall behind the channel; consumers apply
//! both idempotently using the revision carried on every entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::pool::{BlockId, SlotId, SlotStatus, SlotStore, Transition};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Events buffered per subscriber before it is considered lagging.
    pub capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: std::env::var("PARKD_FEED_CAPACITY")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|&c| c > 0)
                .unwrap_or(1024),
        }
    }
}

/// One committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEvent {
    pub block: BlockId,
    pub number: u32,
    pub status: SlotStatus,
    pub timestamp: DateTime<Utc>,
    pub revision: u64,
}

impl OccupancyEvent {
    pub fn from_transition(transition: &Transition, timestamp: DateTime<Utc>) -> Self {
        Self {
            block: transition.slot.block,
            number: transition.slot.number,
            status: transition.current.status(),
            timestamp,
            revision: transition.revision,
        }
    }

    pub fn slot(&self) -> SlotId {
        SlotId::new(self.block, self.number)
    }
}

/// Snapshot entry for a non-available slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub block: BlockId,
    pub number: u32,
    pub status: SlotStatus,
    pub revision: u64,
}

impl SlotView {
    pub fn slot(&self) -> SlotId {
        SlotId::new(self.block, self.number)
    }
}

/// What push consumers receive: an array is a full snapshot, an object a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedMessage {
    Snapshot(Vec<SlotView>),
    Delta(OccupancyEvent),
}

struct FeedInner {
    store: Arc<dyn SlotStore>,
    tx: broadcast::Sender<OccupancyEvent>,
    closed: CancellationToken,
}

/// Fan-out of occupancy changes plus snapshot queries over the slot store.
#[derive(Clone)]
pub struct OccupancyFeed {
    inner: Arc<FeedInner>,
}

impl std::fmt::Debug for OccupancyFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OccupancyFeed")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl OccupancyFeed {
    pub fn new(store: Arc<dyn SlotStore>, config: FeedConfig) -> Self {
        let (tx, _) = broadcast::channel(config.capacity.max(1));
        Self {
            inner: Arc::new(FeedInner {
                store,
                tx,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Fire-and-forget; having no subscribers is not an error.
    pub fn publish(&self, event: OccupancyEvent) {
        let slot = event.slot();
        match self.inner.tx.send(event) {
            Ok(receivers) => {
                tracing::trace!(slot = %slot, receivers, "Occupancy event published");
            }
            Err(_) => {
                tracing::trace!(slot = %slot, "Occupancy event dropped - no subscribers");
            }
        }
    }

    /// Every non-available slot, block-then-number order.
    pub fn snapshot(&self) -> Vec<SlotView> {
        self.snapshot_with_horizon().1
    }

    /// Snapshot plus the store revision read before it was taken. Every
    /// commit at or below that revision is reflected in the snapshot.
    fn snapshot_with_horizon(&self) -> (u64, Vec<SlotView>) {
        let horizon = self.inner.store.revision();
        let mut views = Vec::new();
        self.inner.store.for_each(&mut |slot| {
            if !slot.status().is_available() {
                views.push(SlotView {
                    block: slot.id.block,
                    number: slot.id.number,
                    status: slot.status(),
                    revision: slot.revision,
                });
            }
        });
        (horizon, views)
    }

    pub fn subscribe(&self) -> FeedSubscription {
        FeedSubscription {
            rx: self.inner.tx.subscribe(),
            feed: self.clone(),
            needs_snapshot: true,
            horizon: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// End every subscription. Publishing still works but nobody listens.
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            tracing::info!(subscribers = self.subscriber_count(), "Closing occupancy feed");
            self.inner.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

/// A live subscription: a snapshot first, then deltas newer than the last
/// snapshot sent.
pub struct FeedSubscription {
    rx: broadcast::Receiver<OccupancyEvent>,
    feed: OccupancyFeed,
    needs_snapshot: bool,
    /// Deltas at or below this revision are already in the last snapshot.
    horizon: u64,
}

impl FeedSubscription {
    /// Next message, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<FeedMessage> {
        if self.feed.is_closed() {
            return None;
        }

        if self.needs_snapshot {
            self.needs_snapshot = false;
            return Some(self.resync());
        }

        loop {
            let received = tokio::select! {
                _ = self.feed.inner.closed.cancelled() => return None,
                received = self.rx.recv() => received,
            };
            match received {
                Ok(event) if event.revision <= self.horizon => {
                    tracing::trace!(
                        slot = %event.slot(),
                        revision = event.revision,
                        "Skipping delta already in snapshot"
                    );
                }
                Ok(event) => return Some(FeedMessage::Delta(event)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Feed subscriber lagged - resending snapshot");
                    return Some(self.resync());
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn resync(&mut self) -> FeedMessage {
        let (horizon, views) = self.feed.snapshot_with_horizon();
        self.horizon = horizon;
        FeedMessage::Snapshot(views)
    }

    pub fn into_stream(self) -> impl Stream<Item = FeedMessage> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let message = sub.next().await?;
            Some((message, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Hold, HoldToken, SlotPool, SlotState};

    fn id(block: char, number: u32) -> SlotId {
        SlotId::new(BlockId::new(block).unwrap(), number)
    }

    fn setup(capacity: usize) -> (Arc<SlotPool>, OccupancyFeed) {
        let pool = Arc::new(SlotPool::new("A:3,B:2".parse().unwrap()));
        let feed = OccupancyFeed::new(pool.clone(), FeedConfig { capacity });
        (pool, feed)
    }

    fn occupy(pool: &SlotPool, feed: &OccupancyFeed, slot: SlotId) {
        let now = Utc::now();
        pool.compare_and_set(
            slot,
            SlotStatus::Available,
            SlotState::Occupied(Hold {
                holder: HoldToken::new("u"),
                started_at: now,
            }),
            &mut |t| feed.publish(OccupancyEvent::from_transition(t, now)),
        )
        .unwrap();
    }

    #[test]
    fn snapshot_lists_only_non_available_slots() {
        let (pool, feed) = setup(8);
        assert!(feed.snapshot().is_empty());

        occupy(&pool, &feed, id('B', 2));
        occupy(&pool, &feed, id('A', 3));

        let slots: Vec<String> = feed.snapshot().iter().map(|v| v.slot().to_string()).collect();
        assert_eq!(slots, vec!["A3", "B2"]);
    }

    #[tokio::test]
    async fn subscription_starts_with_snapshot_then_deltas() {
        let (pool, feed) = setup(8);
        occupy(&pool, &feed, id('A', 1));

        let mut sub = feed.subscribe();
        let first = sub.next().await.unwrap();
        match first {
            FeedMessage::Snapshot(views) => assert_eq!(views.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }

        occupy(&pool, &feed, id('A', 2));
        match sub.next().await.unwrap() {
            FeedMessage::Delta(event) => {
                assert_eq!(event.slot(), id('A', 2));
                assert_eq!(event.status, SlotStatus::Occupied);
                assert_eq!(event.revision, 2);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_fresh_snapshot() {
        let (pool, feed) = setup(1);
        let mut sub = feed.subscribe();
        assert!(matches!(sub.next().await, Some(FeedMessage::Snapshot(_))));

        occupy(&pool, &feed, id('A', 1));
        occupy(&pool, &feed, id('A', 2));
        occupy(&pool, &feed, id('A', 3));

        match sub.next().await.unwrap() {
            FeedMessage::Snapshot(views) => assert_eq!(views.len(), 3),
            other => panic!("expected snapshot after lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deltas_committed_before_first_snapshot_are_not_replayed() {
        use crate::sync::OccupancyView;

        let (pool, feed) = setup(8);
        let mut sub = feed.subscribe();

        // Commits land between subscribe() and the snapshot being read.
        occupy(&pool, &feed, id('A', 1));
        pool.compare_and_set(id('A', 1), SlotStatus::Occupied, SlotState::Available, &mut |t| {
            feed.publish(OccupancyEvent::from_transition(t, Utc::now()))
        })
        .unwrap();

        let mut view = OccupancyView::default();
        let first = sub.next().await.unwrap();
        assert_eq!(first, FeedMessage::Snapshot(vec![]));
        view.apply(first);

        let stale = tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await;
        assert!(stale.is_err(), "unexpected message {stale:?}");
        assert_eq!(view.status(id('A', 1)), SlotStatus::Available);

        occupy(&pool, &feed, id('A', 2));
        match sub.next().await.unwrap() {
            FeedMessage::Delta(event) => {
                assert_eq!(event.slot(), id('A', 2));
                assert_eq!(event.revision, 3);
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let (_pool, feed) = setup(8);
        let mut sub = feed.subscribe();
        sub.next().await.unwrap();

        let waiter = tokio::spawn(async move { sub.next().await });
        feed.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(feed.subscribe().next().await.is_none());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let (pool, feed) = setup(8);
        occupy(&pool, &feed, id('B', 1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn wire_shapes() {
        let snapshot = FeedMessage::Snapshot(vec![SlotView {
            block: BlockId::new('C').unwrap(),
            number: 4,
            status: SlotStatus::Occupied,
            revision: 9,
        }]);
        insta::assert_json_snapshot!(snapshot, @r#"
        [
          {
            "block": "C",
            "number": 4,
            "status": "occupied",
            "revision": 9
          }
        ]
        "#);

        let delta = FeedMessage::Delta(OccupancyEvent {
            block: BlockId::new('A').unwrap(),
            number: 1,
            status: SlotStatus::Available,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            revision: 3,
        });
        insta::assert_json_snapshot!(delta, @r#"
        {
          "block": "A",
          "number": 1,
          "status": "available",
          "timestamp": "1970-01-01T00:00:00Z",
          "revision": 3
        }
        "#);
    }

    #[test]
    fn decodes_either_shape() {
        let array: FeedMessage =
            serde_json::from_str(r#"[{"block":"A","number":1,"status":"reserved","revision":1}]"#)
                .unwrap();
        assert!(matches!(array, FeedMessage::Snapshot(ref v) if v.len() == 1));

        let object: FeedMessage = serde_json::from_str(
            r#"{"block":"B","number":2,"status":"occupied","timestamp":"2024-05-01T10:00:00Z","revision":7}"#,
        )
        .unwrap();
        assert!(matches!(object, FeedMessage::Delta(ref e) if e.revision == 7));
    }
}
