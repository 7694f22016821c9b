//! Polling-based reconciliation for active rides.
//!
//! There is no push transport; a background task refreshes a shared snapshot
//! on a fixed interval. Merging is defensive about what a poll returns:
//! duplicates collapse by ride id and a stale row never overwrites a fresher
//! one already in the snapshot.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::db::rides::{Ride, RideStore};

pub const DEFAULT_REFRESH_SECS: u64 = 30;

#[derive(Clone, Default)]
pub struct RideFeed {
    snapshot: Arc<Mutex<Vec<Ride>>>,
}

impl RideFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Ride> {
        self.snapshot.lock().expect("feed lock poisoned").clone()
    }

    pub fn apply(&self, incoming: Vec<Ride>) {
        let mut snapshot = self.snapshot.lock().expect("feed lock poisoned");
        *snapshot = merge(&snapshot, incoming);
    }
}

/// Membership follows the poll (terminal rides drop out), but per ride id the
/// freshest version wins, whichever side it came from.
fn merge(existing: &[Ride], incoming: Vec<Ride>) -> Vec<Ride> {
    let mut merged: Vec<Ride> = Vec::with_capacity(incoming.len());
    for ride in incoming {
        if let Some(already) = merged.iter_mut().find(|r| r.id == ride.id) {
            if ride.updated_at > already.updated_at {
                *already = ride;
            }
            continue;
        }
        match existing
            .iter()
            .find(|r| r.id == ride.id && r.updated_at > ride.updated_at)
        {
            Some(fresher) => merged.push(fresher.clone()),
            None => merged.push(ride),
        }
    }
    merged
}

/// Refreshes the feed from the active partition on a fixed interval. Poll
/// failures are logged and the next tick tries again.
pub fn spawn_refresh(store: RideStore, feed: RideFeed, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match store.list_active().await {
                Ok(rides) => feed.apply(rides),
                Err(err) => tracing::error!("active ride poll failed: {err}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn merge_deduplicates_by_id() {
        let ride = testing::sample_ride();
        let merged = merge(&[], vec![ride.clone(), ride.clone()]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn stale_poll_does_not_overwrite_fresher_row() {
        let fresh = testing::sample_ride();
        let mut stale = fresh.clone();
        stale.updated_at = fresh.updated_at - ChronoDuration::seconds(45);
        stale.status = crate::db::rides::RideStatus::Scheduled;

        let merged = merge(std::slice::from_ref(&fresh), vec![stale]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].updated_at, fresh.updated_at);
    }

    #[test]
    fn rides_gone_from_the_poll_drop_out() {
        let known = testing::sample_ride();
        let merged = merge(std::slice::from_ref(&known), Vec::new());
        assert!(merged.is_empty());
    }

    #[tokio::test]
    async fn refresh_task_populates_the_snapshot() {
        let pool = testing::memory_pool().await;
        let store = RideStore::new(pool.clone());
        let ride = testing::sample_ride();
        let mut conn = pool.acquire().await.unwrap();
        store.insert_ride(&mut conn, &ride).await.unwrap();
        drop(conn);

        let feed = RideFeed::new();
        let handle = spawn_refresh(store, feed.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();

        let snapshot = feed.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, ride.id);
    }
}
