//! Result cache: the gateway's view into otherwise-fire-and-forget acks.
//!
//! An `AckConsumer` task drains the acks topic into a TTL-bounded map; the
//! gateway's long-poll handler reads the same map. A sweeper task evicts
//! expired entries so the map doesn't grow without bound across a long
//! uptime in standalone mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{Broker, Subscription};
use crate::config::Config;
use crate::envelope::{decode_ack, Ack, AckStatus};

struct CacheEntry {
    ack: Ack,
    expires_at: Instant,
}

/// Outcome of looking up a trace id in the result cache.
pub enum Lookup {
    /// The command finished; here is its terminal ack.
    Found(Ack),
    /// Still in flight (or never submitted, which looks identical from the
    /// cache's point of view).
    Pending,
    /// Finished long enough ago that its entry was swept.
    Expired,
}

pub struct ResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Record a terminal ack. A later `SUCCESS` always overwrites an
    /// earlier `FAILURE` for the same trace id; a later `FAILURE` never
    /// overwrites a recorded `SUCCESS`, since a duplicate delivery that
    /// somehow re-derives failure must not mask a result already handed to
    /// a caller.
    pub async fn insert(&self, ack: Ack) {
        let mut entries = self.entries.write().await;
        let expires_at = Instant::now() + self.ttl;
        match entries.get(&ack.trace_id) {
            Some(existing) if existing.ack.status == AckStatus::Success && ack.status == AckStatus::Failure => {}
            _ => {
                entries.insert(ack.trace_id.clone(), CacheEntry { ack, expires_at });
            }
        }
    }

    pub async fn lookup(&self, trace_id: &str) -> Lookup {
        let entries = self.entries.read().await;
        match entries.get(trace_id) {
            Some(entry) if entry.expires_at > Instant::now() => Lookup::Found(entry.ack.clone()),
            Some(_) => Lookup::Expired,
            None => Lookup::Pending,
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        self.entries.write().await.retain(|_, entry| entry.expires_at > now);
    }
}

/// Drains the acks topic into the shared result cache.
pub async fn run_ack_consumer(broker: Arc<dyn Broker>, config: Arc<Config>, cache: Arc<ResultCache>, cancel: CancellationToken) {
    let mut sub = match broker.subscribe(&config.acks_topic, &config.consumer_group_ackcache).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(error = %e, "ack consumer failed to subscribe");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("ack consumer shutting down");
                return;
            }
            delivery = sub.recv() => {
                let Some(delivery) = delivery else { return };
                match decode_ack(&delivery.message) {
                    Ok(ack) => cache.insert(ack).await,
                    Err(e) => warn!(error = %e, "dropping malformed ack"),
                }
                if let Err(e) = sub.commit(&delivery).await {
                    warn!(error = %e, "failed to commit ack consumer offset");
                }
            }
        }
    }
}

/// Periodically evicts expired cache entries.
pub async fn run_sweeper(cache: Arc<ResultCache>, cancel: CancellationToken) {
    let interval = (cache.ttl / 4).max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => cache.sweep().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(trace_id: &str) -> Ack {
        Ack::success(trace_id, "idem", "MessageCreated", serde_json::json!({"id": 1}))
    }

    fn failure(trace_id: &str) -> Ack {
        Ack::failure(trace_id, "idem", "NOT_FOUND", "missing")
    }

    #[tokio::test]
    async fn pending_until_inserted_then_found() {
        let cache = ResultCache::new(Duration::from_secs(60));
        assert!(matches!(cache.lookup("t1").await, Lookup::Pending));
        cache.insert(success("t1")).await;
        assert!(matches!(cache.lookup("t1").await, Lookup::Found(_)));
    }

    #[tokio::test]
    async fn success_is_not_overwritten_by_a_later_failure() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.insert(success("t1")).await;
        cache.insert(failure("t1")).await;
        match cache.lookup("t1").await {
            Lookup::Found(ack) => assert_eq!(ack.status, AckStatus::Success),
            _ => panic!("expected Found"),
        }
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        let cache = Arc::new(ResultCache::new(Duration::from_millis(20)));
        cache.insert(success("t1")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.sweep().await;
        assert!(matches!(cache.lookup("t1").await, Lookup::Expired));
    }
}
