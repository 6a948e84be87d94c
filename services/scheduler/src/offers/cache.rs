//! Cache of unused offers.
//!
//! Offers the matcher could not use are held for a while instead of being
//! declined, so a later round can use them. Anything that leaves the cache
//! without being checked out is declined back to the master.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use lattice_id::OfferId;
use lattice_protocol::Offer;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::config::OfferCacheConfig;
use crate::transport::SchedulerClient;

/// Storage for offers that were not used this round.
#[async_trait]
pub trait OfferCache: Send + Sync {
    async fn enable(&self);

    async fn disable(&self);

    /// Takes ownership of an unused offer received at `timestamp_ms`.
    ///
    /// Returns the offers the cache declined instead of holding: the given
    /// offer when the cache is not taking offers, plus anything evicted to
    /// make room.
    async fn cache_offer(&self, timestamp_ms: i64, offer: Offer) -> Vec<OfferId>;

    /// Forgets an offer without declining it. Returns false if the offer was
    /// not held.
    async fn rescind_offer(&self, offer_id: &OfferId) -> bool;

    /// Removes and returns every held offer. The caller must accept, decline,
    /// or cache each one again.
    async fn checkout_offers(&self) -> Vec<CachedOffer>;
}

/// An offer held by the cache, with the timestamp it was cached under.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedOffer {
    pub offer: Offer,
    pub received_at_ms: i64,
}

#[derive(Debug, Default)]
struct CacheState {
    enabled: bool,
    offers: VecDeque<CachedOffer>,
}

/// Bounded, expiring offer cache kept in memory. Starts disabled.
pub struct InMemoryOfferCache {
    config: OfferCacheConfig,
    client: Arc<dyn SchedulerClient>,
    state: Mutex<CacheState>,
}

impl InMemoryOfferCache {
    pub fn new(config: OfferCacheConfig, client: Arc<dyn SchedulerClient>) -> Self {
        Self {
            config,
            client,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.offers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// IDs of held offers, oldest first.
    pub async fn held_ids(&self) -> Vec<OfferId> {
        let state = self.state.lock().await;
        state.offers.iter().map(|c| c.offer.id.clone()).collect()
    }

    /// Declines every offer cached at or before `now_ms - ttl`.
    pub async fn sweep_expired(&self, now_ms: i64) -> usize {
        let ttl_ms = self.config.ttl.as_millis() as i64;
        let expired: Vec<CachedOffer> = {
            let mut state = self.state.lock().await;
            let (expired, kept): (Vec<_>, Vec<_>) = state
                .offers
                .drain(..)
                .partition(|cached| now_ms.saturating_sub(cached.received_at_ms) >= ttl_ms);
            state.offers = kept.into();
            expired
        };

        let count = expired.len();
        for cached in &expired {
            debug!(
                offer_id = %cached.offer.id,
                received_at_ms = cached.received_at_ms,
                "Offer expired in cache"
            );
        }
        self.decline(expired.into_iter().map(|c| c.offer.id).collect(), "expired")
            .await;
        count
    }

    /// Sweeps expired offers until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            ttl_ms = self.config.ttl.as_millis() as u64,
            max_offers = self.config.max_offers,
            "Starting offer cache sweeper"
        );
        let mut interval = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_expired(chrono::Utc::now().timestamp_millis()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Offer cache sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn decline(&self, offer_ids: Vec<OfferId>, why: &'static str) {
        if offer_ids.is_empty() {
            return;
        }
        let count = offer_ids.len();
        if let Err(e) = self.client.decline(offer_ids).await {
            warn!(error = %e, count, why, "Failed to decline cached offers");
        } else {
            debug!(count, why, "Declined cached offers");
        }
    }
}

#[async_trait]
impl OfferCache for InMemoryOfferCache {
    async fn enable(&self) {
        let mut state = self.state.lock().await;
        if !state.enabled {
            info!("Offer cache enabled");
            state.enabled = true;
        }
    }

    async fn disable(&self) {
        let drained: Vec<OfferId> = {
            let mut state = self.state.lock().await;
            if state.enabled {
                info!("Offer cache disabled");
            }
            state.enabled = false;
            state.offers.drain(..).map(|c| c.offer.id).collect()
        };
        self.decline(drained, "cache disabled").await;
    }

    async fn cache_offer(&self, timestamp_ms: i64, offer: Offer) -> Vec<OfferId> {
        let rejected: Vec<OfferId> = {
            let mut state = self.state.lock().await;
            if !state.enabled || self.config.max_offers == 0 {
                vec![offer.id]
            } else {
                let mut evicted = Vec::new();
                while state.offers.len() >= self.config.max_offers {
                    if let Some(oldest) = state.offers.pop_front() {
                        evicted.push(oldest.offer.id);
                    }
                }
                debug!(offer_id = %offer.id, host = %offer.hostname, "Caching offer");
                state.offers.push_back(CachedOffer {
                    offer,
                    received_at_ms: timestamp_ms,
                });
                evicted
            }
        };
        self.decline(rejected.clone(), "not cacheable").await;
        rejected
    }

    async fn rescind_offer(&self, offer_id: &OfferId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.offers.len();
        state.offers.retain(|cached| &cached.offer.id != offer_id);
        let removed = state.offers.len() < before;
        if removed {
            debug!(offer_id = %offer_id, "Removed offer from cache");
        }
        removed
    }

    async fn checkout_offers(&self) -> Vec<CachedOffer> {
        let mut state = self.state.lock().await;
        state.offers.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{offer, RecordingClient};

    fn cache(max_offers: usize) -> (Arc<RecordingClient>, InMemoryOfferCache) {
        let client = Arc::new(RecordingClient::new());
        let config = OfferCacheConfig {
            ttl: Duration::from_secs(30),
            max_offers,
            sweep_interval: Duration::from_secs(1),
        };
        (client.clone(), InMemoryOfferCache::new(config, client))
    }

    fn id(value: &str) -> OfferId {
        OfferId::new(value).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_cache_declines() {
        let (client, cache) = cache(10);
        let declined = cache.cache_offer(1, offer("o1", "h1", 1.0, 1.0)).await;
        assert_eq!(declined, vec![id("o1")]);
        assert!(cache.is_empty().await);
        assert_eq!(client.declined_ids(), vec![id("o1")]);
    }

    #[tokio::test]
    async fn test_full_cache_evicts_oldest() {
        let (client, cache) = cache(2);
        cache.enable().await;
        cache.cache_offer(1, offer("o1", "h1", 1.0, 1.0)).await;
        cache.cache_offer(2, offer("o2", "h2", 1.0, 1.0)).await;
        let declined = cache.cache_offer(3, offer("o3", "h3", 1.0, 1.0)).await;

        assert_eq!(declined, vec![id("o1")]);
        assert_eq!(cache.held_ids().await, vec![id("o2"), id("o3")]);
        assert_eq!(client.declined_ids(), vec![id("o1")]);
    }

    #[tokio::test]
    async fn test_rescind_removes_without_decline() {
        let (client, cache) = cache(10);
        cache.enable().await;
        assert!(cache.cache_offer(1, offer("o1", "h1", 1.0, 1.0)).await.is_empty());
        assert!(cache.rescind_offer(&id("o1")).await);
        assert!(!cache.rescind_offer(&id("o1")).await);

        assert!(cache.is_empty().await);
        assert!(client.declined_ids().is_empty());
    }

    #[tokio::test]
    async fn test_disable_declines_everything_held() {
        let (client, cache) = cache(10);
        cache.enable().await;
        cache.cache_offer(1, offer("o1", "h1", 1.0, 1.0)).await;
        cache.cache_offer(1, offer("o2", "h2", 1.0, 1.0)).await;
        cache.disable().await;

        assert!(!cache.is_enabled().await);
        assert!(cache.is_empty().await);
        assert_eq!(client.declined_ids(), vec![id("o1"), id("o2")]);
    }

    #[tokio::test]
    async fn test_sweep_declines_expired() {
        let (client, cache) = cache(10);
        cache.enable().await;
        cache.cache_offer(1_000, offer("o1", "h1", 1.0, 1.0)).await;
        cache.cache_offer(20_000, offer("o2", "h2", 1.0, 1.0)).await;

        assert_eq!(cache.sweep_expired(30_999).await, 0);
        assert_eq!(cache.sweep_expired(31_000).await, 1);
        assert_eq!(client.declined_ids(), vec![id("o1")]);
        assert_eq!(cache.held_ids().await, vec![id("o2")]);
    }

    #[tokio::test]
    async fn test_checkout_hands_offers_over() {
        let (client, cache) = cache(10);
        cache.enable().await;
        cache.cache_offer(7, offer("o1", "h1", 1.0, 1.0)).await;

        let offers = cache.checkout_offers().await;
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].offer.id, id("o1"));
        assert_eq!(offers[0].received_at_ms, 7);
        assert!(cache.is_empty().await);
        assert!(client.declined_ids().is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (_client, cache) = cache(10);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::new(cache).run_sweep(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
