//! Offer pipeline: gate, admissibility, matching, launch, cache.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use lattice_id::OfferId;
use lattice_protocol::Offer;
use tracing::{debug, info, warn};

use super::SchedulerCoordinator;
use crate::collaborators::OfferCheck;
use crate::error::{SchedulerError, SchedulerResult};
use crate::gate::SchedulerAction;
use crate::lock::OffersGuard;
use crate::offers::{OfferBatchSummary, OfferLedger, OfferOutcome};

impl SchedulerCoordinator {
    /// Handles a batch of offers. Every offer ends up declined, cached, or
    /// accepted exactly once.
    ///
    /// A pipeline failure declines what is left, stops the coordinator, and
    /// requests an abort before the error is returned.
    pub async fn resource_offers(&self, offers: Vec<Offer>) -> SchedulerResult<OfferBatchSummary> {
        let received_at = chrono::Utc::now().timestamp_millis();
        info!(count = offers.len(), "Received offers");
        for offer in &offers {
            debug!(
                offer_id = %offer.id,
                roles = ?offer.roles(),
                host = %offer.hostname,
                agent_id = %offer.agent_id,
                cpus = offer.cpus(),
                memory_mb = offer.memory_mb(),
                ports = offer.port_count(),
                disk_mb = offer.disk_mb(),
                "Received offer"
            );
        }

        if !self.is_running() {
            info!(state = %self.state(), count = offers.len(), "Scheduler not running, declining offers");
            let mut ledger = OfferLedger::new(&offers);
            self.decline_offers(&mut ledger, ids(&offers)).await;
            return Ok(ledger.finish(0));
        }

        let result = {
            let guard = self.inner.lock.lock_offers("resourceOffers").await;
            self.process_offers_locked(&guard, received_at, offers).await
        };

        if let Err(err) = &result {
            self.fail("resourceOffers", err).await;
        }
        result
    }

    async fn process_offers_locked(
        &self,
        _guard: &OffersGuard<'_>,
        received_at: i64,
        offers: Vec<Offer>,
    ) -> SchedulerResult<OfferBatchSummary> {
        let started = Instant::now();
        self.inner
            .last_offer_timestamp
            .store(received_at, std::sync::atomic::Ordering::Release);
        let mut ledger = OfferLedger::new(&offers);
        let deps = self.deps();
        let config = &self.inner.config;

        if deps.gate.is_disabled(SchedulerAction::ProcessOffers) {
            info!(count = offers.len(), "Offer processing disabled, declining offers");
            self.decline_offers(&mut ledger, ids(&offers)).await;
            return Ok(ledger.finish(elapsed_ms(started)));
        }

        if config.delay_offers_for_status_delta {
            let average = deps.status_delta.get();
            if average > config.delay_when_delta_over_ms {
                info!(
                    status_update_delta_ms = average,
                    threshold_ms = config.delay_when_delta_over_ms,
                    count = offers.len(),
                    "Status updates are lagging, declining offers"
                );
                self.decline_offers(&mut ledger, ids(&offers)).await;
                return Ok(ledger.finish(elapsed_ms(started)));
            }
        }

        if config.cache_offers {
            if deps.gate.is_disabled(SchedulerAction::CacheOffers) {
                deps.offer_cache.disable().await;
            } else {
                deps.offer_cache.enable().await;
            }
        }

        // Cached offers rejoin the round and are resolved with the batch.
        let mut candidates = offers;
        let mut cached_at: HashMap<OfferId, i64> = HashMap::new();
        for cached in deps.offer_cache.checkout_offers().await {
            if ledger.add_reused(&cached.offer.id) {
                cached_at.insert(cached.offer.id.clone(), cached.received_at_ms);
                candidates.push(cached.offer);
            }
        }
        if !cached_at.is_empty() {
            debug!(count = cached_at.len(), "Reusing cached offers");
        }

        let mut working = Vec::with_capacity(candidates.len());
        let mut not_accepting = Vec::new();
        for offer in candidates {
            match deps.host_health.check_offer(&offer).await {
                OfferCheck::Accepting => working.push(offer),
                OfferCheck::NotAcceptingTasks => {
                    debug!(offer_id = %offer.id, host = %offer.hostname, "Host not accepting tasks");
                    not_accepting.push(offer.id);
                }
            }
        }
        self.decline_offers(&mut ledger, not_accepting).await;

        if !working.is_empty() {
            let timestamps = CacheTimestamps {
                batch: received_at,
                reused: &cached_at,
            };
            if let Err(err) = self.match_and_launch(&timestamps, working, &mut ledger).await {
                // Offers still held by the cache come back out so the decline
                // below is their only resolution. Anything the cache already let
                // go of was declined on the way out.
                for offer_id in ledger.cached() {
                    if deps.offer_cache.rescind_offer(&offer_id).await {
                        ledger.reopen(&offer_id);
                    } else {
                        ledger.cache_declined(&offer_id);
                    }
                }
                let leftover = ledger.unresolved();
                warn!(
                    error = %err,
                    declining = leftover.len(),
                    "Offer pipeline failed, declining unaccepted offers"
                );
                self.decline_offers(&mut ledger, leftover).await;
                ledger.finish(elapsed_ms(started));
                return Err(err);
            }
        }

        Ok(ledger.finish(elapsed_ms(started)))
    }

    async fn match_and_launch(
        &self,
        timestamps: &CacheTimestamps<'_>,
        offers: Vec<Offer>,
        ledger: &mut OfferLedger,
    ) -> SchedulerResult<()> {
        let deps = self.deps();
        let holders = deps
            .matcher
            .check_offers(offers.clone())
            .await
            .map_err(SchedulerError::Matcher)?;

        let mut seen: HashSet<OfferId> = HashSet::new();
        for holder in holders {
            seen.extend(holder.offer_ids());

            if !holder.has_accepted_tasks() {
                for offer in holder.into_offers() {
                    self.cache_offer(ledger, timestamps.of(&offer), offer).await;
                }
                continue;
            }

            let unused = holder
                .launch_tasks_and_get_unused_offers(deps.client.as_ref())
                .await
                .map_err(SchedulerError::Launch)?;
            let unused_ids: HashSet<&OfferId> = unused.iter().map(|o| &o.id).collect();
            for offer in holder.offers() {
                if !unused_ids.contains(&offer.id) {
                    ledger.resolve(&offer.id, OfferOutcome::Accepted);
                }
            }
            for offer in unused {
                self.cache_offer(ledger, timestamps.of(&offer), offer).await;
            }
        }

        for offer in offers {
            if !seen.contains(&offer.id) {
                warn!(offer_id = %offer.id, host = %offer.hostname, "Matcher dropped offer, caching it");
                self.cache_offer(ledger, timestamps.of(&offer), offer).await;
            }
        }
        Ok(())
    }

    async fn cache_offer(&self, ledger: &mut OfferLedger, timestamp_ms: i64, offer: Offer) {
        if !ledger.resolve(&offer.id, OfferOutcome::Cached) {
            return;
        }
        // Whatever the cache declined instead of holding, including evictions
        // of offers from this batch, is recorded as declined.
        for offer_id in self.deps().offer_cache.cache_offer(timestamp_ms, offer).await {
            ledger.cache_declined(&offer_id);
        }
    }

    /// Declines the given offers and records them in the ledger. Offers the
    /// ledger has already resolved are skipped.
    async fn decline_offers(&self, ledger: &mut OfferLedger, offer_ids: Vec<OfferId>) {
        let offer_ids: Vec<OfferId> = offer_ids
            .into_iter()
            .filter(|id| ledger.resolve(id, OfferOutcome::Declined))
            .collect();
        if offer_ids.is_empty() {
            return;
        }
        let count = offer_ids.len();
        if let Err(e) = self.deps().client.decline(offer_ids).await {
            warn!(error = ?e, count, "Failed to decline offers");
        }
    }

    /// Removes a rescinded offer from the cache.
    pub async fn rescind_offer(&self, offer_id: OfferId) {
        if !self.is_running() {
            debug!(offer_id = %offer_id, "Ignoring rescind while not running");
            return;
        }
        let _guard = self.inner.lock.lock_offers("rescind").await;
        let held = self.deps().offer_cache.rescind_offer(&offer_id).await;
        info!(offer_id = %offer_id, held, "Offer rescinded");
    }
}

/// Timestamp to cache an offer under: its original one if it came out of
/// the cache, the batch start otherwise.
struct CacheTimestamps<'a> {
    batch: i64,
    reused: &'a HashMap<OfferId, i64>,
}

impl CacheTimestamps<'_> {
    fn of(&self, offer: &Offer) -> i64 {
        self.reused.get(&offer.id).copied().unwrap_or(self.batch)
    }
}

fn ids(offers: &[Offer]) -> Vec<OfferId> {
    offers.iter().map(|o| o.id.clone()).collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
