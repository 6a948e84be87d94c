//! Per-batch accounting of how each offer was resolved.

use std::collections::HashMap;
use std::fmt;

use lattice_id::OfferId;
use lattice_protocol::Offer;
use tracing::{info, warn};

/// Final disposition of one offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfferOutcome {
    Declined,
    Cached,
    Accepted,
}

impl fmt::Display for OfferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OfferOutcome::Declined => "declined",
            OfferOutcome::Cached => "cached",
            OfferOutcome::Accepted => "accepted",
        };
        f.write_str(name)
    }
}

/// Offer IDs of one batch, split by outcome.
///
/// Offers taken back out of the cache for the round are part of the split
/// and are also listed in `reused`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferBatchSummary {
    pub declined: Vec<OfferId>,
    pub cached: Vec<OfferId>,
    pub accepted: Vec<OfferId>,
    pub reused: Vec<OfferId>,
}

impl OfferBatchSummary {
    pub fn total(&self) -> usize {
        self.declined.len() + self.cached.len() + self.accepted.len()
    }
}

/// Tracks the outcome of every offer in a batch, keyed by offer ID.
#[derive(Debug)]
pub struct OfferLedger {
    order: Vec<OfferId>,
    outcomes: HashMap<OfferId, Option<OfferOutcome>>,
    reused: Vec<OfferId>,
}

impl OfferLedger {
    pub fn new(offers: &[Offer]) -> Self {
        let mut order = Vec::with_capacity(offers.len());
        let mut outcomes = HashMap::with_capacity(offers.len());
        for offer in offers {
            if outcomes.insert(offer.id.clone(), None).is_none() {
                order.push(offer.id.clone());
            } else {
                warn!(offer_id = %offer.id, "Duplicate offer in batch");
            }
        }
        Self {
            order,
            outcomes,
            reused: Vec::new(),
        }
    }

    /// Adds an offer checked out of the cache so it is resolved with the
    /// batch. Returns false if the ID is already tracked.
    pub fn add_reused(&mut self, offer_id: &OfferId) -> bool {
        if self.outcomes.contains_key(offer_id) {
            warn!(offer_id = %offer_id, "Cached offer is already part of the batch");
            return false;
        }
        self.outcomes.insert(offer_id.clone(), None);
        self.order.push(offer_id.clone());
        self.reused.push(offer_id.clone());
        true
    }

    /// Records an outcome. Returns false, leaving the ledger untouched, if
    /// the offer is not part of the batch or was already resolved.
    pub fn resolve(&mut self, offer_id: &OfferId, outcome: OfferOutcome) -> bool {
        match self.outcomes.get_mut(offer_id) {
            None => {
                warn!(offer_id = %offer_id, %outcome, "Offer is not part of this batch");
                false
            }
            Some(Some(previous)) => {
                warn!(
                    offer_id = %offer_id,
                    previous = %previous,
                    %outcome,
                    "Offer already resolved"
                );
                false
            }
            Some(slot) => {
                *slot = Some(outcome);
                true
            }
        }
    }

    pub fn outcome(&self, offer_id: &OfferId) -> Option<OfferOutcome> {
        self.outcomes.get(offer_id).copied().flatten()
    }

    /// Offers currently recorded as `Cached`, in batch order.
    pub fn cached(&self) -> Vec<OfferId> {
        self.with_outcome(OfferOutcome::Cached)
    }

    /// Clears a `Cached` outcome so the offer can be resolved again.
    pub fn reopen(&mut self, offer_id: &OfferId) -> bool {
        self.replace_cached(offer_id, None)
    }

    /// Records that the cache declined an offer it was handed.
    pub fn cache_declined(&mut self, offer_id: &OfferId) -> bool {
        self.replace_cached(offer_id, Some(OfferOutcome::Declined))
    }

    fn replace_cached(&mut self, offer_id: &OfferId, outcome: Option<OfferOutcome>) -> bool {
        match self.outcomes.get_mut(offer_id) {
            Some(slot) if *slot == Some(OfferOutcome::Cached) => {
                *slot = outcome;
                true
            }
            _ => false,
        }
    }

    /// Offers with no outcome yet, in batch order.
    pub fn unresolved(&self) -> Vec<OfferId> {
        self.order
            .iter()
            .filter(|id| matches!(self.outcomes.get(*id), Some(None)))
            .cloned()
            .collect()
    }

    fn with_outcome(&self, outcome: OfferOutcome) -> Vec<OfferId> {
        self.order
            .iter()
            .filter(|id| self.outcome(id) == Some(outcome))
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> OfferBatchSummary {
        OfferBatchSummary {
            declined: self.with_outcome(OfferOutcome::Declined),
            cached: self.with_outcome(OfferOutcome::Cached),
            accepted: self.with_outcome(OfferOutcome::Accepted),
            reused: self.reused.clone(),
        }
    }

    /// Logs the partition and returns it.
    pub fn finish(self, elapsed_ms: u64) -> OfferBatchSummary {
        let summary = self.summary();
        let unresolved = self.unresolved();
        if !unresolved.is_empty() {
            warn!(
                unresolved = ?unresolved,
                "Offers left unresolved at end of batch"
            );
        }
        info!(
            offers = self.order.len(),
            reused = self.reused.len(),
            accepted = summary.accepted.len(),
            declined = summary.declined.len(),
            cached = summary.cached.len(),
            elapsed_ms,
            "Finished handling offers ({} accepted, {} declined/cached)",
            summary.accepted.len(),
            summary.declined.len() + summary.cached.len()
        );
        summary
    }
}
