//! Offer handling: matching, launching, caching, and per-batch accounting.

mod cache;
mod holder;
mod ledger;
mod matcher;

pub use cache::{CachedOffer, InMemoryOfferCache, OfferCache};
pub use holder::OfferHolder;
pub use ledger::{OfferBatchSummary, OfferLedger, OfferOutcome};
pub use matcher::{CustomExecutor, FirstFitMatcher, OfferMatcher, TaskRequest};
