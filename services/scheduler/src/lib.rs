//! Lattice scheduler.
//!
//! Bridges a resource-offer master and the task placement engine. The
//! [`SchedulerCoordinator`] owns the subscription lifecycle, runs the offer
//! pipeline, dispatches status updates, and escalates fatal failures to an
//! abort signal.
//!
//! Collaborators sit behind traits so they can be swapped:
//! - [`SchedulerClient`] for the wire transport
//! - [`OfferMatcher`] and [`OfferCache`] for placement and unused offers
//! - [`StatusUpdateHandler`], [`TaskStore`], and friends for scheduler state

pub mod abort;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod lock;
pub mod offers;
pub mod state;
pub mod stdio;
pub mod tasks;
pub mod testing;
pub mod transport;

pub use abort::{AbortReason, AbortSignal, AbortSink, ExceptionNotifier, ProcessAbort};
pub use collaborators::{OfferCheck, StatusUpdateHandler};
pub use config::{Config, OfferCacheConfig, SchedulerConfig, SeedConfig};
pub use coordinator::{Collaborators, SchedulerCoordinator};
pub use error::{SchedulerError, SchedulerResult};
pub use gate::{DisasterGate, SchedulerAction};
pub use offers::{OfferCache, OfferHolder, OfferMatcher};
pub use state::SchedulerState;
pub use tasks::{KillRequest, TaskStore};
pub use transport::{EventHandler, SchedulerClient, TransportError};
