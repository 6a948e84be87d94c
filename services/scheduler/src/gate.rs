//! Disaster switches and status-update backpressure.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{info, warn};

/// Actions operators can switch off during an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerAction {
    /// Run the offer pipeline at all.
    ProcessOffers,
    /// Keep unused offers in the offer cache.
    CacheOffers,
}

impl fmt::Display for SchedulerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerAction::ProcessOffers => "PROCESS_OFFERS",
            SchedulerAction::CacheOffers => "CACHE_OFFERS",
        };
        f.write_str(name)
    }
}

/// An action name that is not one of [`SchedulerAction`].
#[derive(Debug, Error)]
#[error("unknown scheduler action '{0}'")]
pub struct UnknownAction(String);

impl FromStr for SchedulerAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROCESS_OFFERS" => Ok(SchedulerAction::ProcessOffers),
            "CACHE_OFFERS" => Ok(SchedulerAction::CacheOffers),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// Reports which actions are currently disabled.
pub trait DisasterGate: Send + Sync {
    fn is_disabled(&self, action: SchedulerAction) -> bool;
}

/// In-memory set of disabled actions.
#[derive(Debug, Default)]
pub struct DisasterManager {
    disabled: RwLock<HashSet<SchedulerAction>>,
}

impl DisasterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&self, action: SchedulerAction) {
        let inserted = match self.disabled.write() {
            Ok(mut disabled) => disabled.insert(action),
            Err(poisoned) => poisoned.into_inner().insert(action),
        };
        if inserted {
            warn!(%action, "Action disabled");
        }
    }

    pub fn enable(&self, action: SchedulerAction) {
        let removed = match self.disabled.write() {
            Ok(mut disabled) => disabled.remove(&action),
            Err(poisoned) => poisoned.into_inner().remove(&action),
        };
        if removed {
            info!(%action, "Action enabled");
        }
    }
}

impl DisasterGate for DisasterManager {
    fn is_disabled(&self, action: SchedulerAction) -> bool {
        match self.disabled.read() {
            Ok(disabled) => disabled.contains(&action),
            Err(poisoned) => poisoned.into_inner().contains(&action),
        }
    }
}

/// Moving average of how far status updates lag behind their generation
/// time, in milliseconds.
///
/// Each sample moves the average a quarter of the way towards it.
#[derive(Debug, Default)]
pub struct StatusUpdateDeltaAverage {
    average_ms: AtomicU64,
}

impl StatusUpdateDeltaAverage {
    const WEIGHT: u64 = 4;

    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one sample into the average.
    pub fn record(&self, delta_ms: u64) {
        let _ = self
            .average_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current * (Self::WEIGHT - 1) + delta_ms) / Self::WEIGHT)
            });
    }

    pub fn get(&self) -> u64 {
        self.average_ms.load(Ordering::Acquire)
    }
}
