//! Scheduler lifecycle state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::lock::StateGuard;

/// Lifecycle of the subscription to the master.
///
/// `NotStarted -> Subscribed -> Stopped`, or `NotStarted -> Stopped`.
/// `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    NotStarted,
    Subscribed,
    Stopped,
}

impl SchedulerState {
    pub fn is_running(&self) -> bool {
        matches!(self, SchedulerState::Subscribed)
    }

    fn as_u8(self) -> u8 {
        match self {
            SchedulerState::NotStarted => 0,
            SchedulerState::Subscribed => 1,
            SchedulerState::Stopped => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SchedulerState::NotStarted,
            1 => SchedulerState::Subscribed,
            _ => SchedulerState::Stopped,
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::NotStarted => "NOT_STARTED",
            SchedulerState::Subscribed => "SUBSCRIBED",
            SchedulerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// State cell readable without a lock.
///
/// Writes take a [`StateGuard`], so only the holder of the state lock can
/// change it.
#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(SchedulerState::NotStarted.as_u8()),
        }
    }

    pub fn get(&self) -> SchedulerState {
        SchedulerState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Replaces the state and returns the previous value.
    pub fn set(&self, _guard: &StateGuard<'_>, state: SchedulerState) -> SchedulerState {
        SchedulerState::from_u8(self.value.swap(state.as_u8(), Ordering::AcqRel))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
