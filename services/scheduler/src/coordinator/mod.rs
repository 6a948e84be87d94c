//! The scheduler coordinator.
//!
//! Owns the subscription lifecycle and routes every inbound event under the
//! right lock:
//!
//! - lifecycle transitions and the stop sequence run under the state lock
//! - the offer pipeline and rescinds run under the offers lock
//! - status updates take no lock once subscribed
//!
//! Fatal failures stop the coordinator and raise a single abort signal.

mod kill;
mod offers;
mod status;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use lattice_id::{AgentId, ExecutorId, FrameworkId, OfferId};
use lattice_protocol::{InverseOffer, MasterInfo, Offer, TaskStatus};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::abort::{AbortReason, AbortSignal, AbortSink, DynError, ExceptionNotifier};
use crate::collaborators::{
    FrameworkMessageHandler, HostHealth, LeaderCache, StartupRecovery, StatusUpdateHandler,
};
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::gate::{DisasterGate, StatusUpdateDeltaAverage};
use crate::lock::{SchedulerLock, StateGuard};
use crate::offers::{OfferCache, OfferMatcher};
use crate::state::{SchedulerState, StateCell};
use crate::tasks::TaskStore;
use crate::transport::{EventHandler, SchedulerClient, TransportError};

/// Everything the coordinator calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub client: Arc<dyn SchedulerClient>,
    pub matcher: Arc<dyn OfferMatcher>,
    pub offer_cache: Arc<dyn OfferCache>,
    pub gate: Arc<dyn DisasterGate>,
    pub status_delta: Arc<StatusUpdateDeltaAverage>,
    pub status_handler: Arc<dyn StatusUpdateHandler>,
    pub message_handler: Arc<dyn FrameworkMessageHandler>,
    pub host_health: Arc<dyn HostHealth>,
    pub task_store: Arc<dyn TaskStore>,
    pub leader_cache: Arc<dyn LeaderCache>,
    pub startup: Arc<dyn StartupRecovery>,
    pub notifier: Arc<dyn ExceptionNotifier>,
    pub abort: Arc<dyn AbortSink>,
}

/// Serializes protocol events against the scheduler's state.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SchedulerCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    deps: Collaborators,
    lock: SchedulerLock,
    state: StateCell,
    master: ArcSwapOption<MasterInfo>,
    framework_id: ArcSwapOption<FrameworkId>,
    queued_updates: Mutex<VecDeque<TaskStatus>>,
    aborted: AtomicBool,
    /// Millisecond timestamp of the latest offer batch, 0 before the first.
    last_offer_timestamp: AtomicI64,
    in_flight_updates: AtomicUsize,
    updates_idle: Notify,
}

impl SchedulerCoordinator {
    pub fn new(config: SchedulerConfig, deps: Collaborators) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                deps,
                lock: SchedulerLock::new(),
                state: StateCell::new(),
                master: ArcSwapOption::empty(),
                framework_id: ArcSwapOption::empty(),
                queued_updates: Mutex::new(VecDeque::new()),
                aborted: AtomicBool::new(false),
                last_offer_timestamp: AtomicI64::new(0),
                in_flight_updates: AtomicUsize::new(0),
                updates_idle: Notify::new(),
            }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> SchedulerState {
        self.inner.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// The master seen at the last subscription.
    pub fn master(&self) -> Option<Arc<MasterInfo>> {
        self.inner.master.load_full()
    }

    pub fn framework_id(&self) -> Option<Arc<FrameworkId>> {
        self.inner.framework_id.load_full()
    }

    /// Start time of the most recent offer batch, in epoch milliseconds.
    pub fn last_offer_timestamp(&self) -> Option<i64> {
        match self.inner.last_offer_timestamp.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Status updates waiting for the subscription.
    pub fn queued_status_updates(&self) -> usize {
        self.queued().len()
    }

    /// The coordinator's locks, for inspecting acquisition counts.
    pub fn locks(&self) -> &SchedulerLock {
        &self.inner.lock
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn deps(&self) -> &Collaborators {
        &self.inner.deps
    }

    fn queued(&self) -> MutexGuard<'_, VecDeque<TaskStatus>> {
        self.inner
            .queued_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Subscribes to a randomly chosen configured master.
    pub async fn start(&self) -> SchedulerResult<()> {
        let state = self.state();
        if state != SchedulerState::NotStarted {
            return Err(SchedulerError::InvalidState {
                expected: SchedulerState::NotStarted,
                actual: state,
            });
        }

        let url = self
            .inner
            .config
            .subscribe_url()
            .ok_or(SchedulerError::NoMaster)?;
        info!(url = %url, "Subscribing to master");

        self.deps()
            .client
            .subscribe(&url, Arc::new(self.clone()))
            .await
            .map_err(SchedulerError::Transport)
    }

    /// Handles the master's confirmation of the subscription.
    pub async fn handle_subscribed(
        &self,
        framework_id: FrameworkId,
        master: MasterInfo,
    ) -> SchedulerResult<()> {
        let guard = self.inner.lock.lock_state("subscribed").await;
        let result = self.subscribe_locked(&guard, framework_id, master).await;
        if let Err(err) = &result {
            self.report_fatal("subscribed", err);
            self.stop_locked(&guard).await;
            drop(guard);
            self.abort(AbortSignal::with_cause(AbortReason::UnrecoverableError, err));
        }
        result
    }

    async fn subscribe_locked(
        &self,
        guard: &StateGuard<'_>,
        framework_id: FrameworkId,
        master: MasterInfo,
    ) -> SchedulerResult<()> {
        let state = self.state();
        if state != SchedulerState::NotStarted {
            return Err(SchedulerError::InvalidState {
                expected: SchedulerState::NotStarted,
                actual: state,
            });
        }

        info!(
            framework_id = %framework_id,
            master = %master.endpoint(),
            master_id = %master.id,
            "Subscribed to master"
        );

        let deps = self.deps();
        deps.leader_cache.activate().await;
        let master = Arc::new(master);
        self.inner.master.store(Some(master.clone()));
        self.inner.framework_id.store(Some(Arc::new(framework_id)));

        deps.startup
            .startup(&master)
            .await
            .map_err(SchedulerError::Startup)?;

        // Flip the state while holding the queue so a live update cannot
        // overtake the queued ones.
        let drained = {
            let mut queued = self.queued();
            self.inner.state.set(guard, SchedulerState::Subscribed);
            let drained = queued.len();
            for status in queued.drain(..) {
                self.dispatch_status_update(status);
            }
            drained
        };

        info!(queued_updates = drained, "Scheduler is running");
        Ok(())
    }

    /// Runs the stop sequence. Safe to call more than once.
    pub async fn notify_stopping(&self) {
        let guard = self.inner.lock.lock_state("notifyStopping").await;
        self.stop_locked(&guard).await;
    }

    /// Returns false if the coordinator was already stopped.
    async fn stop_locked(&self, guard: &StateGuard<'_>) -> bool {
        let previous = self.inner.state.set(guard, SchedulerState::Stopped);
        if previous == SchedulerState::Stopped {
            debug!("Scheduler already stopped");
            return false;
        }

        info!(previous = %previous, "Stopping scheduler");
        self.deps().leader_cache.stop().await;
        self.deps().client.close().await;
        true
    }

    /// Reports a fatal error, stops, and aborts with `UnrecoverableError`.
    ///
    /// Must not be called while holding either lock.
    async fn fail(&self, name: &'static str, err: &SchedulerError) {
        self.report_fatal(name, err);
        self.stop_and_abort(name, AbortSignal::with_cause(AbortReason::UnrecoverableError, err))
            .await;
    }

    fn report_fatal(&self, name: &'static str, err: &SchedulerError) {
        error!(name, error = %err, "Scheduler failure");
        self.deps()
            .notifier
            .notify(&format!("Scheduler {name} failed"), Some(err));
    }

    async fn stop_and_abort(&self, name: &'static str, signal: AbortSignal) {
        {
            let guard = self.inner.lock.lock_state(name).await;
            self.stop_locked(&guard).await;
        }
        self.abort(signal);
    }

    fn abort(&self, signal: AbortSignal) {
        if self.inner.aborted.swap(true, Ordering::AcqRel) {
            warn!(
                reason = %signal.reason,
                cause = signal.cause.as_deref().unwrap_or(""),
                "Abort already requested"
            );
            return;
        }
        self.deps().abort.abort(signal);
    }

    // =========================================================================
    // Framework events
    // =========================================================================

    /// Handles an error reported by the master.
    pub async fn handle_error(&self, message: String) {
        if !self.is_running() {
            warn!(state = %self.state(), message = %message, "Ignoring error while not running");
            return;
        }
        error!(message = %message, "Master reported an error");
        self.stop_and_abort(
            "error",
            AbortSignal::with_cause(AbortReason::ProtocolError, message),
        )
        .await;
    }

    /// Handles a transport failure outside of any single call.
    pub async fn handle_uncaught_exception(&self, err: TransportError) {
        if !self.is_running() {
            warn!(state = %self.state(), error = %err, "Ignoring transport failure while not running");
            return;
        }
        let reason = if err.is_connection_closed() {
            AbortReason::LostConnection
        } else {
            AbortReason::ProtocolError
        };
        error!(error = %err, %reason, "Transport failure");
        self.stop_and_abort("uncaughtException", AbortSignal::with_cause(reason, &err))
            .await;
    }

    /// Handles a failure to connect to the master. Acted on in every state.
    pub async fn handle_connect_exception(&self, err: TransportError) {
        error!(error = %err, "Unable to connect to master");
        self.stop_and_abort(
            "connectException",
            AbortSignal::with_cause(AbortReason::ProtocolError, &err),
        )
        .await;
    }

    pub async fn handle_failure(
        &self,
        agent_id: Option<AgentId>,
        executor_id: Option<ExecutorId>,
        status: Option<i32>,
    ) {
        match (executor_id, agent_id) {
            (Some(executor_id), agent_id) => {
                warn!(
                    executor_id = %executor_id,
                    agent_id = agent_id.as_ref().map(AgentId::as_str).unwrap_or(""),
                    status,
                    "Executor lost"
                );
            }
            (None, Some(agent_id)) => {
                warn!(agent_id = %agent_id, "Agent lost");
                self.deps().host_health.agent_lost(&agent_id).await;
            }
            (None, None) => warn!(status, "Failure event without agent or executor"),
        }
    }

    pub async fn handle_message(&self, executor_id: ExecutorId, agent_id: AgentId, data: Vec<u8>) {
        if let Err(e) = self
            .deps()
            .message_handler
            .handle_message(&executor_id, &agent_id, &data)
            .await
        {
            error!(
                executor_id = %executor_id,
                agent_id = %agent_id,
                error = ?e,
                "Failed to handle framework message"
            );
            let source: &DynError = e.as_ref();
            self.deps().notifier.notify(
                &format!("Framework message from {executor_id} on {agent_id} failed"),
                Some(source),
            );
        }
    }
}

#[async_trait]
impl EventHandler for SchedulerCoordinator {
    async fn subscribed(&self, framework_id: FrameworkId, master: MasterInfo) {
        let _ = self.handle_subscribed(framework_id, master).await;
    }

    async fn offers(&self, offers: Vec<Offer>) {
        let _ = self.resource_offers(offers).await;
    }

    async fn inverse_offers(&self, offers: Vec<InverseOffer>) {
        debug!(count = offers.len(), "Ignoring inverse offers");
    }

    async fn rescind(&self, offer_id: OfferId) {
        self.rescind_offer(offer_id).await;
    }

    async fn rescind_inverse_offer(&self, offer_id: OfferId) {
        debug!(offer_id = %offer_id, "Ignoring inverse offer rescind");
    }

    async fn status_update(&self, status: TaskStatus) {
        self.handle_status_update(status);
    }

    async fn message(&self, executor_id: ExecutorId, agent_id: AgentId, data: Vec<u8>) {
        self.handle_message(executor_id, agent_id, data).await;
    }

    async fn failure(
        &self,
        agent_id: Option<AgentId>,
        executor_id: Option<ExecutorId>,
        status: Option<i32>,
    ) {
        self.handle_failure(agent_id, executor_id, status).await;
    }

    async fn error(&self, message: String) {
        self.handle_error(message).await;
    }

    async fn heartbeat(&self) {
        debug!("Heartbeat from master");
    }

    async fn on_uncaught_exception(&self, error: TransportError) {
        self.handle_uncaught_exception(error).await;
    }

    async fn on_connect_exception(&self, error: TransportError) {
        self.handle_connect_exception(error).await;
    }

    fn event_buffer_size(&self) -> usize {
        self.inner.config.event_buffer_size
    }
}
