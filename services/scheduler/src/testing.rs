//! Test doubles for the coordinator's collaborators.
//!
//! Each double records what it was asked to do so tests can assert on it.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use lattice_id::{AgentId, ExecutorId, FrameworkId, OfferId, TaskId};
use lattice_protocol::{
    AckToken, Call, InverseOffer, MasterInfo, Offer, Resource, TaskInfo, TaskStatus, ValueRange,
};
use tokio::sync::Notify;

use crate::abort::{AbortSignal, AbortSink, DynError, ExceptionNotifier};
use crate::collaborators::{
    FrameworkMessageHandler, InMemoryHostHealth, LeaderCache, StartupRecovery, StatusUpdateHandler,
};
use crate::config::{OfferCacheConfig, SchedulerConfig};
use crate::coordinator::{Collaborators, SchedulerCoordinator};
use crate::gate::{DisasterManager, StatusUpdateDeltaAverage};
use crate::offers::{CachedOffer, InMemoryOfferCache, OfferCache, OfferHolder, OfferMatcher};
use crate::tasks::InMemoryTaskStore;
use crate::transport::{EventHandler, SchedulerClient, TransportError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Fixtures
// =============================================================================

/// Offer of `cpus` and `mem_mb` from `host`, on agent `agent-{host}`.
pub fn offer(id: &str, host: &str, cpus: f64, mem_mb: f64) -> Offer {
    Offer {
        id: OfferId::new(id).expect("valid offer id"),
        framework_id: FrameworkId::new("lattice").expect("valid framework id"),
        agent_id: AgentId::new(format!("agent-{host}")).expect("valid agent id"),
        hostname: host.to_string(),
        resources: vec![
            Resource::scalar("cpus", cpus),
            Resource::scalar("mem", mem_mb),
            Resource::ranges("ports", vec![ValueRange { begin: 31000, end: 31099 }]),
        ],
        attributes: BTreeMap::new(),
    }
}

pub fn master_info() -> MasterInfo {
    MasterInfo {
        id: "master-1".to_string(),
        hostname: Some("master.local".to_string()),
        ip: Some("10.0.0.1".to_string()),
        port: 5050,
        version: Some("1.11.0".to_string()),
    }
}

pub fn task_id(request_id: &str, instance_no: u32) -> TaskId {
    TaskId::new(request_id, "d1", 1_700_000_000_000, instance_no, "host1", "rack1")
        .expect("valid task id")
}

/// Task for `offer`'s agent asking for `cpus` and `mem_mb`.
pub fn task_for(offer: &Offer, request_id: &str, cpus: f64, mem_mb: f64) -> TaskInfo {
    TaskInfo {
        task_id: TaskId::new(request_id, "d1", 1_700_000_000_000, 1, &offer.hostname, "rack1")
            .expect("valid task id"),
        name: request_id.to_string(),
        agent_id: offer.agent_id.clone(),
        resources: vec![Resource::scalar("cpus", cpus), Resource::scalar("mem", mem_mb)],
        executor: None,
        command: Some("./run".to_string()),
    }
}

/// Scheduler config suitable for tests.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        master: "m1:5050".to_string(),
        ..SchedulerConfig::default()
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Client that records every call instead of sending it.
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<Call>>,
    close_count: AtomicUsize,
    fail_accept: AtomicBool,
    fail_kill: AtomicBool,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_accept(&self, fail: bool) {
        self.fail_accept.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_kill(&self, fail: bool) {
        self.fail_kill.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    /// Every declined offer ID, in call order.
    pub fn declined_ids(&self) -> Vec<OfferId> {
        self.calls()
            .into_iter()
            .flat_map(|call| match call {
                Call::Decline { offer_ids } => offer_ids,
                _ => Vec::new(),
            })
            .collect()
    }

    pub fn decline_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Decline { .. }))
            .count()
    }

    /// Every accept call as (offer IDs, tasks).
    pub fn accepts(&self) -> Vec<(Vec<OfferId>, Vec<TaskInfo>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Accept { offer_ids, tasks } => Some((offer_ids, tasks)),
                _ => None,
            })
            .collect()
    }

    pub fn accepted_ids(&self) -> Vec<OfferId> {
        self.accepts().into_iter().flat_map(|(ids, _)| ids).collect()
    }

    pub fn kills(&self) -> Vec<TaskId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Kill { task_id } => Some(task_id),
                _ => None,
            })
            .collect()
    }

    /// Acknowledged status updates as (task ID, token).
    pub fn acknowledgements(&self) -> Vec<(String, AckToken)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Acknowledge { task_id, uuid, .. } => Some((task_id, uuid)),
                _ => None,
            })
            .collect()
    }

    /// Framework messages as (executor ID, payload).
    pub fn messages(&self) -> Vec<(ExecutorId, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Message {
                    executor_id, data, ..
                } => Some((executor_id, data)),
                _ => None,
            })
            .collect()
    }

    pub fn subscribe_urls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe { url } => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Handler passed to the last `subscribe`.
    pub fn handler(&self) -> Option<Arc<dyn EventHandler>> {
        lock(&self.handler).clone()
    }

    fn record(&self, call: Call) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl SchedulerClient for RecordingClient {
    async fn subscribe(&self, url: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.record(Call::Subscribe { url: url.to_string() });
        *lock(&self.handler) = Some(handler);
        Ok(())
    }

    async fn decline(&self, offer_ids: Vec<OfferId>) -> Result<()> {
        self.record(Call::Decline { offer_ids });
        Ok(())
    }

    async fn accept(&self, offer_ids: Vec<OfferId>, tasks: Vec<TaskInfo>) -> Result<()> {
        if self.fail_accept.load(Ordering::SeqCst) {
            bail!("accept rejected");
        }
        self.record(Call::Accept { offer_ids, tasks });
        Ok(())
    }

    async fn kill(&self, task_id: &TaskId) -> Result<()> {
        self.record(Call::Kill {
            task_id: task_id.clone(),
        });
        if self.fail_kill.load(Ordering::SeqCst) {
            bail!("kill rejected");
        }
        Ok(())
    }

    async fn acknowledge(&self, agent_id: &AgentId, task_id: &str, uuid: AckToken) -> Result<()> {
        self.record(Call::Acknowledge {
            agent_id: agent_id.clone(),
            task_id: task_id.to_string(),
            uuid,
        });
        Ok(())
    }

    async fn framework_message(
        &self,
        executor_id: &ExecutorId,
        agent_id: &AgentId,
        data: Vec<u8>,
    ) -> Result<()> {
        self.record(Call::Message {
            agent_id: agent_id.clone(),
            executor_id: executor_id.clone(),
            data,
        });
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// An event as seen by [`RecordingEventHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Subscribed(FrameworkId),
    Offers(Vec<OfferId>),
    InverseOffers(usize),
    Rescind(OfferId),
    RescindInverseOffer(OfferId),
    StatusUpdate(String),
    Message(ExecutorId, Vec<u8>),
    Failure(Option<AgentId>, Option<ExecutorId>),
    Error(String),
    Heartbeat,
    UncaughtException(TransportError),
    ConnectException(TransportError),
}

/// Event handler that records what it receives.
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<HandlerEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        lock(&self.events).clone()
    }

    /// Waits until at least `count` events were recorded.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.events).len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, event: HandlerEvent) {
        lock(&self.events).push(event);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn subscribed(&self, framework_id: FrameworkId, _master: MasterInfo) {
        self.record(HandlerEvent::Subscribed(framework_id));
    }

    async fn offers(&self, offers: Vec<Offer>) {
        self.record(HandlerEvent::Offers(offers.into_iter().map(|o| o.id).collect()));
    }

    async fn inverse_offers(&self, offers: Vec<InverseOffer>) {
        self.record(HandlerEvent::InverseOffers(offers.len()));
    }

    async fn rescind(&self, offer_id: OfferId) {
        self.record(HandlerEvent::Rescind(offer_id));
    }

    async fn rescind_inverse_offer(&self, offer_id: OfferId) {
        self.record(HandlerEvent::RescindInverseOffer(offer_id));
    }

    async fn status_update(&self, status: TaskStatus) {
        self.record(HandlerEvent::StatusUpdate(status.task_id));
    }

    async fn message(&self, executor_id: ExecutorId, _agent_id: AgentId, data: Vec<u8>) {
        self.record(HandlerEvent::Message(executor_id, data));
    }

    async fn failure(
        &self,
        agent_id: Option<AgentId>,
        executor_id: Option<ExecutorId>,
        _status: Option<i32>,
    ) {
        self.record(HandlerEvent::Failure(agent_id, executor_id));
    }

    async fn error(&self, message: String) {
        self.record(HandlerEvent::Error(message));
    }

    async fn heartbeat(&self) {
        self.record(HandlerEvent::Heartbeat);
    }

    async fn on_uncaught_exception(&self, error: TransportError) {
        self.record(HandlerEvent::UncaughtException(error));
    }

    async fn on_connect_exception(&self, error: TransportError) {
        self.record(HandlerEvent::ConnectException(error));
    }

    fn event_buffer_size(&self) -> usize {
        16
    }
}

// =============================================================================
// Offers
// =============================================================================

type MatchFn = dyn Fn(Vec<Offer>) -> Result<Vec<OfferHolder>> + Send + Sync;

/// Matcher whose answer is scripted by the test.
pub struct ScriptedMatcher {
    script: Box<MatchFn>,
    invocations: Mutex<Vec<Vec<OfferId>>>,
}

impl ScriptedMatcher {
    pub fn from_fn<F>(script: F) -> Self
    where
        F: Fn(Vec<Offer>) -> Result<Vec<OfferHolder>> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Returns every offer in one holder with no tasks.
    pub fn unused() -> Self {
        Self::from_fn(|offers| Ok(vec![OfferHolder::new(offers)]))
    }

    pub fn failing(message: &'static str) -> Self {
        Self::from_fn(move |_| Err(anyhow!(message)))
    }

    /// Offer IDs passed to each `check_offers` call.
    pub fn invocations(&self) -> Vec<Vec<OfferId>> {
        lock(&self.invocations).clone()
    }
}

#[async_trait]
impl OfferMatcher for ScriptedMatcher {
    async fn check_offers(&self, offers: Vec<Offer>) -> Result<Vec<OfferHolder>> {
        lock(&self.invocations).push(offers.iter().map(|o| o.id.clone()).collect());
        (self.script)(offers)
    }
}

/// Offer cache that records what it holds.
#[derive(Default)]
pub struct RecordingOfferCache {
    enabled: Mutex<Option<bool>>,
    cached: Mutex<Vec<(i64, OfferId)>>,
    rescinded: Mutex<Vec<OfferId>>,
}

impl RecordingOfferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last enable/disable call, if any.
    pub fn enabled(&self) -> Option<bool> {
        *lock(&self.enabled)
    }

    /// Every `cache_offer` call as (timestamp, offer ID).
    pub fn cached(&self) -> Vec<(i64, OfferId)> {
        lock(&self.cached).clone()
    }

    /// Offers still held: cached and not rescinded.
    pub fn held_ids(&self) -> Vec<OfferId> {
        let rescinded: HashSet<OfferId> = lock(&self.rescinded).iter().cloned().collect();
        self.cached()
            .into_iter()
            .map(|(_, id)| id)
            .filter(|id| !rescinded.contains(id))
            .collect()
    }

    pub fn rescinded(&self) -> Vec<OfferId> {
        lock(&self.rescinded).clone()
    }
}

#[async_trait]
impl OfferCache for RecordingOfferCache {
    async fn enable(&self) {
        *lock(&self.enabled) = Some(true);
    }

    async fn disable(&self) {
        *lock(&self.enabled) = Some(false);
    }

    async fn cache_offer(&self, timestamp_ms: i64, offer: Offer) -> Vec<OfferId> {
        lock(&self.cached).push((timestamp_ms, offer.id));
        Vec::new()
    }

    async fn rescind_offer(&self, offer_id: &OfferId) -> bool {
        let held = self.held_ids().contains(offer_id);
        lock(&self.rescinded).push(offer_id.clone());
        held
    }

    /// Never hands offers back.
    async fn checkout_offers(&self) -> Vec<CachedOffer> {
        Vec::new()
    }
}

// =============================================================================
// Everything else
// =============================================================================

/// Abort sink that records signals.
#[derive(Default)]
pub struct RecordingAbort {
    signals: Mutex<Vec<AbortSignal>>,
}

impl RecordingAbort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<AbortSignal> {
        lock(&self.signals).clone()
    }
}

impl AbortSink for RecordingAbort {
    fn abort(&self, signal: AbortSignal) {
        lock(&self.signals).push(signal);
    }
}

/// Notifier that records messages.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

impl ExceptionNotifier for RecordingNotifier {
    fn notify(&self, message: &str, error: Option<&DynError>) {
        let entry = match error {
            Some(e) => format!("{message}: {e}"),
            None => message.to_string(),
        };
        lock(&self.messages).push(entry);
    }
}

/// Status handler that records task IDs and fails for chosen tasks.
#[derive(Default)]
pub struct ScriptedStatusHandler {
    processed: Mutex<Vec<String>>,
    fail_for: Mutex<HashSet<String>>,
}

impl ScriptedStatusHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, task_id: impl Into<String>) {
        lock(&self.fail_for).insert(task_id.into());
    }

    /// Task IDs in the order processing started.
    pub fn processed(&self) -> Vec<String> {
        lock(&self.processed).clone()
    }
}

#[async_trait]
impl StatusUpdateHandler for ScriptedStatusHandler {
    async fn process_status_update(&self, status: &TaskStatus) -> Result<()> {
        lock(&self.processed).push(status.task_id.clone());
        if lock(&self.fail_for).contains(&status.task_id) {
            bail!("cannot process update for {}", status.task_id);
        }
        Ok(())
    }
}

/// Message handler that records payloads and can be told to fail.
#[derive(Default)]
pub struct RecordingMessageHandler {
    messages: Mutex<Vec<(ExecutorId, Vec<u8>)>>,
    fail: AtomicBool,
}

impl RecordingMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<(ExecutorId, Vec<u8>)> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl FrameworkMessageHandler for RecordingMessageHandler {
    async fn handle_message(
        &self,
        executor_id: &ExecutorId,
        _agent_id: &AgentId,
        data: &[u8],
    ) -> Result<()> {
        lock(&self.messages).push((executor_id.clone(), data.to_vec()));
        if self.fail.load(Ordering::SeqCst) {
            bail!("unreadable message");
        }
        Ok(())
    }
}

/// Leader cache that counts activations and stops.
#[derive(Default)]
pub struct RecordingLeaderCache {
    activations: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingLeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaderCache for RecordingLeaderCache {
    async fn activate(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Startup recovery that records masters and can be told to fail.
#[derive(Default)]
pub struct RecordingStartup {
    masters: Mutex<Vec<MasterInfo>>,
    fail: AtomicBool,
}

impl RecordingStartup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn masters(&self) -> Vec<MasterInfo> {
        lock(&self.masters).clone()
    }
}

#[async_trait]
impl StartupRecovery for RecordingStartup {
    async fn startup(&self, master: &MasterInfo) -> Result<()> {
        lock(&self.masters).push(master.clone());
        if self.fail.load(Ordering::SeqCst) {
            bail!("recovery failed");
        }
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A coordinator wired to recording doubles.
pub struct TestHarness {
    pub coordinator: SchedulerCoordinator,
    pub client: Arc<RecordingClient>,
    pub matcher: Arc<ScriptedMatcher>,
    pub offer_cache: Arc<RecordingOfferCache>,
    pub gate: Arc<DisasterManager>,
    pub status_delta: Arc<StatusUpdateDeltaAverage>,
    pub status_handler: Arc<ScriptedStatusHandler>,
    pub message_handler: Arc<RecordingMessageHandler>,
    pub host_health: Arc<InMemoryHostHealth>,
    pub task_store: Arc<InMemoryTaskStore>,
    pub leader_cache: Arc<RecordingLeaderCache>,
    pub startup: Arc<RecordingStartup>,
    pub notifier: Arc<RecordingNotifier>,
    pub abort: Arc<RecordingAbort>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with(test_config(), ScriptedMatcher::unused())
    }

    pub fn with_matcher(matcher: ScriptedMatcher) -> Self {
        Self::with(test_config(), matcher)
    }

    pub fn with(config: SchedulerConfig, matcher: ScriptedMatcher) -> Self {
        let client = Arc::new(RecordingClient::new());
        let offer_cache = Arc::new(RecordingOfferCache::new());
        Self::assemble(config, matcher, client, offer_cache.clone(), offer_cache)
    }

    /// A harness whose coordinator caches offers in a real
    /// [`InMemoryOfferCache`] declining through the harness client. The
    /// recording cache is left unwired.
    pub fn with_in_memory_cache(
        config: SchedulerConfig,
        cache_config: OfferCacheConfig,
        matcher: ScriptedMatcher,
    ) -> (Self, Arc<InMemoryOfferCache>) {
        let client = Arc::new(RecordingClient::new());
        let cache = Arc::new(InMemoryOfferCache::new(cache_config, client.clone()));
        let harness = Self::assemble(
            config,
            matcher,
            client,
            Arc::new(RecordingOfferCache::new()),
            cache.clone(),
        );
        (harness, cache)
    }

    fn assemble(
        config: SchedulerConfig,
        matcher: ScriptedMatcher,
        client: Arc<RecordingClient>,
        offer_cache: Arc<RecordingOfferCache>,
        wired_cache: Arc<dyn OfferCache>,
    ) -> Self {
        let matcher = Arc::new(matcher);
        let gate = Arc::new(DisasterManager::new());
        let status_delta = Arc::new(StatusUpdateDeltaAverage::new());
        let status_handler = Arc::new(ScriptedStatusHandler::new());
        let message_handler = Arc::new(RecordingMessageHandler::new());
        let host_health = Arc::new(InMemoryHostHealth::new());
        let task_store = Arc::new(InMemoryTaskStore::new());
        let leader_cache = Arc::new(RecordingLeaderCache::new());
        let startup = Arc::new(RecordingStartup::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let abort = Arc::new(RecordingAbort::new());

        let coordinator = SchedulerCoordinator::new(
            config,
            Collaborators {
                client: client.clone(),
                matcher: matcher.clone(),
                offer_cache: wired_cache,
                gate: gate.clone(),
                status_delta: status_delta.clone(),
                status_handler: status_handler.clone(),
                message_handler: message_handler.clone(),
                host_health: host_health.clone(),
                task_store: task_store.clone(),
                leader_cache: leader_cache.clone(),
                startup: startup.clone(),
                notifier: notifier.clone(),
                abort: abort.clone(),
            },
        );

        Self {
            coordinator,
            client,
            matcher,
            offer_cache,
            gate,
            status_delta,
            status_handler,
            message_handler,
            host_health,
            task_store,
            leader_cache,
            startup,
            notifier,
            abort,
        }
    }

    /// Delivers a successful subscription.
    pub async fn subscribe(&self) {
        self.coordinator
            .handle_subscribed(
                FrameworkId::new("lattice").expect("valid framework id"),
                master_info(),
            )
            .await
            .expect("subscription succeeds");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
