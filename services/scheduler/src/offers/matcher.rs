//! Placement of pending tasks onto offers.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lattice_id::{AgentId, ExecutorId, TaskId};
use lattice_protocol::{ExecutorInfo, Offer, Resource, ResourceTotals, TaskInfo};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::offers::OfferHolder;
use crate::tasks::{InMemoryTaskStore, TaskRecord};

/// Rack reported for hosts without a `rackid` attribute.
const DEFAULT_RACK: &str = "unknown";

/// Decides which tasks run on which offers.
#[async_trait]
pub trait OfferMatcher: Send + Sync {
    /// Groups the offers into holders, attaching the tasks to launch.
    ///
    /// An offer missing from every holder is treated as unused.
    async fn check_offers(&self, offers: Vec<Offer>) -> Result<Vec<OfferHolder>>;
}

/// A task instance waiting for resources.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub request_id: String,
    pub deploy_id: String,
    pub instance_no: u32,
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub custom_executor: Option<CustomExecutor>,
}

/// Executor a task runs under instead of the default one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomExecutor {
    pub executor_id: ExecutorId,
    pub command: String,
}

impl TaskRequest {
    /// Parses a JSON array of task requests.
    pub fn list_from_json(json: &str) -> Result<Vec<TaskRequest>> {
        Ok(serde_json::from_str(json)?)
    }

    fn totals(&self) -> ResourceTotals {
        ResourceTotals::from_resources(&self.resources)
    }

    fn into_task(self, offer: &Offer, now_ms: i64) -> Result<TaskInfo> {
        let task_id = TaskId::new(
            &self.request_id,
            &self.deploy_id,
            now_ms,
            self.instance_no,
            &offer.hostname,
            offer.rack_id().unwrap_or(DEFAULT_RACK),
        )?;
        Ok(TaskInfo {
            name: self.request_id.clone(),
            task_id,
            agent_id: offer.agent_id.clone(),
            resources: self.resources,
            executor: self.custom_executor.map(|e| ExecutorInfo {
                executor_id: e.executor_id,
                command: e.command,
            }),
            command: self.command,
        })
    }
}

struct HostSlot {
    agent_id: AgentId,
    offers: Vec<Offer>,
    remaining: ResourceTotals,
    tasks: Vec<TaskInfo>,
}

/// Places pending requests, in submission order, on the first host with room.
///
/// Requests that fit nowhere stay queued for the next round.
pub struct FirstFitMatcher {
    pending: Mutex<VecDeque<TaskRequest>>,
    store: Arc<InMemoryTaskStore>,
}

impl FirstFitMatcher {
    pub fn new(store: Arc<InMemoryTaskStore>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            store,
        }
    }

    pub async fn submit(&self, request: TaskRequest) {
        debug!(request_id = %request.request_id, instance = request.instance_no, "Task request queued");
        self.pending.lock().await.push_back(request);
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl OfferMatcher for FirstFitMatcher {
    async fn check_offers(&self, offers: Vec<Offer>) -> Result<Vec<OfferHolder>> {
        let mut slots: Vec<HostSlot> = Vec::new();
        for offer in offers {
            match slots.iter_mut().find(|s| s.agent_id == offer.agent_id) {
                Some(slot) => {
                    let totals = offer.totals();
                    slot.remaining.cpus += totals.cpus;
                    slot.remaining.memory_mb += totals.memory_mb;
                    slot.remaining.disk_mb += totals.disk_mb;
                    slot.remaining.ports += totals.ports;
                    slot.offers.push(offer);
                }
                None => slots.push(HostSlot {
                    agent_id: offer.agent_id.clone(),
                    remaining: offer.totals(),
                    offers: vec![offer],
                    tasks: Vec::new(),
                }),
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut pending = self.pending.lock().await;
        let mut taken: Vec<TaskRequest> = Vec::with_capacity(pending.len());
        let mut unplaced = VecDeque::with_capacity(pending.len());

        while let Some(request) = pending.pop_front() {
            let needed = request.totals();
            let Some(slot) = slots.iter_mut().find(|s| s.remaining.fits(&needed)) else {
                taken.push(request.clone());
                unplaced.push_back(request);
                continue;
            };

            let task = match request.clone().into_task(&slot.offers[0], now_ms) {
                Ok(task) => task,
                Err(e) => {
                    // The whole round fails: requeue every request in
                    // submission order.
                    let rest: Vec<TaskRequest> = pending.drain(..).collect();
                    pending.extend(taken);
                    pending.push_back(request);
                    pending.extend(rest);
                    return Err(e);
                }
            };
            slot.remaining.consume(&needed);
            slot.tasks.push(task);
            taken.push(request);
        }
        *pending = unplaced;
        drop(pending);

        for task in slots.iter().flat_map(|s| &s.tasks) {
            self.store
                .insert_task(TaskRecord {
                    task_id: task.task_id.clone(),
                    agent_id: task.agent_id.clone(),
                    executor_id: task.executor.as_ref().map(|e| e.executor_id.clone()),
                    custom_executor_cmd: task.executor.as_ref().map(|e| e.command.clone()),
                })
                .await;
        }

        let placed: usize = slots.iter().map(|s| s.tasks.len()).sum();
        if placed > 0 {
            let still_pending = self.pending().await;
            info!(placed, still_pending, "Matched task requests to offers");
        }

        Ok(slots
            .into_iter()
            .map(|slot| OfferHolder::with_tasks(slot.offers, slot.tasks))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStore;
    use crate::testing::offer;

    fn request(name: &str, cpus: f64, mem: f64) -> TaskRequest {
        TaskRequest {
            request_id: name.to_string(),
            deploy_id: "d1".to_string(),
            instance_no: 1,
            resources: vec![Resource::scalar("cpus", cpus), Resource::scalar("mem", mem)],
            command: Some("./run".to_string()),
            custom_executor: None,
        }
    }

    #[tokio::test]
    async fn test_groups_offers_by_agent() {
        let matcher = FirstFitMatcher::new(Arc::new(InMemoryTaskStore::new()));
        let holders = matcher
            .check_offers(vec![
                offer("o1", "h1", 1.0, 512.0),
                offer("o2", "h2", 1.0, 512.0),
                offer("o3", "h1", 1.0, 512.0),
            ])
            .await
            .unwrap();

        assert_eq!(holders.len(), 2);
        assert_eq!(holders[0].offers().len(), 2);
        assert!(holders.iter().all(|h| !h.has_accepted_tasks()));
    }

    #[tokio::test]
    async fn test_places_first_fit_and_keeps_the_rest() {
        let store = Arc::new(InMemoryTaskStore::new());
        let matcher = FirstFitMatcher::new(store.clone());
        matcher.submit(request("big", 8.0, 512.0)).await;
        matcher.submit(request("small", 1.0, 256.0)).await;

        let holders = matcher
            .check_offers(vec![offer("o1", "h1", 1.0, 512.0), offer("o2", "h2", 2.0, 512.0)])
            .await
            .unwrap();

        assert!(holders[0].has_accepted_tasks());
        assert!(!holders[1].has_accepted_tasks());
        let task = &holders[0].accepted_tasks()[0];
        assert_eq!(task.task_id.request_id(), "small");
        assert_eq!(task.task_id.host(), "h1");
        assert_eq!(matcher.pending().await, 1);
        assert!(store.get_task(&task.task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_round_requeues_everything_in_order() {
        let store = Arc::new(InMemoryTaskStore::new());
        let matcher = FirstFitMatcher::new(store.clone());
        matcher.submit(request("first", 1.0, 128.0)).await;
        matcher.submit(request("huge", 64.0, 128.0)).await;
        matcher
            .submit(TaskRequest {
                deploy_id: String::new(),
                ..request("broken", 1.0, 128.0)
            })
            .await;
        matcher.submit(request("last", 1.0, 128.0)).await;

        let result = matcher
            .check_offers(vec![offer("o1", "h1", 4.0, 1024.0)])
            .await;

        assert!(result.is_err());
        let queued: Vec<String> = matcher
            .pending
            .lock()
            .await
            .iter()
            .map(|r| r.request_id.clone())
            .collect();
        assert_eq!(queued, vec!["first", "huge", "broken", "last"]);
        assert_eq!(store.task_count().await, 0);
    }

    #[test]
    fn test_requests_parse_from_json() {
        let json = r#"[
            {
                "requestId": "web",
                "deployId": "d1",
                "instanceNo": 2,
                "resources": [
                    {"name": "cpus", "type": "SCALAR", "scalar": 1.5},
                    {"name": "mem", "type": "SCALAR", "scalar": 256.0}
                ],
                "command": "./run"
            },
            {
                "requestId": "batch",
                "deployId": "d7",
                "instanceNo": 1,
                "resources": [],
                "customExecutor": {"executorId": "exec-1", "command": "/usr/bin/executor"}
            }
        ]"#;

        let requests = TaskRequest::list_from_json(json).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].resources[0], Resource::scalar("cpus", 1.5));
        assert_eq!(requests[0].command.as_deref(), Some("./run"));
        let executor = requests[1].custom_executor.as_ref().unwrap();
        assert_eq!(executor.executor_id.as_str(), "exec-1");
        assert!(requests[1].command.is_none());

        assert!(TaskRequest::list_from_json("{}").is_err());
    }
}
