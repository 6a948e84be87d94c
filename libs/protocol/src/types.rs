//! Protocol data types: resources, offers, master identity, and task status.

use std::collections::{BTreeMap, BTreeSet};

use lattice_id::{AgentId, ExecutorId, FrameworkId, IdError, OfferId, TaskId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role reported for resources that carry no explicit reservation.
pub const DEFAULT_ROLE: &str = "*";

// =============================================================================
// Resources
// =============================================================================

/// An inclusive range of values, used for ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    pub begin: u64,
    pub end: u64,
}

impl ValueRange {
    /// Number of values covered by the range.
    pub fn len(&self) -> u64 {
        if self.end < self.begin {
            0
        } else {
            self.end - self.begin + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The value carried by a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceValue {
    Scalar { scalar: f64 },
    Ranges { ranges: Vec<ValueRange> },
    Set { items: Vec<String> },
}

/// A named resource, optionally reserved for a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(flatten)]
    pub value: ResourceValue,
}

impl Resource {
    /// Creates an unreserved scalar resource.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            role: None,
            value: ResourceValue::Scalar { scalar: value },
        }
    }

    /// Creates an unreserved ranged resource.
    pub fn ranges(name: impl Into<String>, ranges: Vec<ValueRange>) -> Self {
        Self {
            name: name.into(),
            role: None,
            value: ResourceValue::Ranges { ranges },
        }
    }

    /// Reserves the resource for a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// The role this resource belongs to (`*` when unreserved).
    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or(DEFAULT_ROLE)
    }
}

/// Summed totals of the well-known resources.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceTotals {
    pub cpus: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub ports: u64,
}

impl ResourceTotals {
    /// Sums `cpus`, `mem`, `disk`, and `ports` across a resource list.
    pub fn from_resources(resources: &[Resource]) -> Self {
        let mut totals = Self::default();
        for resource in resources {
            match (resource.name.as_str(), &resource.value) {
                ("cpus", ResourceValue::Scalar { scalar }) => totals.cpus += scalar,
                ("mem", ResourceValue::Scalar { scalar }) => totals.memory_mb += scalar,
                ("disk", ResourceValue::Scalar { scalar }) => totals.disk_mb += scalar,
                ("ports", ResourceValue::Ranges { ranges }) => {
                    totals.ports += ranges.iter().map(ValueRange::len).sum::<u64>();
                }
                _ => {}
            }
        }
        totals
    }

    /// Returns true if `request` fits inside these totals.
    pub fn fits(&self, request: &ResourceTotals) -> bool {
        request.cpus <= self.cpus
            && request.memory_mb <= self.memory_mb
            && request.disk_mb <= self.disk_mb
            && request.ports <= self.ports
    }

    /// Consumes as much of `request` as these totals cover and returns the
    /// part that is still unmet.
    pub fn consume(&mut self, request: &ResourceTotals) -> ResourceTotals {
        let cpus = request.cpus.min(self.cpus);
        let memory_mb = request.memory_mb.min(self.memory_mb);
        let disk_mb = request.disk_mb.min(self.disk_mb);
        let ports = request.ports.min(self.ports);

        self.cpus -= cpus;
        self.memory_mb -= memory_mb;
        self.disk_mb -= disk_mb;
        self.ports -= ports;

        ResourceTotals {
            cpus: request.cpus - cpus,
            memory_mb: request.memory_mb - memory_mb,
            disk_mb: request.disk_mb - disk_mb,
            ports: request.ports - ports,
        }
    }

    /// Returns true when nothing is requested.
    pub fn is_zero(&self) -> bool {
        self.cpus <= 0.0 && self.memory_mb <= 0.0 && self.disk_mb <= 0.0 && self.ports == 0
    }
}

// =============================================================================
// Offers
// =============================================================================

/// A time-bounded grant of resources on one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub hostname: String,

    #[serde(default)]
    pub resources: Vec<Resource>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Offer {
    /// Sum of all scalar resources with the given name.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter(|r| r.name == name)
            .filter_map(|r| match r.value {
                ResourceValue::Scalar { scalar } => Some(scalar),
                _ => None,
            })
            .sum()
    }

    pub fn cpus(&self) -> f64 {
        self.scalar("cpus")
    }

    pub fn memory_mb(&self) -> f64 {
        self.scalar("mem")
    }

    pub fn disk_mb(&self) -> f64 {
        self.scalar("disk")
    }

    /// Number of individual ports offered.
    pub fn port_count(&self) -> u64 {
        self.totals().ports
    }

    /// Roles present in the offer.
    pub fn roles(&self) -> BTreeSet<String> {
        self.resources.iter().map(|r| r.role().to_string()).collect()
    }

    pub fn totals(&self) -> ResourceTotals {
        ResourceTotals::from_resources(&self.resources)
    }

    /// Rack the agent reports through its `rackid` attribute, if any.
    pub fn rack_id(&self) -> Option<&str> {
        self.attributes.get("rackid").map(String::as_str)
    }
}

/// An inverse offer: the master asking for resources back. Not acted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverseOffer {
    pub id: OfferId,

    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

// =============================================================================
// Master
// =============================================================================

/// Identity and endpoint of the current leading master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub id: String,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub ip: Option<String>,

    pub port: u16,

    #[serde(default)]
    pub version: Option<String>,
}

impl MasterInfo {
    /// `host:port`, preferring the hostname over the IP.
    pub fn endpoint(&self) -> String {
        let host = self
            .hostname
            .as_deref()
            .or(self.ip.as_deref())
            .unwrap_or("unknown");
        format!("{}:{}", host, self.port)
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Task state reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_KILLING")]
    Killing,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_ERROR")]
    Error,
    #[serde(rename = "TASK_LOST")]
    Lost,
    #[serde(rename = "TASK_DROPPED")]
    Dropped,
    #[serde(rename = "TASK_UNREACHABLE")]
    Unreachable,
    #[serde(rename = "TASK_GONE")]
    Gone,
    #[serde(rename = "TASK_GONE_BY_OPERATOR")]
    GoneByOperator,
    #[serde(rename = "TASK_UNKNOWN")]
    Unknown,
}

impl TaskState {
    /// Returns true if the task will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished
                | TaskState::Failed
                | TaskState::Killed
                | TaskState::Error
                | TaskState::Lost
                | TaskState::Dropped
                | TaskState::Gone
                | TaskState::GoneByOperator
        )
    }
}

/// Token the master expects back to stop redelivering a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckToken(Uuid);

impl AckToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AckToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AckToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A status report for one task.
///
/// `task_id` is kept as the raw string the master sent: reconciliation can
/// report tasks this scheduler did not launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub state: TaskState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Seconds since the Unix epoch at which the status was generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<AckToken>,
}

impl TaskStatus {
    /// Creates a status with no optional fields set.
    pub fn new(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            agent_id: None,
            executor_id: None,
            message: None,
            reason: None,
            timestamp: None,
            uuid: None,
        }
    }

    /// Parses the task ID as one of ours.
    pub fn parsed_task_id(&self) -> Result<TaskId, IdError> {
        TaskId::parse(&self.task_id)
    }

    /// Returns true if the master expects an acknowledgment.
    pub fn needs_ack(&self) -> bool {
        self.uuid.is_some()
    }
}

/// Executor launched alongside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub command: String,
}

/// A task to launch against accepted offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: AgentId,

    #[serde(default)]
    pub resources: Vec<Resource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl TaskInfo {
    pub fn totals(&self) -> ResourceTotals {
        ResourceTotals::from_resources(&self.resources)
    }
}

// =============================================================================
// Tests
// =============================================================================
