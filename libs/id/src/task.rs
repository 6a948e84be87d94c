//! Structured scheduler task IDs.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

const COMPONENTS: usize = 6;

/// Identifier of a task launched by the scheduler.
///
/// The string form is what the resource manager sees as the task ID, so it
/// must round-trip exactly through status updates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    request_id: String,
    deploy_id: String,
    started_at: i64,
    instance_no: u32,
    host: String,
    rack_id: String,
}

impl TaskId {
    /// Builds a task ID. Host and rack are sanitized so the ID stays parseable.
    pub fn new(
        request_id: impl Into<String>,
        deploy_id: impl Into<String>,
        started_at: i64,
        instance_no: u32,
        host: &str,
        rack_id: &str,
    ) -> Result<Self, IdError> {
        let request_id = request_id.into();
        let deploy_id = deploy_id.into();

        if request_id.is_empty() {
            return Err(IdError::EmptyComponent { field: "request ID" });
        }
        if deploy_id.is_empty() {
            return Err(IdError::EmptyComponent { field: "deploy ID" });
        }
        if deploy_id.contains('-') || deploy_id.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidCharacters {
                kind: "deploy ID",
                value: deploy_id,
            });
        }
        if request_id.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidCharacters {
                kind: "request ID",
                value: request_id,
            });
        }
        if started_at < 0 {
            return Err(IdError::InvalidNumber {
                field: "start timestamp",
                value: started_at.to_string(),
            });
        }

        let host = sanitize(host);
        let rack_id = sanitize(rack_id);
        if host.is_empty() {
            return Err(IdError::EmptyComponent { field: "host" });
        }
        if rack_id.is_empty() {
            return Err(IdError::EmptyComponent { field: "rack ID" });
        }

        Ok(Self {
            request_id,
            deploy_id,
            started_at,
            instance_no,
            host,
            rack_id,
        })
    }

    /// Parses a task ID from its canonical string form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        // Right to left: rack, host, instance, started, deploy, request.
        let parts: Vec<&str> = s.rsplitn(COMPONENTS, '-').collect();
        if parts.len() < COMPONENTS {
            return Err(IdError::MissingComponents {
                value: s.to_string(),
                expected: COMPONENTS,
                found: parts.len(),
            });
        }

        let instance_no = parts[2]
            .parse::<u32>()
            .map_err(|_| IdError::InvalidNumber {
                field: "instance number",
                value: parts[2].to_string(),
            })?;
        let started_at = parts[3]
            .parse::<i64>()
            .map_err(|_| IdError::InvalidNumber {
                field: "start timestamp",
                value: parts[3].to_string(),
            })?;

        let id = Self::new(parts[5], parts[4], started_at, instance_no, parts[1], parts[0])?;

        // Sanitizing must be a no-op for a well-formed ID.
        if id.host != parts[1] || id.rack_id != parts[0] {
            return Err(IdError::InvalidCharacters {
                kind: "task ID",
                value: s.to_string(),
            });
        }

        Ok(id)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deploy_id(&self) -> &str {
        &self.deploy_id
    }

    /// Launch time in milliseconds since the Unix epoch.
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    pub fn instance_no(&self) -> u32 {
        self.instance_no
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn rack_id(&self) -> &str {
        &self.rack_id
    }
}

fn sanitize(value: &str) -> String {
    value.trim().replace('-', "_")
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}-{}-{}",
            self.request_id, self.deploy_id, self.started_at, self.instance_no, self.host, self.rack_id
        )
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
