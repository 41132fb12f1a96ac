use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use shared::DetectorError;

/// Tag that marks a task as service-only.
pub const SERVICE_TAG: &str = "service";

/// Lifecycle of an analysis task. Transitions only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Reported,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Reported => "reported",
        }
    }

    /// Only the immediate successor is reachable.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Completed, TaskStatus::Reported)
        )
    }

    /// The single status `self` can be reached from.
    pub fn predecessor(&self) -> Option<TaskStatus> {
        [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
            .into_iter()
            .find(|previous| previous.can_transition_to(*self))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "reported" => Ok(TaskStatus::Reported),
            other => Err(DetectorError::Database(format!("unknown task status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    File,
    Url,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::File => "file",
            TaskCategory::Url => "url",
        }
    }
}

impl FromStr for TaskCategory {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(TaskCategory::File),
            "url" => Ok(TaskCategory::Url),
            other => Err(DetectorError::Database(format!("unknown task category '{}'", other))),
        }
    }
}

/// An analysis task as stored in the task store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub category: TaskCategory,
    pub target: String,
    pub options: BTreeMap<String, String>,
    pub package: Option<String>,
    pub platform: Option<String>,
    /// Pins the task to one machine by name.
    pub machine: Option<String>,
    pub tags: Vec<String>,
    pub priority: i64,
    /// Analysis duration in seconds. `None` uses the configured default.
    pub timeout: Option<u64>,
    pub status: TaskStatus,
    pub added_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_service(&self) -> bool {
        self.tags.iter().any(|t| t == SERVICE_TAG)
    }
}

/// Submission request for a new task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub category: Option<TaskCategory>,
    pub target: String,
    pub options: BTreeMap<String, String>,
    pub package: Option<String>,
    pub platform: Option<String>,
    pub machine: Option<String>,
    pub tags: Vec<String>,
    pub priority: i64,
    pub timeout: Option<u64>,
}

impl NewTask {
    pub fn file(target: impl Into<String>) -> Self {
        Self {
            category: Some(TaskCategory::File),
            target: target.into(),
            priority: 1,
            ..Default::default()
        }
    }

    pub fn url(target: impl Into<String>) -> Self {
        Self {
            category: Some(TaskCategory::Url),
            target: target.into(),
            priority: 1,
            ..Default::default()
        }
    }

    pub fn pinned_to(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// Parse `key=value,key2=value2` option strings. Entries without `=` are skipped.
pub fn parse_options(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Completed.can_transition_to(TaskStatus::Reported));

        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Reported.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Completed));

        assert_eq!(TaskStatus::Pending.predecessor(), None);
        assert_eq!(TaskStatus::Running.predecessor(), Some(TaskStatus::Pending));
        assert_eq!(TaskStatus::Reported.predecessor(), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("reported".parse::<TaskStatus>().unwrap(), TaskStatus::Reported);
        assert!("failed".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_parse_options() {
        let opts = parse_options("procmemdump=yes, free = 1,broken,=x");
        assert_eq!(opts.len(), 2);
        assert_eq!(opts.get("procmemdump").map(String::as_str), Some("yes"));
        assert_eq!(opts.get("free").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_service_tag() {
        let new = NewTask::file("/tmp/a.exe").with_tags(&["service", "x64"]);
        assert_eq!(new.tags, vec!["service".to_string(), "x64".to_string()]);
    }
}
