use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use shared::DetectorError;

/// Lock state of a machine in the pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Free,
    Starting,
    Running,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Free => "free",
            MachineState::Starting => "starting",
            MachineState::Running => "running",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(MachineState::Free),
            "starting" => Ok(MachineState::Starting),
            "running" => Ok(MachineState::Running),
            other => Err(DetectorError::Database(format!("unknown machine state '{}'", other))),
        }
    }
}

/// An analysis or service machine known to the pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub name: String,
    /// Backend-side identifier (VM name for the hypervisor).
    pub label: String,
    pub platform: String,
    pub ip: IpAddr,
    pub tags: Vec<String>,
    pub interface: Option<String>,
    pub snapshot: Option<String>,
    /// Service machines are never handed out by the general fetch path.
    pub service: bool,
    pub state: MachineState,
}

impl Machine {
    pub fn is_analysis(&self) -> bool {
        !self.service
    }

    pub fn is_free(&self) -> bool {
        self.state == MachineState::Free
    }
}

/// Selection filter used when an execution unit acquires a machine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachineCriteria {
    pub name: Option<String>,
    pub platform: Option<String>,
    pub tags: Vec<String>,
    /// Whether service machines are eligible.
    pub service: bool,
}

impl MachineCriteria {
    pub fn matches(&self, machine: &Machine) -> bool {
        if !machine.is_free() {
            return false;
        }
        if let Some(name) = &self.name {
            return &machine.name == name;
        }
        if machine.service && !self.service {
            return false;
        }
        if let Some(platform) = &self.platform {
            if &machine.platform != platform {
                return false;
            }
        }
        self.tags.iter().all(|t| machine.tags.contains(t))
    }
}
