/// Machine managers
///
/// A backend ([`Hypervisor`]) knows how to power machines on and off. The
/// [`MachinePool`] wraps one backend and keeps the lock state of every
/// machine in the task store. Backends are registered by name in a
/// [`MachineryRegistry`]; the configured name selects one at startup.

pub mod physical;
pub mod pool;
pub mod virtualbox;

pub use physical::Physical;
pub use pool::MachinePool;
pub use virtualbox::VirtualBox;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shared::{DetectorError, Result};

use crate::models::{Machine, MachineState};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Called once with every configured machine before any is used.
    async fn initialize(&self, machines: &[Machine]) -> Result<()>;

    async fn start(&self, machine: &Machine) -> Result<()>;

    async fn stop(&self, machine: &Machine) -> Result<()>;

    async fn is_running(&self, machine: &Machine) -> Result<bool>;
}

/// Options of the `[<backend>]` section plus shared timeouts
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub values: HashMap<String, String>,
    pub vm_state_timeout: Duration,
}

impl BackendSettings {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

pub type HypervisorFactory = fn(&BackendSettings) -> Result<Arc<dyn Hypervisor>>;

/// Fixed set of machine manager backends, selected by name
pub struct MachineryRegistry {
    factories: BTreeMap<String, HypervisorFactory>,
}

impl MachineryRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: HypervisorFactory) {
        self.factories.insert(name.to_ascii_lowercase(), factory);
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str, settings: &BackendSettings) -> Result<Arc<dyn Hypervisor>> {
        let factory = self.factories.get(&name.to_ascii_lowercase()).ok_or_else(|| {
            DetectorError::Critical(format!(
                "Unknown machine manager \"{}\" (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        factory(settings)
    }
}

impl Default for MachineryRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("physical", Physical::create);
        registry.register("virtualbox", VirtualBox::create);
        registry
    }
}

/// Raw sections of a `conf/<backend>.conf` file
#[derive(Debug, Clone, Default)]
pub struct MachineryConf {
    sections: HashMap<String, HashMap<String, String>>,
}

impl MachineryConf {
    /// Read the backend configuration file. A missing file is fatal.
    pub fn load(path: &Path, backend: &str) -> Result<Self> {
        if !path.exists() {
            return Err(DetectorError::Critical(format!(
                "The configuration file for machine manager \"{}\" does not exist at path: {}",
                backend,
                path.display()
            )));
        }

        let sections: HashMap<String, HashMap<String, String>> = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                DetectorError::Critical(format!("Unable to parse {}: {}", path.display(), e))
            })?;

        Ok(Self::from_sections(sections))
    }

    pub fn from_sections(sections: HashMap<String, HashMap<String, String>>) -> Self {
        let sections = sections
            .into_iter()
            .map(|(name, values)| {
                let values = values
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect();
                (name.to_ascii_lowercase(), values)
            })
            .collect();
        Self { sections }
    }

    pub fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(&name.to_ascii_lowercase())
    }

    pub fn backend_settings(&self, backend: &str, vm_state_timeout: Duration) -> Result<BackendSettings> {
        let values = self.section(backend).cloned().ok_or_else(|| {
            DetectorError::Machine(format!("missing [{}] section in machine manager configuration", backend))
        })?;
        Ok(BackendSettings {
            values,
            vm_state_timeout,
        })
    }

    /// Machines listed under `machines =` of the backend section.
    ///
    /// The backend-level `interface` applies to machines that define none.
    pub fn machines(&self, backend: &str) -> Result<Vec<Machine>> {
        let settings = self.backend_settings(backend, Duration::ZERO)?;
        let default_interface = settings.get("interface").map(str::to_string);

        let names: Vec<&str> = settings
            .get("machines")
            .map(|raw| raw.split(',').map(str::trim).filter(|n| !n.is_empty()).collect())
            .unwrap_or_default();

        names
            .into_iter()
            .map(|name| self.machine(name, default_interface.as_deref()))
            .collect()
    }

    fn machine(&self, name: &str, default_interface: Option<&str>) -> Result<Machine> {
        let section = self.section(name).ok_or_else(|| {
            DetectorError::Machine(format!("machine \"{}\" has no configuration section", name))
        })?;
        let value = |key: &str| {
            section
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let label = value("label").ok_or_else(|| {
            DetectorError::Machine(format!("machine \"{}\" is missing a label", name))
        })?;
        let ip = value("ip").ok_or_else(|| {
            DetectorError::Machine(format!("machine \"{}\" is missing an ip", name))
        })?;
        let ip = ip.parse::<std::net::IpAddr>().map_err(|e| {
            DetectorError::Machine(format!("machine \"{}\" has invalid ip {}: {}", name, ip, e))
        })?;
        let service = match value("service") {
            None => false,
            Some(raw) => parse_flag(raw).ok_or_else(|| {
                DetectorError::Machine(format!("machine \"{}\" has invalid service flag {}", name, raw))
            })?,
        };

        Ok(Machine {
            name: name.to_string(),
            label: label.to_string(),
            platform: value("platform").unwrap_or("windows").to_string(),
            ip,
            tags: value("tags")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            interface: value("interface")
                .map(str::to_string)
                .or_else(|| default_interface.map(str::to_string)),
            snapshot: value("snapshot").map(str::to_string),
            service,
            state: MachineState::Free,
        })
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}
