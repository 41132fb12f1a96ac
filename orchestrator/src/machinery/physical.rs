/// Physical machines
///
/// Bare-metal guests are powered independently of the sandbox, so start and
/// stop only track which machines are currently assigned to an analysis.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use shared::Result;

use super::{BackendSettings, Hypervisor};
use crate::models::Machine;

#[derive(Debug, Default)]
pub struct Physical {
    active: Mutex<HashSet<String>>,
}

impl Physical {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(_settings: &BackendSettings) -> Result<Arc<dyn Hypervisor>> {
        Ok(Arc::new(Self::new()))
    }

    fn active(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Hypervisor for Physical {
    async fn initialize(&self, machines: &[Machine]) -> Result<()> {
        info!("Using {} physical machine/s", machines.len());
        self.active().clear();
        Ok(())
    }

    async fn start(&self, machine: &Machine) -> Result<()> {
        debug!(machine = %machine.name, ip = %machine.ip, "Physical machine assigned");
        self.active().insert(machine.label.clone());
        Ok(())
    }

    async fn stop(&self, machine: &Machine) -> Result<()> {
        debug!(machine = %machine.name, "Physical machine released");
        self.active().remove(&machine.label);
        Ok(())
    }

    async fn is_running(&self, machine: &Machine) -> Result<bool> {
        Ok(self.active().contains(&machine.label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MachineState;

    fn machine() -> Machine {
        Machine {
            name: "pc1".to_string(),
            label: "pc1".to_string(),
            platform: "windows".to_string(),
            ip: "10.0.0.5".parse().unwrap(),
            tags: vec![],
            interface: None,
            snapshot: None,
            service: false,
            state: MachineState::Free,
        }
    }

    #[tokio::test]
    async fn test_start_stop_tracks_running() {
        let backend = Physical::new();
        let m = machine();
        backend.initialize(std::slice::from_ref(&m)).await.unwrap();

        assert!(!backend.is_running(&m).await.unwrap());
        backend.start(&m).await.unwrap();
        assert!(backend.is_running(&m).await.unwrap());
        backend.stop(&m).await.unwrap();
        assert!(!backend.is_running(&m).await.unwrap());
    }
}
