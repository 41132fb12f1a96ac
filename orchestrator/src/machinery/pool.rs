use std::sync::Arc;
use tracing::{error, info, warn};

use shared::{DetectorError, Result};

use super::{Hypervisor, MachineryConf};
use crate::models::{Machine, MachineCriteria, MachineState};
use crate::storage::TaskStore;

/// Pool of analysis machines managed by one backend
///
/// Lock state lives in the task store so that every machine is assigned to
/// at most one running task, whichever component asks.
pub struct MachinePool {
    name: String,
    hypervisor: Arc<dyn Hypervisor>,
    db: Arc<dyn TaskStore>,
}

impl MachinePool {
    pub fn new(name: impl Into<String>, hypervisor: Arc<dyn Hypervisor>, db: Arc<dyn TaskStore>) -> Self {
        Self {
            name: name.into(),
            hypervisor,
            db,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register every configured machine and let the backend verify them.
    pub async fn initialize(&self, conf: &MachineryConf) -> Result<()> {
        let machines = conf.machines(&self.name)?;

        self.db.clean_machines().await.map_err(as_machine_error)?;
        for machine in &machines {
            self.db
                .register_machine(machine)
                .await
                .map_err(as_machine_error)?;
        }

        self.hypervisor.initialize(&machines).await?;
        Ok(())
    }

    pub async fn machines(&self) -> Result<Vec<Machine>> {
        self.db.list_machines().await
    }

    /// Machines that are free to take a new analysis.
    pub async fn availables(&self) -> Result<Vec<Machine>> {
        self.db.get_available_machines().await
    }

    /// Machines assigned to an analysis, starting or running.
    pub async fn running(&self) -> Result<Vec<Machine>> {
        Ok(self
            .db
            .list_machines()
            .await?
            .into_iter()
            .filter(|m| !m.is_free())
            .collect())
    }

    /// Lock a free machine matching `criteria`.
    pub async fn acquire(&self, criteria: &MachineCriteria) -> Result<Option<Machine>> {
        self.db.lock_machine(criteria).await
    }

    /// Power on an acquired machine and mark it running.
    pub async fn start(&self, machine: &Machine) -> Result<()> {
        self.hypervisor.start(machine).await?;
        self.db
            .set_machine_state(&machine.name, MachineState::Running)
            .await
    }

    pub async fn stop(&self, machine: &Machine) -> Result<()> {
        self.hypervisor.stop(machine).await
    }

    /// Return a machine to the free list.
    pub async fn release(&self, name: &str) -> Result<()> {
        self.db.unlock_machine(name).await
    }

    /// Power off every machine still alive. Individual failures are logged.
    pub async fn shutdown(&self) {
        let machines = match self.machines().await {
            Ok(machines) => machines,
            Err(e) => {
                error!(error = %e, "Unable to list machines for shutdown");
                return;
            }
        };

        for machine in machines {
            match self.hypervisor.is_running(&machine).await {
                Ok(true) => {
                    warn!(machine = %machine.name, "Machine still running, powering off");
                    if let Err(e) = self.hypervisor.stop(&machine).await {
                        warn!(machine = %machine.name, error = %e, "Unable to power off machine");
                        continue;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(machine = %machine.name, error = %e, "Unable to query machine state");
                    continue;
                }
            }
            if !machine.is_free() {
                if let Err(e) = self.release(&machine.name).await {
                    warn!(machine = %machine.name, error = %e, "Unable to release machine");
                }
            }
        }
        info!(machinery = %self.name, "Machine pool shut down");
    }
}

fn as_machine_error(err: DetectorError) -> DetectorError {
    match err {
        DetectorError::Machine(_) => err,
        other => DetectorError::Machine(other.to_string()),
    }
}
