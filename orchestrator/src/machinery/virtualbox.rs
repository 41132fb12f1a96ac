/// VirtualBox machine manager
///
/// Drives `VBoxManage` as a child process. Every invocation is bounded by the
/// configured machine state timeout and killed if it overruns.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use shared::{DetectorError, Result};

use super::{BackendSettings, Hypervisor};
use crate::models::Machine;

const DEFAULT_VBOXMANAGE: &str = "/usr/bin/VBoxManage";
const DEFAULT_MODE: &str = "headless";

pub struct VirtualBox {
    path: PathBuf,
    mode: String,
    timeout: Duration,
}

impl VirtualBox {
    pub fn new(path: impl Into<PathBuf>, mode: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            mode: mode.into(),
            timeout,
        }
    }

    pub fn create(settings: &BackendSettings) -> Result<Arc<dyn Hypervisor>> {
        let mode = settings.get("mode").unwrap_or(DEFAULT_MODE);
        if !matches!(mode, "gui" | "headless" | "sdl") {
            return Err(DetectorError::Machine(format!(
                "VirtualBox mode must be gui, headless or sdl, not {}",
                mode
            )));
        }
        let timeout = if settings.vm_state_timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            settings.vm_state_timeout
        };

        Ok(Arc::new(Self::new(
            settings.get("path").unwrap_or(DEFAULT_VBOXMANAGE),
            mode,
            timeout,
        )))
    }

    async fn vboxmanage(&self, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", self.path.display(), args.join(" "));

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.path).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| {
            DetectorError::Machine(format!(
                "VBoxManage {} timed out after {:?}",
                args.join(" "),
                self.timeout
            ))
        })?
        .map_err(|e| DetectorError::Machine(format!("unable to run VBoxManage: {}", e)))?;

        if !output.status.success() {
            return Err(DetectorError::Machine(format!(
                "VBoxManage {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn state(&self, machine: &Machine) -> Result<Option<String>> {
        let info = self
            .vboxmanage(&["showvminfo", &machine.label, "--machinereadable"])
            .await?;
        Ok(parse_vm_state(&info))
    }
}

/// Extract `VMState="..."` from `showvminfo --machinereadable` output.
pub fn parse_vm_state(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("VMState="))
        .map(|state| state.trim_matches('"').to_string())
}

#[async_trait]
impl Hypervisor for VirtualBox {
    async fn initialize(&self, machines: &[Machine]) -> Result<()> {
        for machine in machines {
            match self.state(machine).await? {
                Some(state) if state == "running" => {
                    warn!(machine = %machine.label, "Machine was left running, powering it off");
                    self.stop(machine).await?;
                }
                Some(_) => {}
                None => {
                    return Err(DetectorError::Machine(format!(
                        "unable to read state of VirtualBox machine {}",
                        machine.label
                    )))
                }
            }
        }
        info!("Verified {} VirtualBox machine/s", machines.len());
        Ok(())
    }

    async fn start(&self, machine: &Machine) -> Result<()> {
        if self.is_running(machine).await? {
            return Err(DetectorError::Machine(format!(
                "trying to start an already running machine: {}",
                machine.label
            )));
        }

        match &machine.snapshot {
            Some(snapshot) => {
                self.vboxmanage(&["snapshot", &machine.label, "restore", snapshot])
                    .await?
            }
            None => {
                self.vboxmanage(&["snapshot", &machine.label, "restorecurrent"])
                    .await?
            }
        };

        self.vboxmanage(&["startvm", &machine.label, "--type", &self.mode])
            .await?;
        info!(machine = %machine.label, "VirtualBox machine started");
        Ok(())
    }

    async fn stop(&self, machine: &Machine) -> Result<()> {
        self.vboxmanage(&["controlvm", &machine.label, "poweroff"])
            .await?;
        info!(machine = %machine.label, "VirtualBox machine powered off");
        Ok(())
    }

    async fn is_running(&self, machine: &Machine) -> Result<bool> {
        Ok(self.state(machine).await?.as_deref() == Some("running"))
    }
}
