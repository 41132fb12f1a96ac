/// Scheduler: hands pending tasks to free machines
///
/// A single control loop ticks once per second. Every tick runs the
/// capacity checks cheapest first and dispatches at most one task to an
/// execution unit, which then runs on its own.

pub mod lock;
pub mod manager;

pub use lock::{ActiveAnalyses, ActiveGuard, MachineLock};
pub use manager::{AnalysisContext, AnalysisManager, Launcher};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use shared::{DetectorError, Result};

use crate::config::{Config, TimeoutsConfig};
use crate::machinery::{MachinePool, MachineryConf, MachineryRegistry};
use crate::models::{Machine, Task};
use crate::resultserver::ResultServer;
use crate::storage::TaskStore;
use crate::utils;

/// Bound of the channel execution units report failures through.
pub const ERROR_CHANNEL_CAPACITY: usize = 64;

const TICK: Duration = Duration::from_secs(1);

/// Machines beyond which synchronous result processing slows dispatch.
const PROCESS_RESULTS_MACHINE_LIMIT: usize = 4;

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A machine is starting; the gate is held.
    MachineStarting,
    LowDiskSpace,
    MachineLimit,
    NoMachines,
    /// Analysis limit reached, waiting for running analyses to finish.
    Draining,
    /// Analysis limit reached and nothing left running.
    Stopped,
    Idle,
    Dispatched(i64),
}

#[derive(Debug, Clone)]
struct Limits {
    freespace_mb: u64,
    max_machines_count: usize,
    max_analysis_count: u64,
}

pub struct Scheduler {
    running: AtomicBool,
    total_analysis_count: AtomicU64,
    limits: Limits,
    timeouts: TimeoutsConfig,
    analyses_path: PathBuf,
    machinery: Arc<MachinePool>,
    machine_lock: MachineLock,
    db: Arc<dyn TaskStore>,
    resultserver: Arc<ResultServer>,
    launcher: Arc<dyn Launcher>,
    active: ActiveAnalyses,
    errors_tx: mpsc::Sender<DetectorError>,
    errors_rx: Mutex<mpsc::Receiver<DetectorError>>,
}

impl Scheduler {
    /// Bring up the machine pool for the configured backend.
    pub async fn initialize(
        config: &Config,
        registry: &MachineryRegistry,
        db: Arc<dyn TaskStore>,
        resultserver: Arc<ResultServer>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        let name = config.detector.machinery.as_str();
        let machine_lock = MachineLock::new(config.detector.max_vmstartup_count);

        let conf = MachineryConf::load(&config.machinery_conf_path(), name)?;
        let settings = conf
            .backend_settings(name, config.timeouts.vm_state)
            .map_err(|e| DetectorError::Critical(format!("Error initializing machines: {}", e)))?;
        let hypervisor = registry.create(name, &settings)?;

        let machinery = Arc::new(MachinePool::new(name, hypervisor, Arc::clone(&db)));
        machinery.initialize(&conf).await.map_err(|e| match e {
            DetectorError::Machine(msg) => {
                DetectorError::Critical(format!("Error initializing machines: {}", msg))
            }
            other => other,
        })?;

        let machines = machinery.machines().await?;
        if machines.is_empty() {
            return Err(DetectorError::Critical("No machines available.".to_string()));
        }
        info!(machinery = name, count = machines.len(), "Loaded machines");

        if machines.len() > 1 && db.engine().is_single_writer() {
            warn!(
                engine = %db.engine(),
                "The {} database does not handle concurrent analyses well, \
                 use PostgreSQL when running more than one machine",
                db.engine()
            );
        }
        if machines.len() > PROCESS_RESULTS_MACHINE_LIMIT && config.detector.process_results {
            warn!(
                "Processing results inside the scheduler with more than {} machines \
                 slows down dispatch, consider disabling PROCESS_RESULTS",
                PROCESS_RESULTS_MACHINE_LIMIT
            );
        }
        for machine in machines.iter().filter(|m| m.interface.is_none()) {
            warn!(
                machine = %machine.name,
                "No network interface configured, the machine will lack full outbound routing"
            );
        }

        let (errors_tx, errors_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Ok(Self {
            running: AtomicBool::new(true),
            total_analysis_count: AtomicU64::new(0),
            limits: Limits {
                freespace_mb: config.detector.freespace_mb,
                max_machines_count: config.detector.max_machines_count,
                max_analysis_count: config.detector.max_analysis_count,
            },
            timeouts: config.timeouts.clone(),
            analyses_path: config.analyses_path(),
            machinery,
            machine_lock,
            db,
            resultserver,
            launcher,
            active: ActiveAnalyses::new(),
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn total_analysis_count(&self) -> u64 {
        self.total_analysis_count.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> &ActiveAnalyses {
        &self.active
    }

    pub fn machine_lock(&self) -> &MachineLock {
        &self.machine_lock
    }

    pub fn machinery(&self) -> &Arc<MachinePool> {
        &self.machinery
    }

    /// Run the control loop until [`Scheduler::stop`] is called.
    ///
    /// Fatal errors reported by execution units end the loop.
    pub async fn start(&self) -> Result<()> {
        info!("Waiting for analysis tasks");
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.is_running() {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }

            match self.tick().await {
                Ok(outcome) => debug!(?outcome, "Scheduler tick"),
                Err(e) if e.is_fatal() => {
                    self.stop().await;
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Scheduler tick failed"),
            }
        }

        info!("End of analyses.");
        Ok(())
    }

    /// Stop the loop and power off every machine still alive.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.machinery.shutdown().await;
    }

    /// One pass of the control loop.
    ///
    /// Errors from execution units are drained whatever the outcome; the
    /// first fatal one is returned.
    pub async fn tick(&self) -> Result<TickOutcome> {
        let outcome = self.evaluate().await;
        let drained = self.drain_errors().await;

        match outcome {
            Ok(outcome) => drained.map(|()| outcome),
            Err(e) => {
                if let Err(fatal) = drained {
                    error!(error = %e, "Scheduler tick failed");
                    return Err(fatal);
                }
                // Store failures inside a tick only cost that tick.
                Err(match e {
                    DetectorError::Database(msg) => DetectorError::Operational(msg),
                    other => other,
                })
            }
        }
    }

    async fn evaluate(&self) -> Result<TickOutcome> {
        // Skip while some machine is still starting.
        if !self.machine_lock.is_free() {
            return Ok(TickOutcome::MachineStarting);
        }

        if self.limits.freespace_mb > 0 {
            let free = utils::free_space_mb(&self.analyses_path)?;
            if free < self.limits.freespace_mb {
                error!(free_mb = free, "Not enough free disk space! (Only {} MB!)", free);
                return Ok(TickOutcome::LowDiskSpace);
            }
        }

        if self.limits.max_machines_count > 0
            && self.machinery.running().await?.len() >= self.limits.max_machines_count
        {
            return Ok(TickOutcome::MachineLimit);
        }

        let availables = self.machinery.availables().await?;
        if availables.is_empty() {
            return Ok(TickOutcome::NoMachines);
        }

        if self.limits.max_analysis_count > 0
            && self.total_analysis_count() >= self.limits.max_analysis_count
        {
            if self.active.get() == 0 {
                info!(
                    max_analysis_count = self.limits.max_analysis_count,
                    "Maximum analysis count reached, stopping"
                );
                self.stop().await;
                return Ok(TickOutcome::Stopped);
            }
            return Ok(TickOutcome::Draining);
        }

        let Some(task) = self.select_task(&availables).await? else {
            return Ok(TickOutcome::Idle);
        };

        let task_id = task.id;
        self.total_analysis_count.fetch_add(1, Ordering::SeqCst);
        info!(task_id, target = %task.target, "Processing task");
        self.launcher.dispatch(task, self.context());
        Ok(TickOutcome::Dispatched(task_id))
    }

    /// Tasks pinned to a free machine come first, then any unpinned task
    /// if a general purpose machine is free.
    async fn select_task(&self, availables: &[Machine]) -> Result<Option<Task>> {
        for machine in availables {
            if let Some(task) = self.db.fetch(Some(&machine.name), None).await? {
                return Ok(Some(task));
            }
        }
        if availables.iter().any(Machine::is_analysis) {
            return self.db.fetch(None, Some(false)).await;
        }
        Ok(None)
    }

    fn context(&self) -> AnalysisContext {
        AnalysisContext {
            machinery: Arc::clone(&self.machinery),
            machine_lock: self.machine_lock.clone(),
            resultserver: Arc::clone(&self.resultserver),
            db: Arc::clone(&self.db),
            errors: self.errors_tx.clone(),
            active: self.active.clone(),
            timeouts: self.timeouts.clone(),
            analyses_path: self.analyses_path.clone(),
        }
    }

    async fn drain_errors(&self) -> Result<()> {
        let mut errors = self.errors_rx.lock().await;
        let mut fatal = None;
        while let Ok(err) = errors.try_recv() {
            error!(error = %err, "Analysis error");
            if err.is_fatal() && fatal.is_none() {
                fatal = Some(err);
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
