use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use shared::{DetectorError, Result};

use super::lock::{ActiveAnalyses, MachineLock};
use crate::config::TimeoutsConfig;
use crate::machinery::MachinePool;
use crate::models::{Machine, MachineCriteria, Task, TaskStatus};
use crate::models::task::SERVICE_TAG;
use crate::resultserver::ResultServer;
use crate::storage::TaskStore;

/// Delay between two attempts to lock a machine for a task.
const MACHINE_POLL: Duration = Duration::from_secs(1);

/// Everything an execution unit needs, handed over by the scheduler
#[derive(Clone)]
pub struct AnalysisContext {
    pub machinery: Arc<MachinePool>,
    pub machine_lock: MachineLock,
    pub resultserver: Arc<ResultServer>,
    pub db: Arc<dyn TaskStore>,
    pub errors: mpsc::Sender<DetectorError>,
    pub active: ActiveAnalyses,
    pub timeouts: TimeoutsConfig,
    pub analyses_path: PathBuf,
}

impl AnalysisContext {
    /// Push an error for the scheduler to surface. Never blocks.
    pub fn report(&self, err: DetectorError) {
        match self.errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                error!(error = %err, "Error channel full, dropping analysis error");
            }
            Err(TrySendError::Closed(err)) => {
                debug!(error = %err, "Scheduler gone, dropping analysis error");
            }
        }
    }
}

/// Starts one execution unit per dispatched task
pub trait Launcher: Send + Sync {
    /// Hand `task` to a new execution unit. Must return without waiting on it.
    fn dispatch(&self, task: Task, ctx: AnalysisContext);
}

/// Default execution unit: drives one machine through one task
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisManager;

impl Launcher for AnalysisManager {
    fn dispatch(&self, task: Task, ctx: AnalysisContext) {
        let guard = ctx.active.enter();
        tokio::spawn(async move {
            let _guard = guard;
            let task_id = task.id;

            if let Err(e) = launch_analysis(&task, &ctx).await {
                error!(task_id, error = %e, "Analysis failed");
                ctx.report(e);
            }
            if let Err(e) = ctx.db.set_status(task_id, TaskStatus::Completed).await {
                ctx.report(e);
            }
            info!(task_id, "Task completed");
        });
    }
}

/// Machine selection filter derived from a task.
pub fn criteria_for(task: &Task) -> MachineCriteria {
    MachineCriteria {
        name: task.machine.clone(),
        platform: task.platform.clone(),
        tags: task
            .tags
            .iter()
            .filter(|t| t.as_str() != SERVICE_TAG)
            .cloned()
            .collect(),
        service: task.is_service(),
    }
}

/// Lock a matching machine, holding the startup gate only while an attempt
/// is in flight. The returned permit covers the machine until it has started.
async fn acquire_machine(
    task: &Task,
    ctx: &AnalysisContext,
) -> Result<(Machine, OwnedSemaphorePermit)> {
    let criteria = criteria_for(task);
    loop {
        let permit = ctx.machine_lock.acquire().await?;
        if let Some(machine) = ctx.machinery.acquire(&criteria).await? {
            info!(task_id = task.id, machine = %machine.name, "Task acquired machine");
            return Ok((machine, permit));
        }
        drop(permit);
        debug!(task_id = task.id, "No matching machine free, waiting");
        tokio::time::sleep(MACHINE_POLL).await;
    }
}

async fn launch_analysis(task: &Task, ctx: &AnalysisContext) -> Result<()> {
    info!(task_id = task.id, target = %task.target, "Starting analysis");

    let (machine, permit) = acquire_machine(task, ctx).await?;

    let outcome = run_on_machine(task, &machine, ctx, permit).await;
    teardown(task, &machine, ctx).await;
    outcome
}

async fn run_on_machine(
    task: &Task,
    machine: &Machine,
    ctx: &AnalysisContext,
    permit: OwnedSemaphorePermit,
) -> Result<()> {
    let storage = ctx.analyses_path.join(task.id.to_string());
    tokio::fs::create_dir_all(&storage).await.map_err(|e| {
        DetectorError::Analysis(format!("Unable to create analysis folder {}: {}", storage.display(), e))
    })?;
    let manifest = serde_json::to_vec_pretty(task)
        .map_err(|e| DetectorError::Analysis(format!("Unable to serialize task: {}", e)))?;
    tokio::fs::write(storage.join("task.json"), manifest).await?;

    ctx.resultserver.add_task(task.id, machine.ip).await;

    ctx.machinery.start(machine).await?;
    drop(permit);

    let duration = task
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(ctx.timeouts.default);
    debug!(task_id = task.id, seconds = duration.as_secs(), "Analysis running");
    tokio::time::sleep(duration).await;

    if !ctx
        .resultserver
        .wait_idle(machine.ip, ctx.timeouts.critical)
        .await
    {
        warn!(
            task_id = task.id,
            machine = %machine.name,
            "Guest still connected after the critical timeout, forcing shutdown"
        );
    }
    Ok(())
}

/// Return the machine and the result server slot. Failures are reported
/// and do not stop the remaining steps.
async fn teardown(task: &Task, machine: &Machine, ctx: &AnalysisContext) {
    if let Err(e) = ctx.machinery.stop(machine).await {
        warn!(task_id = task.id, machine = %machine.name, error = %e, "Unable to stop machine");
        ctx.report(e);
    }
    ctx.resultserver.del_task(machine.ip).await;
    if let Err(e) = ctx.machinery.release(&machine.name).await {
        warn!(task_id = task.id, machine = %machine.name, error = %e, "Unable to release machine");
        ctx.report(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResultServerConfig;
    use crate::machinery::{MachineryConf, MockHypervisor};
    use crate::models::NewTask;
    use crate::storage::database::tests::memory_store;
    use std::collections::HashMap;

    fn conf() -> MachineryConf {
        let mut sections = HashMap::new();
        sections.insert(
            "mock".to_string(),
            HashMap::from([("machines".to_string(), "win7".to_string())]),
        );
        sections.insert(
            "win7".to_string(),
            HashMap::from([
                ("label".to_string(), "win7-vm".to_string()),
                ("ip".to_string(), "192.168.56.101".to_string()),
            ]),
        );
        MachineryConf::from_sections(sections)
    }

    async fn context(
        hypervisor: MockHypervisor,
        analyses: &std::path::Path,
    ) -> (AnalysisContext, mpsc::Receiver<DetectorError>) {
        let db: Arc<dyn TaskStore> = Arc::new(memory_store().await);
        let machinery = Arc::new(MachinePool::new("mock", Arc::new(hypervisor), Arc::clone(&db)));
        machinery.initialize(&conf()).await.unwrap();

        let rs_config = ResultServerConfig {
            ip: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..Default::default()
        };
        let resultserver = Arc::new(ResultServer::bind(&rs_config, analyses).await.unwrap());
        let (errors, rx) = mpsc::channel(8);

        let ctx = AnalysisContext {
            machinery,
            machine_lock: MachineLock::new(1),
            resultserver,
            db,
            errors,
            active: ActiveAnalyses::new(),
            timeouts: TimeoutsConfig {
                default: Duration::from_secs(1),
                critical: Duration::ZERO,
                vm_state: Duration::from_secs(1),
            },
            analyses_path: analyses.to_path_buf(),
        };
        (ctx, rx)
    }

    async fn running_task(ctx: &AnalysisContext) -> Task {
        let mut new = NewTask::file("/tmp/sample.exe");
        new.timeout = Some(0);
        ctx.db.add_task(new).await.unwrap();
        ctx.db.fetch(None, Some(false)).await.unwrap().unwrap()
    }

    async fn wait_drained(active: &ActiveAnalyses) {
        for _ in 0..200 {
            if active.get() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("analysis never finished");
    }

    #[test]
    fn test_criteria_for_service_task() {
        let task = Task {
            id: 1,
            category: crate::models::TaskCategory::File,
            target: "x".to_string(),
            options: Default::default(),
            package: None,
            platform: Some("linux".to_string()),
            machine: None,
            tags: vec!["service".to_string(), "x64".to_string()],
            priority: 1,
            timeout: None,
            status: TaskStatus::Pending,
            added_on: chrono::Utc::now(),
            started_on: None,
            completed_on: None,
        };
        let criteria = criteria_for(&task);
        assert!(criteria.service);
        assert_eq!(criteria.tags, vec!["x64".to_string()]);
        assert_eq!(criteria.platform.as_deref(), Some("linux"));
    }

    #[tokio::test]
    async fn test_analysis_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        hypervisor.expect_initialize().returning(|_| Ok(()));
        hypervisor.expect_start().times(1).returning(|_| Ok(()));
        hypervisor.expect_stop().times(1).returning(|_| Ok(()));

        let (ctx, mut errors) = context(hypervisor, dir.path()).await;
        let task = running_task(&ctx).await;
        let task_id = task.id;

        AnalysisManager.dispatch(task, ctx.clone());
        assert_eq!(ctx.active.get(), 1);
        wait_drained(&ctx.active).await;

        let stored = ctx.db.view_task(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(dir.path().join(task_id.to_string()).join("task.json").is_file());
        assert_eq!(ctx.machinery.availables().await.unwrap().len(), 1);
        assert_eq!(ctx.machine_lock.held(), 0);
        assert_eq!(ctx.resultserver.tasks().task_for("192.168.56.101".parse().unwrap()).await, None);
        assert!(errors.try_recv().is_err());
    }

    async fn wait_status(db: &Arc<dyn TaskStore>, task_id: i64, status: TaskStatus) {
        for _ in 0..500 {
            if db.view_task(task_id).await.unwrap().unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task #{} never reached {}", task_id, status);
    }

    #[tokio::test]
    async fn test_waiting_for_a_machine_releases_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        hypervisor.expect_initialize().returning(|_| Ok(()));
        hypervisor.expect_start().times(1).returning(|_| Ok(()));
        hypervisor.expect_stop().returning(|_| Ok(()));

        let (ctx, mut errors) = context(hypervisor, dir.path()).await;

        let mut linux = NewTask::file("/tmp/sample.elf");
        linux.platform = Some("linux".to_string());
        linux.priority = 5;
        ctx.db.add_task(linux).await.unwrap();
        let waiting = ctx.db.fetch(None, Some(false)).await.unwrap().unwrap();
        let waiting_id = waiting.id;

        AnalysisManager.dispatch(waiting, ctx.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctx.machine_lock.held(), 0);
        assert!(ctx.machine_lock.is_free());

        let plain = running_task(&ctx).await;
        let plain_id = plain.id;
        AnalysisManager.dispatch(plain, ctx.clone());
        wait_status(&ctx.db, plain_id, TaskStatus::Completed).await;

        // The linux task is still waiting for a machine that never comes.
        assert_eq!(ctx.active.get(), 1);
        let stored = ctx.db.view_task(waiting_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(ctx.machinery.availables().await.unwrap().len(), 1);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_failure_is_reported_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut hypervisor = MockHypervisor::new();
        hypervisor.expect_initialize().returning(|_| Ok(()));
        hypervisor
            .expect_start()
            .returning(|_| Err(DetectorError::Machine("VBoxManage failed".to_string())));
        hypervisor.expect_stop().returning(|_| Ok(()));

        let (ctx, mut errors) = context(hypervisor, dir.path()).await;
        let task = running_task(&ctx).await;
        let task_id = task.id;

        AnalysisManager.dispatch(task, ctx.clone());
        wait_drained(&ctx.active).await;

        let err = errors.try_recv().unwrap();
        assert!(matches!(err, DetectorError::Machine(_)));
        assert_eq!(ctx.machinery.availables().await.unwrap().len(), 1);
        assert_eq!(ctx.machine_lock.held(), 0);

        let stored = ctx.db.view_task(task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }
}
