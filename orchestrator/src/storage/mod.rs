/// Durable store for analysis tasks and the machine table
///
/// The scheduler reads tasks through [`TaskStore::fetch`], the machine pool
/// keeps machine lock state in the same store so that
/// [`TaskStore::get_available_machines`] always agrees with what the pool
/// hands out.

pub mod database;

pub use database::SqlTaskStore;

use async_trait::async_trait;
use std::fmt;

use shared::Result;

use crate::models::{Machine, MachineCriteria, MachineState, NewTask, Task, TaskStatus};

/// Backing engine of a task store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEngine {
    Sqlite,
    Postgres,
}

impl StoreEngine {
    /// Engines that serialize all writers and degrade under parallel analyses.
    pub fn is_single_writer(&self) -> bool {
        matches!(self, StoreEngine::Sqlite)
    }
}

impl fmt::Display for StoreEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreEngine::Sqlite => f.write_str("sqlite"),
            StoreEngine::Postgres => f.write_str("postgres"),
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    fn engine(&self) -> StoreEngine;

    async fn add_task(&self, task: NewTask) -> Result<i64>;

    async fn view_task(&self, task_id: i64) -> Result<Option<Task>>;

    /// Fetch the next pending task and mark it running.
    ///
    /// `machine` restricts to tasks pinned to that machine. Without a machine,
    /// `service = Some(false)` restricts to unpinned tasks that are not
    /// service-only and `service = Some(true)` to unpinned service tasks.
    async fn fetch(&self, machine: Option<&str>, service: Option<bool>) -> Result<Option<Task>>;

    async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<()>;

    async fn register_machine(&self, machine: &Machine) -> Result<()>;

    /// Drop every machine row left over from a previous run.
    async fn clean_machines(&self) -> Result<()>;

    async fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Machines that are free and not locked by any analysis.
    async fn get_available_machines(&self) -> Result<Vec<Machine>>;

    /// Lock a free machine matching `criteria`, moving it to `starting`.
    async fn lock_machine(&self, criteria: &MachineCriteria) -> Result<Option<Machine>>;

    async fn unlock_machine(&self, name: &str) -> Result<()>;

    async fn set_machine_state(&self, name: &str, state: MachineState) -> Result<()>;
}
