//! Records shared by the task store, the machine pool and the scheduler

pub mod machine;
pub mod task;

pub use machine::{Machine, MachineCriteria, MachineState};
pub use task::{NewTask, Task, TaskCategory, TaskStatus};
