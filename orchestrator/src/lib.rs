//! Detector orchestrator: machine scheduler and guest result server

pub mod config;
pub mod machinery;
pub mod models;
pub mod resultserver;
pub mod scheduler;
pub mod startup;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use resultserver::ResultServer;
pub use scheduler::Scheduler;
