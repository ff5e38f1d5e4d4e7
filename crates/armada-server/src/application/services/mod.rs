pub mod manager;
pub mod scheduler;

pub use manager::Manager;
pub use scheduler::{RolloutScheduler, SchedulerError};
