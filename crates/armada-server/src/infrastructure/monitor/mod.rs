pub mod cleanup_monitor;

pub use cleanup_monitor::CleanupMonitor;
