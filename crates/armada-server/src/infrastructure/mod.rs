pub mod lifecycle;
pub mod monitor;
pub mod persistence;
