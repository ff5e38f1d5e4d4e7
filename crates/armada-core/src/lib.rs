pub mod agent_types;
pub mod configuration_types;
pub mod core_types;
pub mod rollout_types;
pub mod selector;

pub mod broadcast;
pub mod eventbus;

pub mod config;
pub mod error;

pub mod backoff;
pub mod constants;
pub mod nats;
pub mod shutdown;
pub mod telemetry;

pub use constants::*;
