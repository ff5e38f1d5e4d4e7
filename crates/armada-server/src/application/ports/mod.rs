pub mod protocol;
pub mod store;

pub use protocol::{Protocol, ReportSpec};
pub use store::{AgentUpdater, RolloutUpdater, Store};
