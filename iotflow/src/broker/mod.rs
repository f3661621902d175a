pub mod dispatcher;
pub mod queue;
pub mod topic;

pub use dispatcher::{BrokerConfig, ConnectionState, Dispatcher};
