pub mod assignment;
pub mod config;
pub mod counter;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod stats;
pub mod substrate;
pub mod topology;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use assignment::Assignment;
pub use config::{Backend, Config};
pub use error::LoadError;
pub use launcher::{LaunchSummary, Launcher};
pub use orchestrator::LoadTest;
pub use pool::ConnectionPool;
pub use stats::RunReport;
pub use substrate::{Connection, Connector, MemoryBroker, MqttConnector};
