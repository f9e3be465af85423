//! Interface to the messaging substrate the load generator drives.
//!
//! The engine only needs non-blocking publish, filter subscriptions and
//! idempotent partition provisioning. Everything else about the broker
//! (transport, durability, fan-out) stays behind these traits.

pub mod memory;
pub mod mqtt;

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryBroker;
pub use mqtt::MqttConnector;

/// Callback invoked for each delivered message with its topic and payload.
///
/// Runs on the substrate's dispatch path, so it must not block.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("partition '{0}' already exists")]
    AlreadyExists(String),

    #[error("partition '{0}' not found")]
    NotFound(String),

    #[error("publish queue is full ({pending} pending)")]
    QueueFull { pending: usize },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("client error: {0}")]
    Client(String),
}

/// Handle returned by [`Connection::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Desired shape of a provisioned partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    pub name: String,
    /// Filter covering every topic stored in the partition
    pub subjects: String,
    pub max_age: Duration,
    pub replicas: usize,
}

/// Observed state of an existing partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub subjects: String,
    pub max_age: Duration,
    pub replicas: usize,
}

impl From<&PartitionSpec> for PartitionInfo {
    fn from(spec: &PartitionSpec) -> Self {
        Self {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            max_age: spec.max_age,
            replicas: spec.replicas,
        }
    }
}

/// An open session with the substrate, shared by many workers.
///
/// Implementations must tolerate concurrent `publish` calls and concurrent
/// subscription registration from different workers.
#[cfg_attr(test, mockall::automock)]
pub trait Connection: Send + Sync {
    /// Enqueues a message without waiting for the broker.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SubstrateError>;

    /// Publishes submitted but not yet written out.
    fn pending(&self) -> usize;

    fn subscribe(
        &self,
        filter: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, SubstrateError>;

    /// Removes a subscription. Once this returns, its handler is no longer running.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubstrateError>;

    fn partition_info(&self, name: &str) -> Result<Option<PartitionInfo>, SubstrateError>;

    /// Creates a partition. Fails with [`SubstrateError::AlreadyExists`] if it exists.
    fn provision_partition(&self, spec: &PartitionSpec) -> Result<(), SubstrateError>;

    fn update_partition_retention(
        &self,
        name: &str,
        max_age: Duration,
    ) -> Result<(), SubstrateError>;
}

/// Opens connections to the substrate
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        client_id: &str,
    ) -> impl Future<Output = Result<Arc<dyn Connection>, SubstrateError>> + Send;
}

/// Check if a topic matches a subscription filter
/// Supports MQTT wildcards: + (single level), # (multi level)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == topic || filter == "#" {
        return true;
    }
    if !filter.contains('+') && !filter.contains('#') {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // # must be the last level and also matches its parent
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
