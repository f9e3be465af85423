use crate::assignment::Assignment;
use crate::error::LoadError;
use crate::substrate::{Connection, Connector};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

/// Builds a broker-unique client id such as `room-load-consumer-3-<uuid>`
pub fn client_id(prefix: &str, role: &str) -> String {
    let n = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}-{}", prefix, role, n, uuid::Uuid::new_v4().simple())
}

/// Connections owned for the whole run.
///
/// Workers hold clones of these handles but never close them; everything
/// is released when the pool is dropped at process exit.
pub struct ConnectionPool {
    shared: Arc<dyn Connection>,
    producers: Vec<Arc<dyn Connection>>,
    consumers: Vec<Arc<dyn Connection>>,
}

impl ConnectionPool {
    /// Opens every connection the assignment calls for.
    ///
    /// The first failure aborts and drops whatever was opened so far.
    pub async fn open<C: Connector>(
        connector: &C,
        shared: Arc<dyn Connection>,
        assignment: &Assignment,
        client_id_prefix: &str,
    ) -> Result<Self, LoadError> {
        let producers =
            Self::open_many(connector, "producer", assignment.producer_connections, client_id_prefix)
                .await?;
        if assignment.pooled {
            info!("Created producer connections (count {})", producers.len());
        }

        let consumers =
            Self::open_many(connector, "consumer", assignment.consumer_connections, client_id_prefix)
                .await?;
        if assignment.pooled {
            info!("Created consumer connections (count {})", consumers.len());
        }

        Ok(Self {
            shared,
            producers,
            consumers,
        })
    }

    async fn open_many<C: Connector>(
        connector: &C,
        role: &'static str,
        count: usize,
        client_id_prefix: &str,
    ) -> Result<Vec<Arc<dyn Connection>>, LoadError> {
        let mut conns = Vec::with_capacity(count);
        for index in 0..count {
            let conn = connector
                .connect(&client_id(client_id_prefix, role))
                .await
                .map_err(|source| LoadError::Connection {
                    role,
                    index,
                    source,
                })?;
            conns.push(conn);
        }
        Ok(conns)
    }

    /// The setup connection, also used by every worker when pooling is off
    pub fn shared(&self) -> &Arc<dyn Connection> {
        &self.shared
    }

    pub fn producer(&self, slot: Option<usize>) -> Arc<dyn Connection> {
        Self::pick(&self.shared, &self.producers, slot)
    }

    pub fn consumer(&self, slot: Option<usize>) -> Arc<dyn Connection> {
        Self::pick(&self.shared, &self.consumers, slot)
    }

    fn pick(
        shared: &Arc<dyn Connection>,
        pooled: &[Arc<dyn Connection>],
        slot: Option<usize>,
    ) -> Arc<dyn Connection> {
        slot.and_then(|slot| pooled.get(slot))
            .unwrap_or(shared)
            .clone()
    }

    /// Connections opened by the pool, not counting the shared one
    pub fn len(&self) -> usize {
        self.producers.len() + self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::substrate::{MemoryBroker, SubstrateError};
    use std::sync::atomic::AtomicUsize;

    /// Connector that fails after a fixed number of successful connections
    struct FlakyConnector {
        broker: MemoryBroker,
        remaining: AtomicUsize,
    }

    impl Connector for FlakyConnector {
        async fn connect(&self, client_id: &str) -> Result<Arc<dyn Connection>, SubstrateError> {
            let left = self.remaining.load(Ordering::Relaxed);
            if left == 0 {
                return Err(SubstrateError::Connect("refused".to_string()));
            }
            self.remaining.store(left - 1, Ordering::Relaxed);
            self.broker.connect(client_id).await
        }
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = client_id("room-load", "producer");
        let b = client_id("room-load", "producer");
        assert!(a.starts_with("room-load-producer-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_opens_assigned_connections() {
        let broker = MemoryBroker::new(16);
        let shared = broker.connect("setup").await.unwrap();
        let config = Config {
            num_rooms: 4,
            consumers_per_room: 3,
            consumers_per_connection: 5,
            ..Config::default()
        };
        let assignment = Assignment::compute(&config);

        let pool = ConnectionPool::open(&broker, shared, &assignment, "test")
            .await
            .unwrap();
        // 4 producer connections + ceil(12 / 5) consumer connections
        assert_eq!(pool.len(), 7);
        assert_eq!(broker.connection_count(), 8);
    }

    #[tokio::test]
    async fn test_unpooled_workers_share_setup_connection() {
        let broker = MemoryBroker::new(16);
        let shared = broker.connect("setup").await.unwrap();
        let config = Config {
            num_rooms: 4,
            use_pooling: false,
            ..Config::default()
        };
        let assignment = Assignment::compute(&config);

        let pool = ConnectionPool::open(&broker, Arc::clone(&shared), &assignment, "test")
            .await
            .unwrap();
        assert!(pool.is_empty());
        assert!(Arc::ptr_eq(&pool.producer(assignment.producer_slot(2)), &shared));
        assert!(Arc::ptr_eq(&pool.consumer(assignment.consumer_slot(2, 0)), &shared));
    }

    #[tokio::test]
    async fn test_any_connection_failure_aborts() {
        let broker = MemoryBroker::new(16);
        let shared = broker.connect("setup").await.unwrap();
        let connector = FlakyConnector {
            broker: broker.clone(),
            remaining: AtomicUsize::new(5),
        };
        let config = Config {
            num_rooms: 4,
            consumers_per_room: 2,
            consumers_per_connection: 2,
            ..Config::default()
        };
        let assignment = Assignment::compute(&config);

        let result = ConnectionPool::open(&connector, shared, &assignment, "test").await;
        match result {
            Err(LoadError::Connection { role, index, .. }) => {
                assert_eq!(role, "consumer");
                assert_eq!(index, 1);
            }
            _ => panic!("expected a connection error"),
        }
    }
}
