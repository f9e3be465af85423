//! In-process loopback broker.
//!
//! Publishes go onto a bounded queue drained by a single dispatch task that
//! hands every message to each matching subscription. Partitions keep the
//! messages stored under their subject filter until `max_age` elapses.

use super::{
    topic_matches, Connection, Connector, MessageHandler, PartitionInfo, PartitionSpec,
    SubscriptionId, SubstrateError,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

struct Delivery {
    topic: String,
    payload: Bytes,
}

struct Route {
    filter: String,
    handler: MessageHandler,
}

struct Partition {
    info: PartitionInfo,
    stored: VecDeque<(Instant, usize)>,
}

impl Partition {
    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.stored.front() {
            if now.duration_since(*at) < self.info.max_age {
                break;
            }
            self.stored.pop_front();
        }
    }
}

struct BrokerState {
    tx: mpsc::Sender<Delivery>,
    routes: RwLock<HashMap<SubscriptionId, Route>>,
    partitions: Mutex<HashMap<String, Partition>>,
    next_subscription: AtomicU64,
    connections: AtomicUsize,
    delivered: AtomicU64,
}

/// Loopback broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Must be called from within a tokio runtime.
    pub fn new(max_pending: usize) -> Self {
        let (tx, rx) = mpsc::channel(max_pending.max(1));
        let state = Arc::new(BrokerState {
            tx,
            routes: RwLock::new(HashMap::new()),
            partitions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
        });

        tokio::spawn(Self::dispatch(Arc::downgrade(&state), rx));
        info!("In-memory broker started (queue capacity {})", max_pending);

        Self { state }
    }

    async fn dispatch(state: std::sync::Weak<BrokerState>, mut rx: mpsc::Receiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            let Some(state) = state.upgrade() else {
                break;
            };

            let now = Instant::now();
            for partition in state.partitions.lock().values_mut() {
                if topic_matches(&partition.info.subjects, &delivery.topic) {
                    partition.prune(now);
                    partition.stored.push_back((now, delivery.payload.len()));
                }
            }

            let routes = state.routes.read();
            for route in routes.values() {
                if topic_matches(&route.filter, &delivery.topic) {
                    (route.handler)(&delivery.topic, &delivery.payload);
                    state.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        debug!("In-memory broker dispatch stopped");
    }

    /// Connections opened so far
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Handler invocations so far, across all subscriptions
    pub fn delivered(&self) -> u64 {
        self.state.delivered.load(Ordering::Relaxed)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.routes.read().len()
    }

    /// Messages currently held by a partition (after pruning expired ones)
    pub fn retained(&self, partition: &str) -> Option<usize> {
        let mut partitions = self.state.partitions.lock();
        let partition = partitions.get_mut(partition)?;
        partition.prune(Instant::now());
        Some(partition.stored.len())
    }
}

impl Connector for MemoryBroker {
    async fn connect(&self, client_id: &str) -> Result<Arc<dyn Connection>, SubstrateError> {
        let count = self.state.connections.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("In-memory connection '{}' opened ({} total)", client_id, count);
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
}

impl Connection for MemoryConnection {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SubstrateError> {
        self.state
            .tx
            .try_send(Delivery {
                topic: topic.to_string(),
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubstrateError::QueueFull {
                    pending: self.pending(),
                },
                mpsc::error::TrySendError::Closed(_) => {
                    SubstrateError::Client("broker dispatch has stopped".to_string())
                }
            })
    }

    fn pending(&self) -> usize {
        self.state.tx.max_capacity() - self.state.tx.capacity()
    }

    fn subscribe(
        &self,
        filter: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, SubstrateError> {
        let id = SubscriptionId(self.state.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.state.routes.write().insert(
            id,
            Route {
                filter: filter.to_string(),
                handler,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubstrateError> {
        // The write lock waits out any dispatch still running the handler
        match self.state.routes.write().remove(&id) {
            Some(_) => Ok(()),
            None => Err(SubstrateError::Client(format!(
                "unknown subscription {}",
                id.0
            ))),
        }
    }

    fn partition_info(&self, name: &str) -> Result<Option<PartitionInfo>, SubstrateError> {
        Ok(self
            .state
            .partitions
            .lock()
            .get(name)
            .map(|p| p.info.clone()))
    }

    fn provision_partition(&self, spec: &PartitionSpec) -> Result<(), SubstrateError> {
        let mut partitions = self.state.partitions.lock();
        if partitions.contains_key(&spec.name) {
            return Err(SubstrateError::AlreadyExists(spec.name.clone()));
        }
        partitions.insert(
            spec.name.clone(),
            Partition {
                info: PartitionInfo::from(spec),
                stored: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn update_partition_retention(
        &self,
        name: &str,
        max_age: Duration,
    ) -> Result<(), SubstrateError> {
        let mut partitions = self.state.partitions.lock();
        let partition = partitions
            .get_mut(name)
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))?;
        partition.info.max_age = max_age;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_handler(count: &Arc<AtomicU64>) -> MessageHandler {
        let count = Arc::clone(count);
        Arc::new(move |_topic, _payload| {
            count.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[tokio::test]
    async fn test_delivers_to_matching_subscriptions() {
        let broker = MemoryBroker::new(64);
        let conn = broker.connect("test").await.unwrap();

        let room1 = Arc::new(AtomicU64::new(0));
        let room2 = Arc::new(AtomicU64::new(0));
        conn.subscribe("s/room1/#", counting_handler(&room1)).unwrap();
        conn.subscribe("s/room2/#", counting_handler(&room2)).unwrap();

        conn.publish("s/room1/message1", Bytes::from_static(b"abc"))
            .unwrap();
        conn.publish("s/room1/message2", Bytes::from_static(b"abc"))
            .unwrap();
        conn.publish("s/room2/message1", Bytes::from_static(b"abc"))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(room1.load(Ordering::Relaxed), 2);
        assert_eq!(room2.load(Ordering::Relaxed), 1);
        assert_eq!(broker.delivered(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = MemoryBroker::new(64);
        let conn = broker.connect("test").await.unwrap();
        let count = Arc::new(AtomicU64::new(0));

        let id = conn.subscribe("a/#", counting_handler(&count)).unwrap();
        conn.unsubscribe(id).unwrap();
        assert!(conn.unsubscribe(id).is_err());

        conn.publish("a/b", Bytes::from_static(b"x")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_publish() {
        let broker = MemoryBroker::new(2);
        let conn = broker.connect("test").await.unwrap();

        // Nothing yields to the dispatch task between these calls
        conn.publish("a/b", Bytes::from_static(b"x")).unwrap();
        conn.publish("a/b", Bytes::from_static(b"x")).unwrap();
        match conn.publish("a/b", Bytes::from_static(b"x")) {
            Err(SubstrateError::QueueFull { pending }) => assert_eq!(pending, 2),
            other => panic!("expected QueueFull, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provisioning_is_exclusive() {
        let broker = MemoryBroker::new(8);
        let conn = broker.connect("test").await.unwrap();
        let spec = PartitionSpec {
            name: "p".to_string(),
            subjects: "p/#".to_string(),
            max_age: Duration::from_secs(10),
            replicas: 1,
        };

        conn.provision_partition(&spec).unwrap();
        assert!(matches!(
            conn.provision_partition(&spec),
            Err(SubstrateError::AlreadyExists(_))
        ));

        conn.update_partition_retention("p", Duration::from_secs(5))
            .unwrap();
        let info = conn.partition_info("p").unwrap().unwrap();
        assert_eq!(info.max_age, Duration::from_secs(5));

        assert!(matches!(
            conn.update_partition_retention("missing", Duration::from_secs(5)),
            Err(SubstrateError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partition_retention_expires_messages() {
        let broker = MemoryBroker::new(8);
        let conn = broker.connect("test").await.unwrap();
        conn.provision_partition(&PartitionSpec {
            name: "p".to_string(),
            subjects: "p/#".to_string(),
            max_age: Duration::from_secs(10),
            replicas: 1,
        })
        .unwrap();

        conn.publish("p/room0/message1", Bytes::from_static(b"x"))
            .unwrap();
        conn.publish("q/room0/message1", Bytes::from_static(b"x"))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.retained("p"), Some(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.retained("p"), Some(0));
        assert_eq!(broker.retained("q"), None);
    }
}
