use super::WorkerSample;
use crate::counter::Throughput;
use crate::error::LoadError;
use crate::substrate::{Connection, MessageHandler, SubscriptionId};
use crate::topology::wildcard_filter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Subscribes to everything under a room's prefix and counts deliveries
pub struct Consumer {
    room: usize,
    index: usize,
    connection: Arc<dyn Connection>,
    filter: String,
    received: Arc<Throughput>,
    subscription: Mutex<Option<SubscriptionId>>,
    stopped: AtomicBool,
}

impl Consumer {
    pub fn new(room: usize, index: usize, connection: Arc<dyn Connection>, topic_prefix: &str) -> Self {
        Self {
            room,
            index,
            connection,
            filter: wildcard_filter(topic_prefix),
            received: Arc::new(Throughput::new()),
            subscription: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> String {
        format!("c-{}-{}", self.room, self.index)
    }

    pub fn room(&self) -> usize {
        self.room
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Subscribes unless already subscribed. A stopped consumer cannot be
    /// started again.
    pub fn start(&self) -> Result<(), LoadError> {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return Ok(());
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(LoadError::WorkerStopped(self.id()));
        }

        let received = Arc::clone(&self.received);
        let handler: MessageHandler = Arc::new(move |_topic, payload| {
            received.record(payload.len());
        });

        let id = self
            .connection
            .subscribe(&self.filter, handler)
            .map_err(|source| LoadError::WorkerStart {
                id: self.id(),
                source,
            })?;
        *subscription = Some(id);
        Ok(())
    }

    /// Drops the subscription if there is one. Unsubscribe errors are only
    /// logged.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let Some(id) = self.subscription.lock().take() else {
            return;
        };
        if let Err(e) = self.connection.unsubscribe(id) {
            warn!("Consumer {} failed to unsubscribe: {}", self.id(), e);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.lock().is_some()
    }

    pub fn message_count(&self) -> u64 {
        self.received.messages()
    }

    pub fn bytes_count(&self) -> u64 {
        self.received.bytes()
    }

    pub fn sample(&self) -> WorkerSample {
        WorkerSample {
            room: self.room,
            messages: self.message_count(),
            bytes: self.bytes_count(),
        }
    }
}
