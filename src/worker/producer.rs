use super::{FailureStreak, WorkerSample};
use crate::counter::Throughput;
use crate::substrate::Connection;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sub-topics a producer spreads its messages over
pub const TOPIC_KEYSPACE: u32 = 10_000;

const TICK: Duration = Duration::from_secs(1);

/// Publishes `message_rate` messages per second under a room's prefix.
///
/// Stop latency is bounded by the one-second tick only while a batch is
/// being sent; an idle producer reacts to `stop` immediately.
pub struct Producer {
    id: String,
    room: usize,
    connection: Arc<dyn Connection>,
    topic_prefix: String,
    message_rate: u32,
    payload: Bytes,
    sent: Throughput,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    pub fn new(
        room: usize,
        index: usize,
        connection: Arc<dyn Connection>,
        topic_prefix: String,
        message_rate: u32,
        payload_size: usize,
    ) -> Self {
        Self {
            id: format!("p-{}-{}", room, index),
            room,
            connection,
            topic_prefix,
            message_rate,
            payload: Bytes::from(vec![0u8; payload_size]),
            sent: Throughput::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room(&self) -> usize {
        self.room
    }

    /// Spawns the publish loop. Call at most once.
    pub fn start(self: &Arc<Self>) {
        let producer = Arc::clone(self);
        let handle = tokio::spawn(async move { producer.run().await });
        *self.task.lock() = Some(handle);
    }

    /// Signals the publish loop and waits for it to exit, so counters are
    /// final once this returns. Later calls do nothing.
    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        self.cancel.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Producer {} exited abnormally: {}", self.id, e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn message_count(&self) -> u64 {
        self.sent.messages()
    }

    pub fn bytes_count(&self) -> u64 {
        self.sent.bytes()
    }

    pub fn sample(&self) -> WorkerSample {
        WorkerSample {
            room: self.room,
            messages: self.message_count(),
            bytes: self.bytes_count(),
        }
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut streak = FailureStreak::default();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.publish_batch(&mut streak),
            }
        }
        debug!("Producer {} stopped after {} messages", self.id, self.message_count());
    }

    /// Sends one tick's worth of messages, giving up on the first failure
    fn publish_batch(&self, streak: &mut FailureStreak) {
        let mut rng = rand::thread_rng();
        for _ in 0..self.message_rate {
            let topic = format!(
                "{}/message{}",
                self.topic_prefix,
                rng.gen_range(0..TOPIC_KEYSPACE)
            );
            match self.connection.publish(&topic, self.payload.clone()) {
                Ok(()) => {
                    if streak.record_success() {
                        info!("Producer {} recovered from publish failure", self.id);
                    }
                    self.sent.record(self.payload.len());
                }
                Err(e) => {
                    if streak.record_failure() {
                        warn!(
                            "Producer {} failed to publish to '{}' ({} pending): {}",
                            self.id,
                            topic,
                            self.connection.pending(),
                            e
                        );
                    }
                    break;
                }
            }
        }
    }
}
