use crate::assignment::Assignment;
use crate::config::Config;
use crate::error::LoadError;
use crate::launcher::{LaunchSummary, Launcher};
use crate::pool::{client_id, ConnectionPool};
use crate::stats::{self, RunReport};
use crate::substrate::Connector;
use crate::topology::{provision_partitions, room_topic_prefix};
use crate::worker::{Consumer, Producer};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;

/// A fully wired load test: provisioned partitions, open connections and
/// the worker population, ready to start.
pub struct LoadTest {
    pool: ConnectionPool,
    producers: Vec<Arc<Producer>>,
    consumers: Vec<Arc<Consumer>>,
    launcher: Launcher,
    started_at: Option<Instant>,
}

impl LoadTest {
    /// Connects, provisions partitions and builds every worker.
    ///
    /// Any failure here aborts before a single worker has started.
    pub async fn setup<C: Connector>(config: &Config, connector: &C) -> Result<Self, LoadError> {
        config.validate()?;

        let setup_conn = connector
            .connect(&client_id(&config.mqtt.client_id_prefix, "setup"))
            .await
            .map_err(|source| LoadError::Connection {
                role: "setup",
                index: 0,
                source,
            })?;

        provision_partitions(setup_conn.as_ref(), config)?;

        let assignment = Assignment::compute(config);
        let pool = ConnectionPool::open(
            connector,
            setup_conn,
            &assignment,
            &config.mqtt.client_id_prefix,
        )
        .await?;

        let mut producers = Vec::with_capacity(assignment.total_producers());
        let mut consumers = Vec::with_capacity(assignment.total_consumers());

        for room in 0..config.num_rooms {
            let prefix = room_topic_prefix(room, config.num_shards);

            for index in 0..config.consumers_per_room {
                let conn = pool.consumer(assignment.consumer_slot(room, index));
                consumers.push(Arc::new(Consumer::new(room, index, conn, &prefix)));
            }

            let conn = pool.producer(assignment.producer_slot(room));
            for index in 0..config.producers_per_room {
                producers.push(Arc::new(Producer::new(
                    room,
                    index,
                    Arc::clone(&conn),
                    prefix.clone(),
                    config.message_rate,
                    config.payload_size,
                )));
            }
        }

        info!(
            "Prepared {} rooms: {} producers, {} consumers, {} pooled connections",
            config.num_rooms,
            producers.len(),
            consumers.len(),
            pool.len()
        );

        Ok(Self {
            pool,
            producers,
            consumers,
            launcher: Launcher::new(config.launch_concurrency),
            started_at: None,
        })
    }

    pub fn producers(&self) -> &[Arc<Producer>] {
        &self.producers
    }

    pub fn consumers(&self) -> &[Arc<Consumer>] {
        &self.consumers
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Starts all consumers, then all producers, so rooms already have
    /// listeners when the first messages go out.
    pub async fn start(&mut self) -> LaunchSummary {
        info!("Starting consumers");
        let consumer_summary = self
            .launcher
            .run(
                "could not start consumer",
                self.consumers.iter().map(|consumer| {
                    let consumer = Arc::clone(consumer);
                    move || async move { consumer.start() }
                }),
            )
            .await;

        info!("Starting producers");
        let producer_summary = self
            .launcher
            .run(
                "could not start producer",
                self.producers.iter().map(|producer| {
                    let producer = Arc::clone(producer);
                    move || async move {
                        producer.start();
                        Ok::<(), LoadError>(())
                    }
                }),
            )
            .await;

        self.started_at = Some(Instant::now());
        info!(
            "Started tests (producers {}, consumers {}, failed consumers {})",
            self.producers.len(),
            self.consumers.len(),
            consumer_summary.failed
        );

        LaunchSummary {
            attempted: consumer_summary.attempted + producer_summary.attempted,
            failed: consumer_summary.failed + producer_summary.failed,
        }
    }

    /// Stops every worker concurrently, then reads their frozen counters.
    pub async fn stop(&mut self) -> RunReport {
        info!("Stopping...");
        let producers = self.producers.iter().map(|producer| {
            let producer = Arc::clone(producer);
            Box::new(move || {
                Box::pin(async move {
                    producer.stop().await;
                    Ok::<(), LoadError>(())
                }) as StopFuture
            }) as StopAction
        });
        let consumers = self.consumers.iter().map(|consumer| {
            let consumer = Arc::clone(consumer);
            Box::new(move || {
                Box::pin(async move {
                    consumer.stop();
                    Ok::<(), LoadError>(())
                }) as StopFuture
            }) as StopAction
        });
        self.launcher
            .run("could not stop worker", producers.chain(consumers))
            .await;

        let duration = self
            .started_at
            .take()
            .map(|at| at.elapsed())
            .unwrap_or_default();

        stats::aggregate(
            self.producers.iter().map(|p| p.sample()),
            self.consumers.iter().map(|c| c.sample()),
            duration,
        )
    }

    /// Starts the population, waits for `shutdown`, then stops and reports.
    pub async fn run<S>(mut self, shutdown: S) -> RunReport
    where
        S: Future<Output = ()>,
    {
        self.start().await;
        shutdown.await;
        self.stop().await
    }
}

type StopFuture = std::pin::Pin<Box<dyn Future<Output = Result<(), LoadError>> + Send>>;
type StopAction = Box<dyn FnOnce() -> StopFuture + Send>;
