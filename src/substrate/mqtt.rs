use super::{
    topic_matches, Connection, Connector, MessageHandler, PartitionInfo, PartitionSpec,
    SubscriptionId, SubstrateError,
};
use crate::config::{MqttConfig, MQTT_MAX_PACKET_SIZE, TOPIC_HEADROOM};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    TlsConfiguration, Transport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// rumqttc's packet size limit when none is set
const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024;

/// Packet limit that fits a publish of `payload_size` bytes plus its topic
pub fn packet_limit(payload_size: usize) -> usize {
    payload_size
        .saturating_add(TOPIC_HEADROOM)
        .clamp(DEFAULT_MAX_PACKET_SIZE, MQTT_MAX_PACKET_SIZE)
}

/// Partition registry shared by every connection of one connector.
///
/// MQTT brokers create topics on first use and have no stream objects, so
/// partitions only exist inside this process: retention and replicas are
/// recorded but never reach the broker, and another process never sees them.
#[derive(Default)]
struct PartitionRegistry {
    partitions: Mutex<HashMap<String, PartitionInfo>>,
    warned: AtomicBool,
}

impl PartitionRegistry {
    fn warn_not_enforced(&self, spec_max_age: Duration, replicas: usize) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                "MQTT has no server-side partitions: retention ({:?}) and replicas ({}) \
                 are tracked by this process only and are not enforced by the broker",
                spec_max_age, replicas
            );
        }
    }
}

/// TLS certificate verifier that accepts any certificate (for insecure_skip_verify)
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Opens rumqttc connections to a single broker
pub struct MqttConnector {
    config: MqttConfig,
    max_packet_size: usize,
    partitions: Arc<PartitionRegistry>,
}

impl MqttConnector {
    /// `payload_size` sizes the client's packet limit so publishes of that
    /// size pass in both directions.
    pub fn new(config: MqttConfig, payload_size: usize) -> Self {
        Self {
            config,
            max_packet_size: packet_limit(payload_size),
            partitions: Arc::new(PartitionRegistry::default()),
        }
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(client_id, &self.config.address, self.config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        mqtt_options.set_clean_session(true);
        mqtt_options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            mqtt_options.set_credentials(username, password);
        }

        if self.config.use_tls {
            if self.config.insecure_skip_verify {
                let tls_config = rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                    .with_no_client_auth();
                mqtt_options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                    Arc::new(tls_config),
                )));
            } else {
                mqtt_options.set_transport(Transport::tls_with_default_config());
            }
        }

        mqtt_options
    }
}

impl Connector for MqttConnector {
    async fn connect(&self, client_id: &str) -> Result<Arc<dyn Connection>, SubstrateError> {
        let (client, eventloop) =
            AsyncClient::new(self.options(client_id), self.config.max_pending.max(1));

        let shared = Arc::new(Shared {
            client_id: client_id.to_string(),
            client: client.clone(),
            qos: qos_from_level(self.config.qos),
            routes: RwLock::new(Routes::default()),
            connected: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(drive(
            Arc::clone(&shared),
            eventloop,
            ready_tx,
            shutdown_rx,
            Duration::from_millis(self.config.reconnect_delay_ms),
        ));

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                let _ = shutdown_tx.send(true);
                return Err(e);
            }
            Ok(Err(_)) => {
                return Err(SubstrateError::Connect(format!(
                    "eventloop for '{}' exited before connecting",
                    client_id
                )))
            }
            Err(_) => {
                let _ = shutdown_tx.send(true);
                return Err(SubstrateError::Timeout(timeout));
            }
        }

        Ok(Arc::new(MqttConnection {
            shared,
            partitions: Arc::clone(&self.partitions),
            shutdown_tx,
        }))
    }
}

#[derive(Default)]
struct Routes {
    next_id: u64,
    handlers: HashMap<SubscriptionId, Route>,
}

struct Route {
    filter: String,
    handler: MessageHandler,
}

impl Routes {
    fn has_filter(&self, filter: &str) -> bool {
        self.handlers.values().any(|r| r.filter == filter)
    }

    fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.handlers.values().map(|r| r.filter.clone()).collect();
        filters.sort();
        filters.dedup();
        filters
    }
}

/// State shared between a connection handle and its eventloop task
struct Shared {
    client_id: String,
    client: AsyncClient,
    qos: QoS,
    routes: RwLock<Routes>,
    connected: AtomicBool,
    pending: AtomicUsize,
}

impl Shared {
    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let routes = self.routes.read();
        for route in routes.handlers.values() {
            if topic_matches(&route.filter, topic) {
                (route.handler)(topic, payload);
            }
        }
    }

    fn resubscribe(&self) {
        let filters = self.routes.read().filters();
        for filter in &filters {
            if let Err(e) = self.client.try_subscribe(filter.as_str(), self.qos) {
                warn!(
                    "Failed to re-subscribe to '{}' on '{}': {}",
                    filter, self.client_id, e
                );
            }
        }
        if !filters.is_empty() {
            info!(
                "Re-subscribed to {} filters on '{}' after reconnection",
                filters.len(),
                self.client_id
            );
        }
    }
}

/// Polls the rumqttc eventloop until shutdown, routing incoming publishes
/// to subscription handlers. Lifecycle events are only logged.
async fn drive(
    shared: Arc<Shared>,
    mut eventloop: EventLoop,
    ready_tx: oneshot::Sender<Result<(), SubstrateError>>,
    mut shutdown_rx: watch::Receiver<bool>,
    reconnect_delay: Duration,
) {
    let mut ready_tx = Some(ready_tx);
    let mut reconnects: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!("Shutting down connection '{}'", shared.client_id);
                let _ = shared.client.try_disconnect();
                break;
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        shared.connected.store(true, Ordering::Relaxed);
                        if let Some(tx) = ready_tx.take() {
                            debug!("Connection '{}' established", shared.client_id);
                            let _ = tx.send(Ok(()));
                        } else {
                            reconnects += 1;
                            info!("Connection '{}' reconnected ({} reconnects)", shared.client_id, reconnects);
                            shared.resubscribe();
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        shared.dispatch(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                        let _ = shared.pending.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                            Some(n.saturating_sub(1))
                        });
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        shared.connected.store(false, Ordering::Relaxed);
                        warn!("Broker disconnected '{}'", shared.client_id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(SubstrateError::Connect(e.to_string())));
                            break;
                        }
                        if shared.connected.swap(false, Ordering::Relaxed) {
                            error!("Connection '{}' lost: {}", shared.client_id, e);
                        } else {
                            debug!("Connection '{}' still down: {}", shared.client_id, e);
                        }
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }
    }
}

struct MqttConnection {
    shared: Arc<Shared>,
    partitions: Arc<PartitionRegistry>,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn client_error(e: ClientError, pending: usize) -> SubstrateError {
    match e {
        ClientError::TryRequest(_) => SubstrateError::QueueFull { pending },
        other => SubstrateError::Client(other.to_string()),
    }
}

impl Connection for MqttConnection {
    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SubstrateError> {
        self.shared
            .client
            .try_publish(topic, self.shared.qos, false, payload.to_vec())
            .map_err(|e| client_error(e, self.pending()))?;
        self.shared.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    fn subscribe(
        &self,
        filter: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, SubstrateError> {
        let mut routes = self.shared.routes.write();

        // The broker delivers once per connection; local routes fan it out
        if !routes.has_filter(filter) {
            self.shared
                .client
                .try_subscribe(filter, self.shared.qos)
                .map_err(|e| client_error(e, self.pending()))?;
        }

        routes.next_id += 1;
        let id = SubscriptionId(routes.next_id);
        routes.handlers.insert(
            id,
            Route {
                filter: filter.to_string(),
                handler,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubstrateError> {
        let mut routes = self.shared.routes.write();
        let route = routes
            .handlers
            .remove(&id)
            .ok_or_else(|| SubstrateError::Client(format!("unknown subscription {}", id.0)))?;

        if !routes.has_filter(&route.filter) {
            self.shared
                .client
                .try_unsubscribe(route.filter.as_str())
                .map_err(|e| client_error(e, self.pending()))?;
        }
        Ok(())
    }

    fn partition_info(&self, name: &str) -> Result<Option<PartitionInfo>, SubstrateError> {
        Ok(self.partitions.partitions.lock().get(name).cloned())
    }

    fn provision_partition(&self, spec: &PartitionSpec) -> Result<(), SubstrateError> {
        let mut partitions = self.partitions.partitions.lock();
        if partitions.contains_key(&spec.name) {
            return Err(SubstrateError::AlreadyExists(spec.name.clone()));
        }
        partitions.insert(spec.name.clone(), PartitionInfo::from(spec));
        self.partitions.warn_not_enforced(spec.max_age, spec.replicas);
        Ok(())
    }

    fn update_partition_retention(
        &self,
        name: &str,
        max_age: Duration,
    ) -> Result<(), SubstrateError> {
        let mut partitions = self.partitions.partitions.lock();
        let info = partitions
            .get_mut(name)
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))?;
        info.max_age = max_age;
        self.partitions.warn_not_enforced(max_age, info.replicas);
        Ok(())
    }
}
