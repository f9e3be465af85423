use anyhow::Result;
use mqtt_room_load::{
    config::{Backend, Config},
    logging, Connector, LoadTest, MemoryBroker, MqttConnector, RunReport,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::init(&config.logging);

    info!("Starting room load test");
    info!("Configuration loaded: {:?}", config);

    let report = match config.backend {
        Backend::Mqtt => {
            let connector = MqttConnector::new(config.mqtt.clone(), config.payload_size);
            run(&config, connector).await?
        }
        Backend::Memory => run(&config, MemoryBroker::new(config.mqtt.max_pending)).await?,
    };

    report.log();
    if let Some(path) = &config.report_path {
        report.write_json(path)?;
    }
    Ok(())
}

async fn run<C: Connector>(config: &Config, connector: C) -> Result<RunReport> {
    let test = LoadTest::setup(config, &connector).await?;
    Ok(test.run(shutdown_signal()).await)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut term), Ok(mut quit)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) else {
        tracing::warn!("Could not install SIGTERM/SIGQUIT handlers, waiting for Ctrl+C only");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = term.recv() => info!("Received SIGTERM"),
        _ = quit.recv() => info!("Received SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}
