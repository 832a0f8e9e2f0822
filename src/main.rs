use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use evse_load_guard::config::DEFAULT_CONFIG_PATH;
use evse_load_guard::mqtt::MqttBridge;
use evse_load_guard::{Config, Events, LoadBalancer, ProxyServer, Upstream};

#[derive(Parser)]
#[command(about, version)]
struct Cli {
    #[arg(
        long,
        env = "EVSE_GUARD_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path of the JSON configuration file"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config = Config::load(&cli.config);
    if !config.enabled {
        info!(
            "load balancer not enabled in {}, exiting",
            cli.config.display()
        );
        return Ok(());
    }
    config.validate()?;

    let charger_addr = config.charger_addr().await?;
    let listen_addr = config.listen_addr().await?;

    let upstream = Upstream::connect(charger_addr, config.charger_unit_id, config.request_timeout())
        .await
        .context("charger unreachable at start-up")?;

    let events = Events::new();
    let (balancer, handle) = LoadBalancer::new(
        config.controller_settings(),
        config.total_power_timeout(),
        upstream.clone(),
        events.clone(),
    );
    tokio::spawn(balancer.run());

    if let Some(mqtt) = config.mqtt.clone() {
        let bridge = MqttBridge::new(mqtt);
        let handle = handle.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.run(handle, events).await {
                error!("MQTT bridge stopped: {:?}", e);
            }
        });
    }

    let proxy = ProxyServer::new(upstream, handle);
    tokio::select! {
        result = proxy.listen(listen_addr) => result.context("proxy server failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
