use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use netpulse_pinger::api::{self, AppState};
use netpulse_pinger::channel::BroadcastChannel;
use netpulse_pinger::config::PingerConfig;
use netpulse_pinger::dispatcher::Dispatcher;
use netpulse_pinger::notify::{ChannelSink, FanoutSink, NotificationSink, WebhookSink};
use netpulse_pinger::prober::IcmpProberFactory;
use netpulse_pinger::registry::Registry;
use netpulse_pinger::stats::ProcessStats;
use netpulse_pinger::utils::expand_targets;
use netpulse_pinger::worker::WorkerFailure;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .with_ansi(true)
        .init();

    let config = PingerConfig::load().context("Failed to load configuration")?;
    info!(
        targets = config.targets.len(),
        offline_after_secs = config.offline_after_secs,
        "Configuration loaded"
    );

    let channel = Arc::new(BroadcastChannel::new());
    let stats = Arc::new(ProcessStats::new());
    let factory = IcmpProberFactory::new(config.probe_settings());
    if !factory.has_sockets() {
        error!("No ICMP socket could be opened (raw socket privileges required), every target will be invalid");
    }

    let (failures_tx, mut failures_rx) = mpsc::unbounded_channel::<WorkerFailure>();
    tokio::spawn(async move {
        while let Some(failure) = failures_rx.recv().await {
            error!("{}", failure);
        }
    });

    let registry = Arc::new(Registry::new(config.worker_settings(), Arc::new(factory), failures_tx));

    let mut sink = FanoutSink::new().with(Arc::new(ChannelSink::new(
        channel.clone(),
        config.topic_base.clone(),
        stats.clone(),
    )));
    if let Some(url) = &config.webhook_url {
        info!("Transition webhook enabled");
        sink = sink.with(Arc::new(WebhookSink::new(url.clone())));
    }
    let sink: Arc<dyn NotificationSink> = Arc::new(sink);

    for target in expand_targets(&config.targets) {
        if let Err(e) = registry.create(&target, sink.clone()).await {
            warn!("Skipping target: {}", e);
        }
    }
    info!("Monitoring {} targets", registry.len().await);

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        channel.clone(),
        sink,
        stats,
        config.topic_base.clone(),
    ));
    let state = AppState {
        dispatcher,
        channel: channel.clone(),
    };
    let api_port = config.api_port;
    let server = tokio::spawn(async move {
        if let Err(e) = api::start_server(api_port, state).await {
            error!("Control channel server failed: {:#}", e);
        }
    });

    shutdown_signal().await?;
    info!("Shutdown signal received, stopping {} workers...", registry.len().await);

    registry.stop_all().await;
    registry.wait().await;
    channel.close();
    if let Err(e) = server.await {
        warn!("Control channel server task ended abnormally: {}", e);
    }

    info!("All workers stopped, bye");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    }
    Ok(())
}
