mod config;
mod core;
mod db;
mod logging;
mod notifications;
mod rpc;
mod shutdown;
mod status;
mod stream;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, OnCorrupt, PersistenceConfig};
use crate::core::detector::SharedDetector;
use crate::core::liveness::{LivenessWatchdog, StaleGuard};
use crate::core::maintenance::{prune_and_save, run_liveness_timer, run_maintenance};
use crate::core::pipeline::Pipeline;
use crate::core::policy::ThresholdPolicy;
use crate::core::window::Sample;
use crate::db::SnapshotStore;
use crate::notifications::desktop::DesktopChannel;
use crate::notifications::email::EmailChannel;
use crate::notifications::message::MessageComposer;
use crate::notifications::price::PriceFeed;
use crate::notifications::pushover::PushoverClient;
use crate::notifications::telegram::TelegramClient;
use crate::notifications::{AlertChannel, AlertDispatcher, LogPublisher, MessageNotifier, Publisher};
use crate::rpc::NodeRpc;
use crate::rpc::zmq_sub::ZmqBlockSource;
use crate::shutdown::Shutdown;
use crate::status::StatusState;
use crate::stream::StreamSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Config::resolve_path(std::env::args().nth(1));
    let config =
        Config::load(&config_path).with_context(|| format!("loading config from {}", config_path.display()))?;
    logging::init(&config.log).context("invalid log.level")?;

    info!("🐳 {} starting...", config.app.name);
    if config_path.exists() {
        info!("Config loaded from {}", config_path.display());
    } else {
        info!("Config file {} not found, using defaults", config_path.display());
    }

    // Window snapshot
    let (store, samples) = open_snapshot(&config.persistence)?;
    let detector = SharedDetector::new(
        ThresholdPolicy::new(config.threshold_config()),
        LivenessWatchdog::new(config.liveness_config()),
        samples,
    );
    let expired = detector.prune(Utc::now());
    info!(samples = detector.count(), expired, "Window restored");

    // Collaborators
    let request_timeout = std::time::Duration::from_secs(config.node.request_timeout_secs);
    let http = Client::builder()
        .timeout(request_timeout)
        .build()
        .context("building HTTP client")?;
    let rpc = Arc::new(
        NodeRpc::new(
            &config.node.rpc_host,
            config.node.rpc_port,
            config.node.rpc_user.as_deref().unwrap_or_default(),
            config.node.rpc_password.as_deref().unwrap_or_default(),
            request_timeout,
        )
        .context("building node RPC client")?,
    );
    info!(url = %rpc.url(), "Node RPC client configured");
    let source = Arc::new(ZmqBlockSource::new(config.node.zmq_hashblock.clone(), rpc));

    let notifier = Arc::new(build_notifier(&config, &http)?);
    let alerts = Arc::new(build_alerts(&config, &http)?);
    info!(channels = ?alerts.channel_names(), "Alert channels configured");

    let guard = StaleGuard::new(detector.clone(), alerts);
    let pipeline = Arc::new(Pipeline::new(detector.clone(), notifier, guard.clone()));
    let pipeline_stats = pipeline.stats();

    let status_listener = status::bind(&config.status)
        .await
        .with_context(|| format!("binding status server to {}", config.status.listen))?;

    // Tasks
    let shutdown = Shutdown::new();
    let supervisor = Arc::new(StreamSupervisor::new(
        source,
        pipeline,
        config.stream_config(),
        shutdown.clone(),
    ));
    let stream_state = supervisor.subscribe();

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    handles.push(tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run().await }
    }));
    info!("Stream supervisor started");

    handles.push(tokio::spawn(run_maintenance(
        detector.clone(),
        store.clone(),
        config.threshold_config().prune_interval,
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(run_liveness_timer(
        guard,
        config.liveness_config().check_interval,
        shutdown.clone(),
    )));
    info!("Maintenance and liveness tasks started");

    if let Some(listener) = status_listener {
        let state = StatusState::new(detector.clone(), pipeline_stats, stream_state);
        let path = config.status.path.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = status::serve(listener, &path, state, shutdown).await {
                error!("Status server error: {e}");
            }
        }));
    }

    if let Err(e) = shutdown::wait_for_signal().await {
        error!("Failed to install signal handlers, shutting down: {e}");
    }

    info!("Initiating graceful shutdown...");
    shutdown.trigger();

    let joined = tokio::time::timeout(config.shutdown_timeout(), async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Task ended abnormally: {e}");
            }
        }
    })
    .await;
    match joined {
        Ok(()) => info!("All tasks completed"),
        Err(_) => warn!("Shutdown timeout exceeded, forcing exit"),
    }

    match prune_and_save(&detector, &store).await {
        Ok(saved) => info!(samples = saved, path = %store.path().display(), "Final window snapshot saved"),
        Err(e) => error!(path = %store.path().display(), "Final window snapshot failed: {e}"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Open the snapshot store and load the saved window, applying the
/// configured policy when it cannot be read.
fn open_snapshot(config: &PersistenceConfig) -> anyhow::Result<(SnapshotStore, Vec<Sample>)> {
    let path = &config.path;
    let loaded = SnapshotStore::open(path).and_then(|store| {
        let samples = store.load()?;
        Ok((store, samples))
    });

    match loaded {
        Ok((store, samples)) => {
            match store.info() {
                Ok(Some(meta)) => info!(
                    path = %path.display(),
                    samples = samples.len(),
                    saved_at = %meta.saved_at,
                    "Window snapshot loaded"
                ),
                _ => info!(path = %path.display(), "No window snapshot yet, starting empty"),
            }
            Ok((store, samples))
        }
        Err(e) if config.on_corrupt == OnCorrupt::StartEmpty => {
            error!(path = %path.display(), "Window snapshot unreadable, starting empty: {e}");
            let moved = SnapshotStore::quarantine(path).context("moving unreadable snapshot aside")?;
            warn!(to = %moved.display(), "Unreadable snapshot preserved");
            let store = SnapshotStore::open(path).context("creating fresh snapshot store")?;
            Ok((store, Vec::new()))
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("loading window snapshot from {}", path.display()))),
    }
}

fn build_notifier(config: &Config, http: &Client) -> anyhow::Result<MessageNotifier> {
    let m = &config.message;
    let price = m.price_api_url.as_ref().map(|url| PriceFeed::new(http.clone(), url.clone()));
    if price.is_none() {
        info!("No price API configured, fiat amounts will show as '?'");
    }
    let composer = MessageComposer::new(
        m.template.clone(),
        m.symbol.clone(),
        m.block_explorer.clone(),
        m.fiat_currency.clone(),
        price,
    );

    let mut publishers: Vec<Box<dyn Publisher>> = Vec::new();
    if config.publish.dry_run {
        info!("Dry run: messages are logged, not published");
        publishers.push(Box::new(LogPublisher));
    } else if let Some(tg) = &config.publish.telegram {
        publishers.push(Box::new(
            TelegramClient::new(http.clone(), tg).context("configuring Telegram publisher")?,
        ));
        info!(channel = %tg.channel, "Publishing to Telegram");
    }
    Ok(MessageNotifier::new(composer, publishers))
}

fn build_alerts(config: &Config, http: &Client) -> anyhow::Result<AlertDispatcher> {
    let a = &config.alerts;
    let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
    if let Some(tg) = &a.telegram {
        channels.push(Box::new(
            TelegramClient::new(http.clone(), tg).context("configuring Telegram alerts")?,
        ));
    }
    if let Some(po) = &a.pushover {
        channels.push(Box::new(
            PushoverClient::new(http.clone(), po).context("configuring Pushover alerts")?,
        ));
    }
    if let Some(email) = &a.email {
        channels.push(Box::new(EmailChannel::new(email).context("configuring email alerts")?));
    }
    if a.desktop {
        channels.push(Box::new(DesktopChannel::new(std::time::Duration::from_secs(
            a.desktop_cooldown_secs,
        ))));
    }
    Ok(AlertDispatcher::new(config.app.name.clone(), channels))
}
