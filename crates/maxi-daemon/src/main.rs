mod artwork;
mod backend;
mod core;
mod http;
mod mpv;
mod sinks;
mod socket;
mod station;
mod transport;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use maxi_proto::config::Config;
use maxi_proto::protocol::Track;
use maxi_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::artwork::RetryPolicy;
use crate::backend::{Backend, HttpBackend};
use crate::core::{CoreConfig, PlayerCore, PlayerEvent};
use crate::mpv::MpvTransport;
use crate::sinks::{ArtworkStore, BroadcastShareSink, StateSink};

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    TrackChanged(Track),
    /// URL of the artwork now attached to the current track.
    ArtworkUpdated(String),
    Share(String),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR reach clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = maxi_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,maxi_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let station = config.station.fallback.clone();
    let state_manager = Arc::new(StateManager::new(
        config.daemon.state_file.clone(),
        station.clone(),
        config.player.default_volume,
    ));
    let initial_volume = state_manager.get_state().await.volume;

    // Event channel: every external input funnels into PlayerCore
    let (event_tx, event_rx) = mpsc::channel::<PlayerEvent>(256);

    let backend: Arc<dyn Backend> = Arc::new(HttpBackend::new(config.backend.clone())?);
    let transport = MpvTransport::new(
        initial_volume,
        Duration::from_secs(config.player.connect_timeout_secs),
    );
    let artwork_store: ArtworkStore = Arc::new(RwLock::new(None));
    let now_playing = Arc::new(StateSink::new(
        Arc::clone(&state_manager),
        broadcast_tx.clone(),
        Arc::clone(&artwork_store),
    ));
    let share_sink = Arc::new(BroadcastShareSink::new(broadcast_tx.clone()));

    let mut player = PlayerCore::new(
        CoreConfig {
            autoplay: config.daemon.autoplay,
            initial_volume,
            app_name: config.share.app_name.clone(),
            retry: RetryPolicy::from(&config.artwork),
            station,
        },
        Box::new(transport),
        backend,
        now_playing,
        share_sink,
        event_tx.clone(),
    );
    player.fetch_station();

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        maxi_proto::platform::DAEMON_TCP_PORT,
        Arc::clone(&state_manager),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                state_manager: Arc::clone(&state_manager),
                event_tx: event_tx.clone(),
                artwork: artwork_store,
            },
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for ctrl-c: {}", e);
            return;
        }
        info!("Interrupted, shutting down");
        let _ = shutdown_tx.send(PlayerEvent::Shutdown).await;
    });

    info!("Daemon initialised, running event loop");
    player.run(event_rx).await;

    Ok(())
}
