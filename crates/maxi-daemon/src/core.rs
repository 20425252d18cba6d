/// PlayerCore: single-owner event loop for the playback session.
///
/// Every input (client commands, transport reports, station and artwork
/// completions) arrives as a `PlayerEvent` on one channel.  PlayerCore owns
/// the transport exclusively and is the only writer of playback state; the
/// rest of the daemon learns about changes through the `NowPlayingSink`.
///
/// Each transport session gets a fresh id.  Transport events are tagged with
/// the id of the session that produced them, and anything tagged with an old
/// id is dropped, so a late report from a released stream can never move the
/// state machine.
use std::sync::Arc;

use maxi_proto::metadata::{extract_stream_title, parse_icy};
use maxi_proto::protocol::{
    Command, PlaybackState, StationDescriptor, Track, TrackKey, TransportStatus,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artwork::{Artwork, ArtworkController, RetryPolicy};
use crate::backend::Backend;
use crate::sinks::{NowPlayingSink, ShareItem, ShareSink};
use crate::station::spawn_station_fetch;
use crate::transport::{Transport, TransportEvent};

// ── PlayerEvent ───────────────────────────────────────────────────────────────

/// All inputs into the PlayerCore loop.
#[derive(Debug)]
pub enum PlayerEvent {
    /// A command from a socket client or the HTTP API.
    Command(Command),
    /// Status or metadata from the transport session `session`.
    Transport { session: u64, event: TransportEvent },
    /// Outcome of the startup station fetch; `None` keeps the default.
    StationLoaded(Option<StationDescriptor>),
    ArtworkReady {
        generation: u64,
        key: TrackKey,
        artwork: Artwork,
    },
    Shutdown,
}

// ── PlayerCore ────────────────────────────────────────────────────────────────

pub struct CoreConfig {
    pub autoplay: bool,
    pub initial_volume: f32,
    pub app_name: String,
    pub retry: RetryPolicy,
    pub station: StationDescriptor,
}

pub struct PlayerCore {
    transport: Box<dyn Transport>,
    backend: Arc<dyn Backend>,
    now_playing: Arc<dyn NowPlayingSink>,
    share_sink: Arc<dyn ShareSink>,
    events_tx: mpsc::Sender<PlayerEvent>,
    artwork: ArtworkController,
    autoplay: bool,
    app_name: String,
    station: StationDescriptor,
    playback: PlaybackState,
    track: Option<Track>,
    current_artwork: Option<Artwork>,
    volume: f32,
    /// Id of the open transport session; `None` once released.
    session: Option<u64>,
    last_session: u64,
    /// Moves transport events of the open session into our own channel.
    forwarder: Option<JoinHandle<()>>,
    station_fetch: Option<CancellationToken>,
}

impl PlayerCore {
    pub fn new(
        config: CoreConfig,
        transport: Box<dyn Transport>,
        backend: Arc<dyn Backend>,
        now_playing: Arc<dyn NowPlayingSink>,
        share_sink: Arc<dyn ShareSink>,
        events_tx: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        let artwork = ArtworkController::new(Arc::clone(&backend), config.retry, events_tx.clone());
        Self {
            transport,
            backend,
            now_playing,
            share_sink,
            events_tx,
            artwork,
            autoplay: config.autoplay,
            app_name: config.app_name,
            station: config.station,
            playback: PlaybackState::Idle,
            track: None,
            current_artwork: None,
            volume: config.initial_volume.clamp(0.0, 1.0),
            session: None,
            last_session: 0,
            forwarder: None,
            station_fetch: None,
        }
    }

    /// Kick off the one-shot station fetch.  The result comes back as
    /// `PlayerEvent::StationLoaded`.
    pub fn fetch_station(&mut self) {
        let cancel = CancellationToken::new();
        spawn_station_fetch(
            Arc::clone(&self.backend),
            self.events_tx.clone(),
            cancel.clone(),
        );
        if let Some(prev) = self.station_fetch.replace(cancel) {
            prev.cancel();
        }
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every sender is gone; the session is released and the transport
    /// shut down on the way out.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<PlayerEvent>) {
        info!("PlayerCore: starting event loop");
        while let Some(evt) = event_rx.recv().await {
            if matches!(evt, PlayerEvent::Shutdown) {
                info!("PlayerCore: shutdown requested");
                break;
            }
            self.handle_event(evt).await;
        }
        self.stop().await;
        self.transport.shutdown().await;
        info!("PlayerCore: stopped");
    }

    pub async fn handle_event(&mut self, evt: PlayerEvent) {
        match evt {
            PlayerEvent::Command(cmd) => {
                info!("PlayerCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            PlayerEvent::Transport { session, event } => {
                if self.session != Some(session) {
                    debug!(
                        "PlayerCore: dropping {:?} from stale session {}",
                        event, session
                    );
                    return;
                }
                self.handle_transport_event(event).await;
            }
            PlayerEvent::StationLoaded(result) => self.on_station_loaded(result).await,
            PlayerEvent::ArtworkReady {
                generation,
                key,
                artwork,
            } => self.on_artwork_ready(generation, key, artwork).await,
            PlayerEvent::Shutdown => {}
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Play => self.start().await,
            Command::Stop => self.stop().await,
            Command::TogglePlay => self.toggle().await,
            Command::Volume { value } => self.set_volume(value).await,
            Command::Share => self.share().await,
            // the state is already mirrored by the sink
            Command::GetState => {}
        }
    }

    // ── state machine ─────────────────────────────────────────────────────────

    /// Open a fresh session on the current station, replacing any open one.
    pub async fn start(&mut self) {
        self.release_session().await;

        self.last_session += 1;
        let session = self.last_session;
        info!(
            "PlayerCore: session {} opening {} ({})",
            session, self.station.name, self.station.stream_url
        );
        self.set_playback(PlaybackState::Loading).await;

        let (tx, mut rx) = mpsc::channel::<TransportEvent>(32);
        let core_tx = self.events_tx.clone();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if core_tx
                    .send(PlayerEvent::Transport { session, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }));
        self.session = Some(session);

        let url = self.station.stream_url.clone();
        if let Err(e) = self.transport.open(&url, self.volume, tx).await {
            warn!("PlayerCore: cannot open {}: {:#}", url, e);
            self.fail(format!("{:#}", e)).await;
        }
    }

    /// Stop playback.  No-op when nothing is open and the state is Idle.
    pub async fn stop(&mut self) {
        if let Some(fetch) = self.station_fetch.take() {
            fetch.cancel();
        }
        self.release_session().await;
        self.set_playback(PlaybackState::Idle).await;
    }

    pub async fn toggle(&mut self) {
        if self.playback.is_active() {
            self.stop().await;
        } else {
            self.start().await;
        }
    }

    async fn fail(&mut self, reason: String) {
        self.set_playback(PlaybackState::Failed(reason)).await;
        self.release_session().await;
    }

    /// Release the transport and forget the session.  The transport is left
    /// alone when no session is open.
    async fn release_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        debug!("PlayerCore: releasing session {}", session);
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.artwork.cancel();
        if let Err(e) = self.transport.release().await {
            warn!("PlayerCore: transport release failed: {:#}", e);
        }
    }

    async fn set_playback(&mut self, playback: PlaybackState) {
        if self.playback == playback {
            return;
        }
        info!(
            "PlayerCore: {} → {}",
            self.playback.label(),
            playback.label()
        );
        if let PlaybackState::Failed(reason) = &playback {
            warn!("PlayerCore: playback failed: {}", reason);
        }
        // each session starts without a track, so a restart looks the
        // current title up again
        if playback != PlaybackState::Playing {
            self.track = None;
            self.current_artwork = None;
        }
        self.playback = playback;
        self.now_playing.on_state(&self.playback).await;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(TransportStatus::ReadyToPlay) => {
                if self.playback == PlaybackState::Loading {
                    self.set_playback(PlaybackState::Playing).await;
                }
            }
            TransportEvent::Status(TransportStatus::Failed(reason)) => self.fail(reason).await,
            TransportEvent::Status(TransportStatus::Unknown) => {
                self.fail("stream status unknown".to_string()).await
            }
            TransportEvent::Metadata(raw) => self.on_metadata(&raw).await,
        }
    }

    // ── metadata & artwork ────────────────────────────────────────────────────

    async fn on_metadata(&mut self, raw: &str) {
        if self.playback != PlaybackState::Playing {
            debug!(
                "PlayerCore: ignoring metadata {:?} while {}",
                raw,
                self.playback.label()
            );
            return;
        }

        let parsed = parse_icy(&extract_stream_title(raw));
        let track = Track::resolve(&parsed, &self.station);
        if self.track.as_ref().map(Track::key) == Some(track.key()) {
            return;
        }

        info!("PlayerCore: now playing {} - {}", track.artist, track.title);
        self.current_artwork = None;
        self.now_playing.on_track(&track).await;
        self.track = Some(track);
        self.artwork.request(&parsed.artist, &parsed.title);
    }

    async fn on_artwork_ready(&mut self, generation: u64, key: TrackKey, artwork: Artwork) {
        if !self.artwork.accept(generation, &key) {
            debug!(
                "PlayerCore: discarding stale artwork for {:?} (generation {})",
                key, generation
            );
            return;
        }
        if let Some(track) = self.track.as_mut() {
            track.artwork_url = Some(artwork.url.clone());
        }
        self.now_playing.on_artwork(&key, &artwork).await;
        self.current_artwork = Some(artwork);
    }

    // ── station ───────────────────────────────────────────────────────────────

    async fn on_station_loaded(&mut self, result: Option<StationDescriptor>) {
        if self.station_fetch.take().is_none() {
            debug!("PlayerCore: station fetch was cancelled, ignoring result");
            return;
        }

        let Some(station) = result else {
            if self.autoplay && self.playback == PlaybackState::Idle {
                info!("PlayerCore: starting with default station");
                self.start().await;
            }
            return;
        };

        let url_changed = station.stream_url != self.station.stream_url;
        self.station = station;
        self.now_playing.on_station(&self.station).await;

        if !self.autoplay {
            return;
        }
        if !self.playback.is_active() {
            self.start().await;
        } else if url_changed {
            info!("PlayerCore: stream URL changed, restarting");
            self.start().await;
        }
    }

    // ── volume & share ────────────────────────────────────────────────────────

    async fn set_volume(&mut self, value: f32) {
        let volume = value.clamp(0.0, 1.0);
        self.volume = volume;
        if self.session.is_some() {
            if let Err(e) = self.transport.set_volume(volume).await {
                warn!("PlayerCore: set volume failed: {:#}", e);
            }
        }
        self.now_playing.on_volume(volume).await;
    }

    async fn share(&mut self) {
        let title = self
            .track
            .as_ref()
            .map(|t| t.title.as_str())
            .unwrap_or(self.station.short_desc.as_str());
        let item = ShareItem {
            message: share_message(title, &self.station.name, &self.app_name),
            artwork: self.current_artwork.clone(),
        };
        self.share_sink.share(&item).await;
    }
}

pub fn share_message(title: &str, station: &str, app: &str) -> String {
    format!("I'm listening to {} on {} via {}", title, station, app)
}
