//! Outbound collaborators of the player core.
//!
//! The core never touches presentation directly: it reports state, track,
//! artwork and station changes to a [`NowPlayingSink`] and hands share items
//! to a [`ShareSink`].  Both are only ever called from the core loop.

use std::sync::Arc;

use async_trait::async_trait;
use maxi_proto::protocol::{PlaybackState, StationDescriptor, Track, TrackKey};
use maxi_proto::state::StateManager;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::artwork::Artwork;
use crate::BroadcastMessage;

/// Latest displayed artwork, shared with the HTTP server.
pub type ArtworkStore = Arc<RwLock<Option<Artwork>>>;

#[async_trait]
pub trait NowPlayingSink: Send + Sync + 'static {
    async fn on_state(&self, state: &PlaybackState);
    async fn on_track(&self, track: &Track);
    async fn on_artwork(&self, key: &TrackKey, artwork: &Artwork);
    async fn on_station(&self, station: &StationDescriptor);
    async fn on_volume(&self, _volume: f32) {}
}

/// Text and image offered to the platform share facility.
#[derive(Debug, Clone)]
pub struct ShareItem {
    pub message: String,
    pub artwork: Option<Artwork>,
}

#[async_trait]
pub trait ShareSink: Send + Sync + 'static {
    async fn share(&self, item: &ShareItem);
}

// ── StateSink ─────────────────────────────────────────────────────────────────

/// Mirrors the core into the shared [`StateManager`] and tells connected
/// clients what changed.
pub struct StateSink {
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    artwork: ArtworkStore,
}

impl StateSink {
    pub fn new(
        state_manager: Arc<StateManager>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        artwork: ArtworkStore,
    ) -> Self {
        Self {
            state_manager,
            broadcast_tx,
            artwork,
        }
    }
}

#[async_trait]
impl NowPlayingSink for StateSink {
    async fn on_state(&self, state: &PlaybackState) {
        self.state_manager.set_playback(state.clone()).await;
        if *state != PlaybackState::Playing {
            *self.artwork.write().await = None;
        }
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn on_track(&self, track: &Track) {
        self.state_manager.set_track(track.clone()).await;
        *self.artwork.write().await = None;
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::TrackChanged(track.clone()));
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn on_artwork(&self, key: &TrackKey, artwork: &Artwork) {
        let (artist, title) = key;
        if !self
            .state_manager
            .set_artwork_url(artist, title, artwork.url.clone())
            .await
        {
            return;
        }
        *self.artwork.write().await = Some(artwork.clone());
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::ArtworkUpdated(artwork.url.clone()));
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn on_station(&self, station: &StationDescriptor) {
        self.state_manager.set_station(station.clone()).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn on_volume(&self, volume: f32) {
        if let Err(e) = self.state_manager.set_volume(volume).await {
            warn!("state: failed to persist volume: {}", e);
        }
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

// ── BroadcastShareSink ────────────────────────────────────────────────────────

/// Sends share messages to connected clients, which own the actual share UI.
pub struct BroadcastShareSink {
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastShareSink {
    pub fn new(broadcast_tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { broadcast_tx }
    }
}

#[async_trait]
impl ShareSink for BroadcastShareSink {
    async fn share(&self, item: &ShareItem) {
        info!(
            "share: {} (artwork: {})",
            item.message,
            item.artwork.as_ref().map(|a| a.url.as_str()).unwrap_or("none")
        );
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Share(item.message.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artwork::decode_artwork;
    use crate::testing::png_bytes;

    fn sink() -> (
        StateSink,
        Arc<StateManager>,
        ArtworkStore,
        broadcast::Receiver<BroadcastMessage>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let sm = Arc::new(StateManager::new(
            dir.path().join("state.json"),
            StationDescriptor::default(),
            0.5,
        ));
        let (tx, rx) = broadcast::channel(16);
        let store: ArtworkStore = Arc::new(RwLock::new(None));
        let sink = StateSink::new(Arc::clone(&sm), tx, Arc::clone(&store));
        (sink, sm, store, rx, dir)
    }

    #[tokio::test]
    async fn test_artwork_for_old_track_is_not_stored() {
        let (sink, sm, store, _rx, _dir) = sink();
        sink.on_state(&PlaybackState::Playing).await;
        sink.on_track(&Track::new("B", "Y")).await;

        let art = decode_artwork("https://img/a.png".into(), png_bytes()).unwrap();
        sink.on_artwork(&("A".into(), "X".into()), &art).await;
        assert!(store.read().await.is_none());

        sink.on_artwork(&("B".into(), "Y".into()), &art).await;
        assert!(store.read().await.is_some());
        let track = sm.get_state().await.track.unwrap();
        assert_eq!(track.artwork_url.as_deref(), Some("https://img/a.png"));
    }

    #[tokio::test]
    async fn test_stop_clears_artwork_and_broadcasts() {
        let (sink, sm, store, mut rx, _dir) = sink();
        sink.on_state(&PlaybackState::Playing).await;
        sink.on_track(&Track::new("B", "Y")).await;
        let art = decode_artwork("https://img/b.png".into(), png_bytes()).unwrap();
        sink.on_artwork(&("B".into(), "Y".into()), &art).await;

        sink.on_state(&PlaybackState::Idle).await;
        assert!(store.read().await.is_none());
        assert!(sm.get_state().await.track.is_none());

        let mut saw_track = false;
        while let Ok(msg) = rx.try_recv() {
            if let BroadcastMessage::TrackChanged(t) = msg {
                saw_track = t.title == "Y";
            }
        }
        assert!(saw_track);
    }

    #[tokio::test]
    async fn test_share_is_broadcast() {
        let (tx, mut rx) = broadcast::channel(4);
        let share = BroadcastShareSink::new(tx);
        share
            .share(&ShareItem {
                message: "I'm listening to Africa on Maxi80 via Maxi80".into(),
                artwork: None,
            })
            .await;
        match rx.recv().await.unwrap() {
            BroadcastMessage::Share(m) => assert!(m.contains("Africa")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
