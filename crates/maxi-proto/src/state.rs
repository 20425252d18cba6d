use crate::protocol::{PlaybackState, PlayerSnapshot, StationDescriptor, Track};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// The slice of state that survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub volume: f32,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self { volume: 0.5 }
    }
}

/// Readable snapshot of the player, shared with the socket and HTTP servers.
///
/// Only the player core writes through it; everybody else reads.
pub struct StateManager {
    state: Arc<RwLock<PlayerSnapshot>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf, station: StationDescriptor, default_volume: f32) -> Self {
        let volume = Self::load_persistent(&state_file)
            .map(|p| p.volume)
            .unwrap_or(default_volume)
            .clamp(0.0, 1.0);

        let state = PlayerSnapshot {
            rev: 1,
            station,
            playback: PlaybackState::Idle,
            track: None,
            volume,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
        }
    }

    pub async fn get_state(&self) -> PlayerSnapshot {
        self.state.read().await.clone()
    }

    pub async fn set_playback(&self, playback: PlaybackState) {
        let mut state = self.state.write().await;
        // the track only means something while audio flows, and a new
        // session starts without one
        if playback != PlaybackState::Playing {
            state.track = None;
        }
        state.playback = playback;
        state.rev += 1;
    }

    pub async fn set_station(&self, station: StationDescriptor) {
        let mut state = self.state.write().await;
        state.station = station;
        state.rev += 1;
    }

    pub async fn set_track(&self, track: Track) {
        let mut state = self.state.write().await;
        state.track = Some(track);
        state.rev += 1;
    }

    /// Attach an artwork URL to the current track, if it is still `key`.
    pub async fn set_artwork_url(&self, artist: &str, title: &str, url: String) -> bool {
        let mut state = self.state.write().await;
        match state.track.as_mut() {
            Some(track) if track.artist == artist && track.title == title => {
                track.artwork_url = Some(url);
                state.rev += 1;
                true
            }
            _ => false,
        }
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
            state.rev += 1;
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = PersistentState {
            volume: self.state.read().await.volume,
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> Option<PersistentState> {
        let content = std::fs::read_to_string(state_file).ok()?;
        match serde_json::from_str::<PersistentState>(&content) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("state: ignoring unreadable {:?}: {}", state_file, e);
                None
            }
        }
    }
}
