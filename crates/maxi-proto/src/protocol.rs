use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a remote control client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play,
    Stop,
    /// Remote-control play/pause: stops when active, starts otherwise.
    TogglePlay,
    Volume { value: f32 },
    Share,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: PlayerSnapshot,
    },
    State {
        data: PlayerSnapshot,
    },
    Track {
        artist: String,
        title: String,
    },
    Artwork {
        url: String,
    },
    Share {
        message: String,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Playback state of the single player session.
///
/// Transitions:
///   Idle -> Loading -> Playing
///   Loading -> Failed(reason), Playing -> Failed(reason)
///   any -> Idle on explicit stop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Failed(String),
}

impl PlaybackState {
    /// True while a transport session is (or should be) open.
    pub fn is_active(&self) -> bool {
        matches!(self, PlaybackState::Loading | PlaybackState::Playing)
    }

    pub fn label(&self) -> &str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Loading => "loading",
            PlaybackState::Playing => "playing",
            PlaybackState::Failed(_) => "failed",
        }
    }
}

/// Status reported by the streaming transport after a stream is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Unknown,
    ReadyToPlay,
    Failed(String),
}

/// Static description of the station, fetched once at startup.
///
/// Never mutated field by field: a refresh replaces the whole value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationDescriptor {
    pub name: String,
    pub stream_url: String,
    pub image_url: String,
    pub short_desc: String,
    pub long_desc: String,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub donation_url: Option<String>,
}

impl Default for StationDescriptor {
    fn default() -> Self {
        Self {
            name: "Maxi80".to_string(),
            stream_url: "https://audio1.maxi80.com".to_string(),
            image_url: "cover.png".to_string(),
            short_desc: "La radio de toute une génération".to_string(),
            long_desc: "Le meilleur de la musique des années 80".to_string(),
            website_url: Some("https://maxi80.com".to_string()),
            donation_url: Some("https://www.maxi80.com/paypal.htm".to_string()),
        }
    }
}

/// Currently playing track.  A new value is built for every metadata event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Track {
    pub artist: String,
    pub title: String,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// Identity of a track for artwork lookups.
pub type TrackKey = (String, String);

impl Track {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            artwork_url: None,
        }
    }

    pub fn key(&self) -> TrackKey {
        (self.artist.clone(), self.title.clone())
    }
}

/// Full state of the player.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlayerSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub station: StationDescriptor,
    pub playback: PlaybackState,
    pub track: Option<Track>,
    pub volume: f32,
}

impl PlayerSnapshot {
    pub fn is_playing(&self) -> bool {
        self.playback == PlaybackState::Playing
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_command_decodes() {
        let msg = Message::Command(Command::Volume { value: 0.25 });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Volume { value }) => assert_eq!(value, 0.25),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_carries_failed_state() {
        let state = PlayerSnapshot {
            rev: 7,
            playback: PlaybackState::Failed("network".to_string()),
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: 7,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(rev, 7);
                assert_eq!(state.playback, PlaybackState::Failed("network".into()));
                assert_eq!(state.station.name, "Maxi80");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let encoded = Message::Command(Command::Stop).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_playback_state_activity() {
        assert!(!PlaybackState::Idle.is_active());
        assert!(PlaybackState::Loading.is_active());
        assert!(PlaybackState::Playing.is_active());
        assert!(!PlaybackState::Failed("x".into()).is_active());
    }
}
