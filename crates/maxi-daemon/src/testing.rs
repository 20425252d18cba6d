//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use maxi_proto::protocol::{PlaybackState, StationDescriptor, Track, TrackKey};
use tokio::sync::{mpsc, Notify};

use crate::artwork::Artwork;
use crate::backend::{Backend, BackendError};
use crate::sinks::{NowPlayingSink, ShareItem, ShareSink};
use crate::transport::{Transport, TransportEvent};

/// A small valid PNG.
pub fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([200, 30, 30]));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

// ── FakeBackend ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBackend {
    station: Mutex<Option<Result<StationDescriptor, BackendError>>>,
    artwork_script: Mutex<VecDeque<Result<String, BackendError>>>,
    artwork_url: Mutex<Option<String>>,
    gates: Mutex<HashMap<TrackKey, (Arc<Notify>, String)>>,
    images: Mutex<HashMap<String, Vec<u8>>>,
    artwork_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_station(&self, result: Result<StationDescriptor, BackendError>) {
        *self.station.lock().unwrap() = Some(result);
    }

    /// Answers for the next artwork queries, in order.
    pub fn script_artwork(&self, answers: impl IntoIterator<Item = Result<String, BackendError>>) {
        self.artwork_script.lock().unwrap().extend(answers);
    }

    /// Answer for any artwork query once the script is exhausted.
    pub fn set_artwork_url(&self, url: &str) {
        *self.artwork_url.lock().unwrap() = Some(url.to_string());
    }

    /// Hold the artwork query for `(artist, title)` until the returned
    /// notify fires, then answer `url`.
    pub fn gate_artwork(&self, artist: &str, title: &str, url: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(
            (artist.to_string(), title.to_string()),
            (Arc::clone(&notify), url.to_string()),
        );
        notify
    }

    pub fn set_image(&self, url: &str, bytes: Vec<u8>) {
        self.images.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn artwork_calls(&self) -> usize {
        self.artwork_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_artwork_calls(&self, n: usize) {
        while self.artwork_calls() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn fetch_station(&self) -> Result<StationDescriptor, BackendError> {
        self.station
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(BackendError::NotConfigured))
    }

    async fn fetch_artwork(&self, artist: &str, track: &str) -> Result<String, BackendError> {
        self.artwork_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self
            .gates
            .lock()
            .unwrap()
            .get(&(artist.to_string(), track.to_string()))
            .cloned();
        if let Some((notify, url)) = gate {
            notify.notified().await;
            return Ok(url);
        }

        if let Some(answer) = self.artwork_script.lock().unwrap().pop_front() {
            return answer;
        }
        self.artwork_url
            .lock()
            .unwrap()
            .clone()
            .ok_or(BackendError::MissingData("artwork"))
    }

    async fn refresh_credentials(&self) -> Result<(), BackendError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        self.images
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(BackendError::Status(404))
    }
}

// ── FakeTransport ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct TransportLog {
    opened: Vec<String>,
    releases: usize,
    volumes: Vec<f32>,
    events: Option<mpsc::Sender<TransportEvent>>,
    fail_next_open: Option<String>,
    shut_down: bool,
}

/// Records every call; clones share the same log.
#[derive(Clone, Default)]
pub struct FakeTransport {
    log: Arc<Mutex<TransportLog>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<String> {
        self.log.lock().unwrap().opened.clone()
    }

    pub fn releases(&self) -> usize {
        self.log.lock().unwrap().releases
    }

    pub fn volumes(&self) -> Vec<f32> {
        self.log.lock().unwrap().volumes.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.log.lock().unwrap().shut_down
    }

    pub fn fail_next_open(&self, reason: &str) {
        self.log.lock().unwrap().fail_next_open = Some(reason.to_string());
    }

    /// Push an event as the open stream would.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self.log.lock().unwrap().events.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &mut self,
        url: &str,
        _volume: f32,
        events: mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        if let Some(reason) = log.fail_next_open.take() {
            anyhow::bail!("{}", reason);
        }
        log.opened.push(url.to_string());
        log.events = Some(events);
        Ok(())
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.releases += 1;
        log.events = None;
        Ok(())
    }

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()> {
        self.log.lock().unwrap().volumes.push(volume);
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.log.lock().unwrap().shut_down = true;
    }
}

// ── RecordingSink ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    State(PlaybackState),
    Track(Track),
    /// Key and artwork URL.
    Artwork(TrackKey, String),
    Station(StationDescriptor),
    Volume(f32),
    Share(String),
}

#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    fn push(&self, call: SinkCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<PlaybackState> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Track(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn stations(&self) -> Vec<StationDescriptor> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Station(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn volumes(&self) -> Vec<f32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Volume(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn shares(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Share(m) => Some(m),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl NowPlayingSink for RecordingSink {
    async fn on_state(&self, state: &PlaybackState) {
        self.push(SinkCall::State(state.clone()));
    }

    async fn on_track(&self, track: &Track) {
        self.push(SinkCall::Track(track.clone()));
    }

    async fn on_artwork(&self, key: &TrackKey, artwork: &Artwork) {
        self.push(SinkCall::Artwork(key.clone(), artwork.url.clone()));
    }

    async fn on_station(&self, station: &StationDescriptor) {
        self.push(SinkCall::Station(station.clone()));
    }

    async fn on_volume(&self, volume: f32) {
        self.push(SinkCall::Volume(volume));
    }
}

#[async_trait]
impl ShareSink for RecordingSink {
    async fn share(&self, item: &ShareItem) {
        self.push(SinkCall::Share(item.message.clone()));
    }
}
