//! Cover art lookup for the current track.
//!
//! Every request gets a generation number.  A new request aborts the one in
//! flight and the core only applies a result whose generation and key are
//! still the latest, so a slow answer for an old track can never replace the
//! artwork of the track on screen.

use std::sync::Arc;
use std::time::Duration;

use maxi_proto::config::ArtworkConfig;
use maxi_proto::protocol::TrackKey;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError};
use crate::core::PlayerEvent;

/// A decoded, displayable cover image.
#[derive(Debug, Clone)]
pub struct Artwork {
    pub url: String,
    pub bytes: Arc<Vec<u8>>,
    pub mime: &'static str,
    pub width: u32,
    pub height: u32,
}

/// Bounded retry for authorization failures: `max_retries` extra attempts,
/// waiting `base_delay * n` before attempt `n`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * retry
    }
}

impl From<&ArtworkConfig> for RetryPolicy {
    fn from(cfg: &ArtworkConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        }
    }
}

pub struct ArtworkController {
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    events_tx: mpsc::Sender<PlayerEvent>,
    generation: u64,
    current: Option<TrackKey>,
    in_flight: Option<AbortHandle>,
}

impl ArtworkController {
    pub fn new(
        backend: Arc<dyn Backend>,
        policy: RetryPolicy,
        events_tx: mpsc::Sender<PlayerEvent>,
    ) -> Self {
        Self {
            backend,
            policy,
            events_tx,
            generation: 0,
            current: None,
            in_flight: None,
        }
    }

    /// Start a lookup for `(artist, title)`, superseding any previous one.
    ///
    /// Returns the generation of the new request, or `None` when nothing was
    /// started: both fields empty, or that key is already the current one.
    pub fn request(&mut self, artist: &str, title: &str) -> Option<u64> {
        if artist.is_empty() && title.is_empty() {
            debug!("artwork: no artist nor title, skipping");
            return None;
        }
        let key: TrackKey = (artist.to_string(), title.to_string());
        if self.current.as_ref() == Some(&key) {
            return None;
        }

        self.abort_in_flight();
        self.generation += 1;
        self.current = Some(key.clone());

        let generation = self.generation;
        let backend = Arc::clone(&self.backend);
        let policy = self.policy;
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let Some(artwork) = load_artwork(backend.as_ref(), &policy, &key).await else {
                return;
            };
            let _ = tx
                .send(PlayerEvent::ArtworkReady {
                    generation,
                    key,
                    artwork,
                })
                .await;
        });
        self.in_flight = Some(task.abort_handle());
        Some(generation)
    }

    /// True when a finished lookup still matches the latest request.
    pub fn accept(&self, generation: u64, key: &TrackKey) -> bool {
        generation == self.generation && self.current.as_ref() == Some(key)
    }

    /// Forget the current request; anything still running is discarded.
    pub fn cancel(&mut self) {
        self.abort_in_flight();
        self.generation += 1;
        self.current = None;
    }

    fn abort_in_flight(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

/// Resolve, download and decode the artwork for `key`.  Failures are logged
/// and swallowed.
async fn load_artwork(backend: &dyn Backend, policy: &RetryPolicy, key: &TrackKey) -> Option<Artwork> {
    let (artist, title) = key;
    let url = fetch_artwork_url(backend, policy, artist, title).await?;

    let bytes = match backend.download(&url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("artwork: download {} failed: {}", url, e);
            return None;
        }
    };

    let decoded = tokio::task::spawn_blocking(move || decode_artwork(url, bytes)).await;
    match decoded {
        Ok(Ok(artwork)) => {
            info!(
                "artwork: {} - {} → {} ({}x{})",
                artist, title, artwork.url, artwork.width, artwork.height
            );
            Some(artwork)
        }
        Ok(Err(e)) => {
            warn!("artwork: cannot decode image for {} - {}: {}", artist, title, e);
            None
        }
        Err(e) => {
            warn!("artwork: decode task failed: {}", e);
            None
        }
    }
}

/// Ask the backend for the artwork URL, refreshing credentials and retrying
/// on authorization failures only.
pub async fn fetch_artwork_url(
    backend: &dyn Backend,
    policy: &RetryPolicy,
    artist: &str,
    title: &str,
) -> Option<String> {
    let mut retry = 0;
    loop {
        match backend.fetch_artwork(artist, title).await {
            Ok(url) => return Some(url),
            Err(e) if e.is_auth() && retry < policy.max_retries => {
                retry += 1;
                warn!(
                    "artwork: {} for {} - {}, retry {}/{}",
                    e, artist, title, retry, policy.max_retries
                );
                if let Err(e) = backend.refresh_credentials().await {
                    warn!("artwork: credential refresh failed: {}", e);
                }
                tokio::time::sleep(policy.delay_for(retry)).await;
            }
            Err(BackendError::NotConfigured) => {
                debug!("artwork: no backend endpoint, skipping {} - {}", artist, title);
                return None;
            }
            Err(e) => {
                warn!("artwork: giving up on {} - {}: {}", artist, title, e);
                return None;
            }
        }
    }
}

/// Decode image bytes, keeping the original encoding for display sinks.
pub fn decode_artwork(url: String, bytes: Vec<u8>) -> image::ImageResult<Artwork> {
    let format = image::guess_format(&bytes)?;
    let img = image::load_from_memory_with_format(&bytes, format)?;
    Ok(Artwork {
        url,
        mime: format.to_mime_type(),
        width: img.width(),
        height: img.height(),
        bytes: Arc::new(bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{png_bytes, FakeBackend};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::from(&ArtworkConfig::default());
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_three_auth_failures_retry_twice_then_give_up() {
        let backend = FakeBackend::new();
        backend.script_artwork([
            Err(BackendError::Auth("HTTP 401".into())),
            Err(BackendError::Auth("HTTP 401".into())),
            Err(BackendError::Auth("HTTP 401".into())),
            Ok("https://img/never.png".into()),
        ]);

        let url = fetch_artwork_url(&backend, &fast_policy(), "Toto", "Africa").await;
        assert!(url.is_none());
        assert_eq!(backend.artwork_calls(), 3);
        assert_eq!(backend.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_then_success() {
        let backend = FakeBackend::new();
        backend.script_artwork([
            Err(BackendError::Auth("HTTP 403".into())),
            Ok("https://img/toto.png".into()),
        ]);

        let url = fetch_artwork_url(&backend, &fast_policy(), "Toto", "Africa").await;
        assert_eq!(url.as_deref(), Some("https://img/toto.png"));
        assert_eq!(backend.artwork_calls(), 2);
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let backend = FakeBackend::new();
        backend.script_artwork([Err(BackendError::Status(500))]);

        let url = fetch_artwork_url(&backend, &fast_policy(), "Toto", "Africa").await;
        assert!(url.is_none());
        assert_eq!(backend.artwork_calls(), 1);
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_not_retried() {
        let backend = FakeBackend::new();
        backend.script_artwork([Err(BackendError::NotConfigured)]);

        let url = fetch_artwork_url(&backend, &fast_policy(), "Toto", "Africa").await;
        assert!(url.is_none());
        assert_eq!(backend.artwork_calls(), 1);
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[test]
    fn test_decode_png() {
        let art = decode_artwork("https://img/a.png".into(), png_bytes()).unwrap();
        assert_eq!(art.mime, "image/png");
        assert_eq!((art.width, art.height), (2, 2));
        assert!(decode_artwork("x".into(), b"not an image".to_vec()).is_err());
    }

    #[tokio::test]
    async fn test_empty_key_and_repeat_key_are_skipped() {
        let backend = Arc::new(FakeBackend::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut ctl = ArtworkController::new(backend, fast_policy(), tx);

        assert_eq!(ctl.request("", ""), None);
        assert_eq!(ctl.request("Toto", "Africa"), Some(1));
        assert_eq!(ctl.request("Toto", "Africa"), None);
        assert_eq!(ctl.request("", "Live Broadcast"), Some(2));
    }

    #[tokio::test]
    async fn test_newer_request_wins_race() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_artwork_url("https://img/b.png");
        backend.set_image("https://img/b.png", png_bytes());
        // A's lookup never answers on its own
        let gate = backend.gate_artwork("A", "X", "https://img/a.png");
        backend.set_image("https://img/a.png", png_bytes());

        let (tx, mut rx) = mpsc::channel(8);
        let mut ctl = ArtworkController::new(backend.clone(), fast_policy(), tx);

        let gen_a = ctl.request("A", "X").unwrap();
        backend.wait_for_artwork_calls(1).await;
        let gen_b = ctl.request("B", "Y").unwrap();
        // let A finish now; its task has been aborted or its result is stale
        gate.notify_one();

        let Some(PlayerEvent::ArtworkReady { generation, key, artwork }) = rx.recv().await else {
            panic!("expected artwork for B");
        };
        assert_eq!(generation, gen_b);
        assert_eq!(key, ("B".to_string(), "Y".to_string()));
        assert_eq!(artwork.url, "https://img/b.png");
        assert!(ctl.accept(generation, &key));

        // a late answer for A is refused whatever order it lands in
        assert!(!ctl.accept(gen_a, &("A".to_string(), "X".to_string())));
    }

    #[tokio::test]
    async fn test_cancel_discards_current() {
        let backend = Arc::new(FakeBackend::new());
        let (tx, _rx) = mpsc::channel(8);
        let mut ctl = ArtworkController::new(backend, fast_policy(), tx);

        let gen = ctl.request("Toto", "Africa").unwrap();
        let key = ("Toto".to_string(), "Africa".to_string());
        assert!(ctl.accept(gen, &key));
        ctl.cancel();
        assert!(!ctl.accept(gen, &key));
        // same key can be requested again after a cancel
        assert!(ctl.request("Toto", "Africa").is_some());
    }
}
