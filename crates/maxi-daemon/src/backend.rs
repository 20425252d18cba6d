//! Query backend client.
//!
//! The backend answers two GraphQL queries over plain HTTP POST: the station
//! descriptor and the artwork URL for an `(artist, track)` pair.  Callers
//! branch on [`BackendError::is_auth`] to decide whether a credential refresh
//! and retry is worthwhile.

use async_trait::async_trait;
use maxi_proto::config::BackendConfig;
use maxi_proto::protocol::StationDescriptor;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("maxi80d/", env!("CARGO_PKG_VERSION"));

const STATION_QUERY: &str =
    "query Station { station { name streamUrl imageUrl desc longDesc websiteUrl donationUrl } }";

const ARTWORK_QUERY: &str =
    "query Artwork($artist: String!, $track: String!) { artwork(artist: $artist, track: $track) { url } }";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend endpoint not configured")]
    NotConfigured,

    /// Credential rejected; retryable after a refresh.
    #[error("authorization rejected: {0}")]
    Auth(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("response missing {0}")]
    MissingData(&'static str),
}

impl BackendError {
    pub fn is_auth(&self) -> bool {
        matches!(self, BackendError::Auth(_))
    }

    fn from_status(status: StatusCode) -> Option<Self> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Some(BackendError::Auth(format!("HTTP {}", status.as_u16())))
        } else if !status.is_success() {
            Some(BackendError::Status(status.as_u16()))
        } else {
            None
        }
    }
}

/// Remote collaborator for station data, artwork lookups and image downloads.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn fetch_station(&self) -> Result<StationDescriptor, BackendError>;

    /// Returns the URL of the cover art for `(artist, track)`.
    async fn fetch_artwork(&self, artist: &str, track: &str) -> Result<String, BackendError>;

    async fn refresh_credentials(&self) -> Result<(), BackendError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, BackendError>;
}

// ── GraphQL envelope ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_type: Option<String>,
}

impl GraphQlError {
    fn is_unauthorized(&self) -> bool {
        self.error_type
            .as_deref()
            .map(|t| t.starts_with("Unauthorized"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
struct StationData {
    station: Option<RawStation>,
}

/// Wire shape of the station; every field is optional so that a partial
/// answer is reported as missing data rather than a decode error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStation {
    name: Option<String>,
    stream_url: Option<String>,
    image_url: Option<String>,
    desc: Option<String>,
    long_desc: Option<String>,
    website_url: Option<String>,
    donation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtworkData {
    artwork: Option<RawArtwork>,
}

#[derive(Debug, Deserialize)]
struct RawArtwork {
    url: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, BackendError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(BackendError::MissingData(field))
}

impl RawStation {
    fn into_descriptor(self) -> Result<StationDescriptor, BackendError> {
        Ok(StationDescriptor {
            name: required(self.name, "station.name")?,
            stream_url: required(self.stream_url, "station.streamUrl")?,
            image_url: required(self.image_url, "station.imageUrl")?,
            short_desc: required(self.desc, "station.desc")?,
            long_desc: required(self.long_desc, "station.longDesc")?,
            website_url: self.website_url.filter(|s| !s.trim().is_empty()),
            donation_url: self.donation_url.filter(|s| !s.trim().is_empty()),
        })
    }
}

fn unwrap_envelope<T: DeserializeOwned>(body: Value) -> Result<T, BackendError> {
    let resp: GraphQlResponse<T> =
        serde_json::from_value(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    if let Some(err) = resp.errors.iter().find(|e| e.is_unauthorized()) {
        return Err(BackendError::Auth(err.message.clone()));
    }
    match (resp.data, resp.errors.first()) {
        (Some(data), _) => Ok(data),
        (None, Some(err)) => Err(BackendError::Decode(err.message.clone())),
        (None, None) => Err(BackendError::MissingData("data")),
    }
}

/// Decode a station query answer into a complete descriptor.
pub fn parse_station_response(body: Value) -> Result<StationDescriptor, BackendError> {
    let data: StationData = unwrap_envelope(body)?;
    data.station
        .ok_or(BackendError::MissingData("station"))?
        .into_descriptor()
}

/// Decode an artwork query answer into the image URL.
pub fn parse_artwork_response(body: Value) -> Result<String, BackendError> {
    let data: ArtworkData = unwrap_envelope(body)?;
    required(
        data.artwork.ok_or(BackendError::MissingData("artwork"))?.url,
        "artwork.url",
    )
}

// ── HTTP implementation ───────────────────────────────────────────────────────

pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> anyhow::Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
        })
    }

    async fn query(&self, query: &str, variables: Value) -> Result<Value, BackendError> {
        if self.config.endpoint.is_empty() {
            return Err(BackendError::NotConfigured);
        }

        let mut req = self
            .client
            .post(&self.config.endpoint)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(key) = &self.config.api_key {
            req = req.header("x-api-key", key);
        }
        if let Some(token) = self.token.read().await.as_deref() {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if let Some(err) = BackendError::from_status(resp.status()) {
            return Err(err);
        }
        Ok(resp.json::<Value>().await?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_station(&self) -> Result<StationDescriptor, BackendError> {
        debug!("backend: station query");
        let body = self.query(STATION_QUERY, json!({})).await?;
        parse_station_response(body)
    }

    async fn fetch_artwork(&self, artist: &str, track: &str) -> Result<String, BackendError> {
        debug!("backend: artwork query artist={:?} track={:?}", artist, track);
        let body = self
            .query(ARTWORK_QUERY, json!({ "artist": artist, "track": track }))
            .await?;
        parse_artwork_response(body)
    }

    async fn refresh_credentials(&self) -> Result<(), BackendError> {
        let Some(token_url) = &self.config.token_url else {
            debug!("backend: no token endpoint, nothing to refresh");
            return Ok(());
        };

        let mut req = self.client.post(token_url);
        if let Some(key) = &self.config.api_key {
            req = req.header("x-api-key", key);
        }
        let resp = req.send().await?;
        if let Some(err) = BackendError::from_status(resp.status()) {
            return Err(err);
        }
        let body: TokenResponse = resp.json().await?;
        *self.token.write().await = Some(body.token);
        info!("backend: credentials refreshed");
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let resp = self.client.get(url).send().await?;
        if let Some(err) = BackendError::from_status(resp.status()) {
            return Err(err);
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
