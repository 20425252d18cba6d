use std::sync::Arc;

use maxi_proto::protocol::StationDescriptor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::core::PlayerEvent;

/// Fetch the station descriptor once, in the background.
///
/// The outcome is reported as `StationLoaded(Some(..))` or
/// `StationLoaded(None)`; nothing is sent when `cancel` fires first.
pub fn spawn_station_fetch(
    backend: Arc<dyn Backend>,
    events_tx: mpsc::Sender<PlayerEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("station: fetch cancelled");
                return;
            }
            r = load_station(backend.as_ref()) => r,
        };
        let _ = events_tx.send(PlayerEvent::StationLoaded(result)).await;
    })
}

async fn load_station(backend: &dyn Backend) -> Option<StationDescriptor> {
    match backend.fetch_station().await {
        Ok(station) => {
            info!("station: loaded {} ({})", station.name, station.stream_url);
            Some(station)
        }
        Err(e) => {
            warn!("station: fetch failed, keeping default: {}", e);
            None
        }
    }
}
