use async_trait::async_trait;
use maxi_proto::protocol::TransportStatus;
use tokio::sync::mpsc;

/// Something the streaming transport reports about an open stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(TransportStatus),
    /// Raw ICY title, as delivered by the stream.
    Metadata(String),
}

/// Streaming media player seam.
///
/// Exactly one stream is open at a time.  After `open`, status and metadata
/// are pushed into `events` until `release` is called or the sender is
/// dropped by the implementation.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(
        &mut self,
        url: &str,
        volume: f32,
        events: mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<()>;

    /// Stop the stream and drop every observer registered by `open`.
    async fn release(&mut self) -> anyhow::Result<()>;

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()>;

    /// Called once when the daemon exits.
    async fn shutdown(&mut self) {
        let _ = self.release().await;
    }
}
