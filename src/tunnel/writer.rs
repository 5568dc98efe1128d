//! Server-to-client WebSocket writer.
//!
//! Each tunnel has exactly one `TunnelWriter`, handed to whichever mode
//! driver produces downstream bytes. The two-byte response prefix is taken
//! on the first send, so it is emitted exactly once per tunnel and never
//! for tunnels that die before the greeting is answered.

use futures_util::{Sink, SinkExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

pub struct TunnelWriter<S> {
    sink: S,
    prefix: Option<Vec<u8>>,
}

impl<S> TunnelWriter<S>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn new(sink: S, prefix: Vec<u8>) -> Self {
        Self {
            sink,
            prefix: Some(prefix),
        }
    }

    /// Send one binary WebSocket message. The first message of the tunnel
    /// carries the response prefix in front of the payload.
    pub async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        let data = match self.prefix.take() {
            Some(mut prefix) => {
                prefix.extend_from_slice(payload);
                prefix
            }
            None => payload.to_vec(),
        };
        self.sink
            .send(Message::Binary(data))
            .await
            .map_err(anyhow::Error::new)
    }

    pub fn prefix_sent(&self) -> bool {
        self.prefix.is_none()
    }

    pub async fn close(&mut self) {
        if self.sink.close().await.is_err() {
            debug!("tunnel sink already closed");
        }
    }
}
