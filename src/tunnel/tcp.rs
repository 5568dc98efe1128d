//! Outbound TCP for plain (non-Mux) tunnels.
//!
//! The dispatcher owns the uplink writer through [`TcpOutbound`]; a spawned
//! bridge task pipes remote bytes back onto the WebSocket. When the first
//! connection yields no inbound bytes before EOF, the bridge retries once
//! through the configured proxy host (or the original address), replaying
//! the greeting-embedded initial payload.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Sink;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::stats::TrafficCounters;
use crate::tunnel::writer::TunnelWriter;

/// Hard ceiling on an outbound connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const READ_BUF: usize = 16 * 1024;

/// Handle the dispatcher keeps for uplink writes.
pub struct TcpOutbound {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    shutdown: watch::Sender<bool>,
    traffic: Arc<TrafficCounters>,
}

struct RetryTarget {
    host: String,
    port: u16,
    initial: Bytes,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

/// Connect to the target, send the initial payload, and spawn the
/// downstream bridge. A connect failure falls back to the proxy host once
/// before giving up.
pub async fn start<S>(
    host: String,
    port: u16,
    proxy_host: Option<String>,
    initial: Bytes,
    traffic: Arc<TrafficCounters>,
    ws_writer: TunnelWriter<S>,
) -> anyhow::Result<TcpOutbound>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let (stream, retried) = match connect_and_send(&host, port, &initial).await {
        Ok(stream) => (stream, false),
        Err(e) => {
            let retry_host = proxy_host.clone().unwrap_or_else(|| host.clone());
            debug!(host = %host, port, error = %e, retry_host = %retry_host, "connect failed, retrying");
            (connect_and_send(&retry_host, port, &initial).await?, true)
        }
    };
    if !initial.is_empty() {
        traffic.add_uplink(initial.len() as u64);
    }

    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(Some(write_half)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The single retry is spent either on connect failure or on an
    // empty-handed EOF, never both.
    let retry = if retried {
        None
    } else {
        Some(RetryTarget {
            host: proxy_host.unwrap_or(host),
            port,
            initial,
            writer: Arc::clone(&writer),
        })
    };

    tokio::spawn(bridge(
        read_half,
        ws_writer,
        Arc::clone(&traffic),
        retry,
        shutdown_rx,
    ));

    Ok(TcpOutbound {
        writer,
        shutdown: shutdown_tx,
        traffic,
    })
}

impl TcpOutbound {
    /// Forward one client chunk to the remote socket.
    pub async fn write(&self, chunk: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("outbound writer gone"))?;
        writer.write_all(chunk).await?;
        self.traffic.add_uplink(chunk.len() as u64);
        Ok(())
    }

    /// Tear the outbound down; the bridge task exits promptly.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.writer.lock().await.take();
    }
}

async fn connect_and_send(host: &str, port: u16, initial: &[u8]) -> anyhow::Result<TcpStream> {
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| anyhow::anyhow!("connect timeout ({CONNECT_TIMEOUT:?})"))??;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }
    if !initial.is_empty() {
        stream.write_all(initial).await?;
    }
    Ok(stream)
}

impl RetryTarget {
    async fn reconnect(self) -> anyhow::Result<OwnedReadHalf> {
        let stream = connect_and_send(&self.host, self.port, &self.initial).await?;
        let (read_half, write_half) = stream.into_split();
        // Swap the uplink writer so later client chunks reach the new
        // socket; the old half drops here and sends its FIN.
        *self.writer.lock().await = Some(write_half);
        Ok(read_half)
    }
}

/// Pipe remote bytes to the WebSocket. A clean EOF leaves the WebSocket
/// open (the client initiates close); a read error closes it.
async fn bridge<S>(
    mut read_half: OwnedReadHalf,
    mut ws: TunnelWriter<S>,
    traffic: Arc<TrafficCounters>,
    mut retry: Option<RetryTarget>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let mut buf = vec![0u8; READ_BUF];
    let mut got_data = false;
    loop {
        let read = tokio::select! {
            read = read_half.read(&mut buf) => read,
            _ = shutdown.changed() => return,
        };
        match read {
            Ok(0) => {
                if !got_data {
                    if let Some(target) = retry.take() {
                        debug!(host = %target.host, port = target.port, "no data before EOF, retrying");
                        match target.reconnect().await {
                            Ok(new_read) => {
                                read_half = new_read;
                                continue;
                            }
                            Err(e) => {
                                debug!(error = %e, "retry connect failed");
                                ws.close().await;
                                return;
                            }
                        }
                    }
                }
                return;
            }
            Ok(n) => {
                got_data = true;
                if ws.send(&buf[..n]).await.is_err() {
                    return;
                }
                traffic.add_downlink(n as u64);
            }
            Err(e) => {
                debug!(error = %e, "downstream read failed");
                ws.close().await;
                return;
            }
        }
    }
}
