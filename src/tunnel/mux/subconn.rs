//! Sub-connection records and the per-sub outbound TCP task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::debug;

use crate::protocol::mux::{build_end, build_keep, Network};

use super::MuxSession;

/// Hard ceiling on one sub-connection TCP connect.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Outgoing payloads larger than this are split before hitting the socket
/// writer, matching the reference Mux write sizing.
pub const WRITE_CHUNK: usize = 8 * 1024;

const READ_BUF: usize = 16 * 1024;

/// Client→remote payloads buffered while the socket is still opening.
const PENDING_CAPACITY: usize = 64;

/// One logical stream inside a Mux tunnel.
pub struct SubConn {
    pub address: String,
    pub port: u16,
    pub network: Network,
    pub created_at: Instant,
    /// Socket opened and its writer acquired.
    pub ready: Arc<AtomicBool>,
    /// Set when the sub is torn down; a record is removed from the table
    /// in the same breath.
    pub closed: Arc<AtomicBool>,
    /// Client→remote payload channel; None for UDP (DoH) subs.
    pub data_tx: Option<mpsc::Sender<Bytes>>,
}

impl SubConn {
    /// A TCP sub plus the receiving end of its pending-data queue.
    pub fn tcp(address: String, port: u16) -> (Self, mpsc::Receiver<Bytes>) {
        let (data_tx, data_rx) = mpsc::channel(PENDING_CAPACITY);
        (
            Self {
                address,
                port,
                network: Network::Tcp,
                created_at: Instant::now(),
                ready: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicBool::new(false)),
                data_tx: Some(data_tx),
            },
            data_rx,
        )
    }

    pub fn udp(address: String, port: u16) -> Self {
        Self {
            address,
            port,
            network: Network::Udp,
            created_at: Instant::now(),
            ready: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
            data_tx: None,
        }
    }
}

/// Drive one TCP sub-connection: connect, flush the greeting-embedded
/// initial payload, then shuttle bytes both ways until either side ends.
///
/// The task owns the socket for the sub's whole life, so writes are FIFO
/// and never interleave with another sub's writes to the same socket.
pub(super) async fn run_tcp_sub(
    session: Arc<MuxSession>,
    id: u16,
    address: String,
    port: u16,
    initial: Bytes,
    mut data_rx: mpsc::Receiver<Bytes>,
    ready: Arc<AtomicBool>,
) {
    let connect = TcpStream::connect((address.as_str(), port));
    let mut stream = match timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(id, address = %address, port, error = %e, "sub connect failed");
            session.finish_sub(id, true);
            return;
        }
        Err(_) => {
            debug!(id, address = %address, port, "sub connect timeout");
            session.finish_sub(id, true);
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(id, error = %e, "failed to set TCP_NODELAY on sub socket");
    }
    ready.store(true, Ordering::Release);

    if !initial.is_empty() {
        if let Err(e) = write_chunked(&mut stream, &initial).await {
            debug!(id, error = %e, "initial payload write failed");
            session.finish_sub(id, false);
            return;
        }
        session.add_uplink(initial.len() as u64);
    }

    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            chunk = data_rx.recv() => match chunk {
                Some(data) => {
                    if let Err(e) = write_chunked(&mut stream, &data).await {
                        debug!(id, error = %e, "sub write failed");
                        session.finish_sub(id, false);
                        return;
                    }
                    session.add_uplink(data.len() as u64);
                }
                // Sender dropped: the client ended this sub or the tunnel
                // is tearing down. The record is already out of the table.
                None => {
                    let _ = stream.shutdown().await;
                    session.push_frame(build_end(id));
                    return;
                }
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    session.finish_sub(id, true);
                    return;
                }
                Ok(n) => {
                    if session.push_frame(build_keep(id, &buf[..n])) {
                        session.add_downlink(n as u64);
                    }
                }
                Err(e) => {
                    debug!(id, error = %e, "sub read failed");
                    session.finish_sub(id, false);
                    return;
                }
            },
        }
    }
}

/// Write `data` in bounded slices.
pub(super) async fn write_chunked<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    for chunk in data.chunks(WRITE_CHUNK) {
        writer.write_all(chunk).await?;
    }
    Ok(())
}
