//! Tunnel dispatcher: parse and classify the greeting, then drive the
//! selected mode until the client goes away.
//!
//! No server→client byte is written before the greeting is parsed and the
//! UUID validated; an unauthorized or malformed greeting closes the tunnel
//! with nothing on the wire, response prefix included.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::UuidValidator;
use crate::protocol::greeting::{self, Command, Greeting};
use crate::state::AppState;
use crate::stats::TrafficCounters;
use crate::tunnel::dns::{self, DohClient};
use crate::tunnel::mux::{self, MuxSession};
use crate::tunnel::tcp;
use crate::tunnel::writer::TunnelWriter;

/// Drive one tunnel to completion. Returns the authenticated UUID when the
/// greeting was accepted, for usage reporting at teardown.
pub async fn run<In, Out>(
    state: Arc<AppState>,
    validator: UuidValidator,
    mut inbound: In,
    sink: Out,
    early_data: Option<Vec<u8>>,
    traffic: Arc<TrafficCounters>,
) -> Option<Uuid>
where
    In: Stream<Item = Result<Message, WsError>> + Unpin,
    Out: Sink<Message> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    // First chunk: base64url early data when offered, else the first
    // binary message.
    let first_chunk = match early_data.filter(|d| !d.is_empty()) {
        Some(data) => Bytes::from(data),
        None => match next_binary(&mut inbound).await {
            Some(data) => data,
            None => return None,
        },
    };

    let greeting = match greeting::parse(&first_chunk, |u| validator.is_authorized(u)) {
        Ok(greeting) => greeting,
        Err(e) => {
            info!(error = %e, "greeting rejected, closing tunnel");
            return None;
        }
    };
    let uuid = greeting.uuid;
    let prefix = greeting::response_prefix(greeting.version).to_vec();
    let remainder = first_chunk.slice(greeting.raw_data_index..);
    let writer = TunnelWriter::new(sink, prefix);

    // Both Mux triggers land here: the explicit MUX command and a TCP/UDP
    // greeting naming the sentinel address.
    let is_mux = greeting.command == Command::Mux || greeting.address.is_mux_sentinel();

    let result = if is_mux {
        if state.config.mux_enabled {
            run_mux(&state, inbound, writer, remainder, &traffic).await
        } else {
            Err(anyhow::anyhow!("mux tunnel refused: MUX_ENABLED=false"))
        }
    } else {
        match greeting.command {
            Command::Tcp => run_tcp(&state, inbound, writer, &greeting, remainder, &traffic).await,
            Command::Udp if greeting.port == 53 => {
                run_dns(&state, inbound, writer, remainder, &traffic).await
            }
            Command::Udp => Err(anyhow::anyhow!(
                "UDP tunnel refused: port {} is not DNS",
                greeting.port
            )),
            Command::Mux => unreachable!("mux handled above"),
        }
    };

    if let Err(e) = result {
        debug!(uuid = %uuid, error = %e, "tunnel closed with error");
    }
    Some(uuid)
}

/// Pull the next binary payload, skipping control messages. None means the
/// client is gone.
async fn next_binary<In>(inbound: &mut In) -> Option<Bytes>
where
    In: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match inbound.next().await? {
            Ok(Message::Binary(data)) => return Some(Bytes::from(data)),
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "tunnel read error");
                return None;
            }
        }
    }
}

async fn run_mux<In, Out>(
    state: &Arc<AppState>,
    mut inbound: In,
    writer: TunnelWriter<Out>,
    remainder: Bytes,
    traffic: &TrafficCounters,
) -> anyhow::Result<()>
where
    In: Stream<Item = Result<Message, WsError>> + Unpin,
    Out: Sink<Message> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    let doh = DohClient::new(state.http.clone(), state.config.dns_server.clone());
    let session = MuxSession::new(doh, state.config.max_subrequests);
    let pump = tokio::spawn(mux::run_pump(session.queue(), writer));
    let idle = Duration::from_secs(state.config.idle_timeout_secs);

    let result: anyhow::Result<()> = async {
        if !remainder.is_empty() {
            mux::feed(&session, &remainder).await?;
        }
        loop {
            let deadline = tokio::time::Instant::from_std(session.last_activity() + idle);
            tokio::select! {
                msg = inbound.next() => match msg {
                    Some(Ok(Message::Binary(data))) => mux::feed(&session, &data).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "tunnel read error");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if session.is_idle(idle) {
                        info!("mux session idle, closing");
                        break;
                    }
                    // Subs are still moving but the client has been quiet
                    // past the threshold; nudge middleboxes to keep the
                    // path alive.
                    session.push_keep_alive();
                }
            }
        }
        Ok(())
    }
    .await;

    session.close();
    // The engine is authoritative for framed accounting; drain once.
    let stats = session.snapshot();
    traffic.add_uplink(stats.uplink);
    traffic.add_downlink(stats.downlink);
    debug!(
        total_tcp = stats.total_tcp,
        total_udp = stats.total_udp,
        limit_reached = stats.limit_reached,
        age_secs = session.age().as_secs(),
        "mux session closed"
    );
    let _ = pump.await;
    result
}

async fn run_tcp<In, Out>(
    state: &Arc<AppState>,
    mut inbound: In,
    writer: TunnelWriter<Out>,
    greeting: &Greeting,
    remainder: Bytes,
    traffic: &Arc<TrafficCounters>,
) -> anyhow::Result<()>
where
    In: Stream<Item = Result<Message, WsError>> + Unpin,
    Out: Sink<Message> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    let outbound = tcp::start(
        greeting.address.to_string(),
        greeting.port,
        state.config.proxy_ip.clone(),
        remainder,
        Arc::clone(traffic),
        writer,
    )
    .await?;

    let result = loop {
        match inbound.next().await {
            Some(Ok(Message::Binary(data))) => {
                if let Err(e) = outbound.write(&data).await {
                    break Err(e);
                }
            }
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "tunnel read error");
                break Ok(());
            }
        }
    };
    outbound.shutdown().await;
    result
}

async fn run_dns<In, Out>(
    state: &Arc<AppState>,
    mut inbound: In,
    mut writer: TunnelWriter<Out>,
    remainder: Bytes,
    traffic: &TrafficCounters,
) -> anyhow::Result<()>
where
    In: Stream<Item = Result<Message, WsError>> + Unpin,
    Out: Sink<Message> + Unpin + Send + 'static,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    let doh = DohClient::new(state.http.clone(), state.config.dns_server.clone());
    handle_dns_chunk(&doh, &remainder, &mut writer, traffic).await?;
    loop {
        match inbound.next().await {
            Some(Ok(Message::Binary(data))) => {
                handle_dns_chunk(&doh, &data, &mut writer, traffic).await?;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "tunnel read error");
                return Ok(());
            }
        }
    }
}

/// One DNS-mode chunk may carry several `[u16 len]`-framed queries; each
/// becomes one DoH round-trip answered in order.
async fn handle_dns_chunk<Out>(
    doh: &DohClient,
    chunk: &[u8],
    writer: &mut TunnelWriter<Out>,
    traffic: &TrafficCounters,
) -> anyhow::Result<()>
where
    Out: Sink<Message> + Unpin,
    Out::Error: std::error::Error + Send + Sync + 'static,
{
    for query in dns::split_queries(chunk) {
        traffic.add_uplink(query.len() as u64);
        match doh.query(query).await {
            Ok(body) => {
                writer.send(&dns::frame_response(&body)).await?;
                traffic.add_downlink(body.len() as u64);
            }
            Err(e) => {
                warn!(error = %e, "DoH query failed");
            }
        }
    }
    Ok(())
}
