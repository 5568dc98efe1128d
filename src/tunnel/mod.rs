//! Tunnel sessions: one accepted WebSocket, one greeting, then an
//! arbitrary byte stream in whichever mode the greeting selected.

pub mod dispatcher;
pub mod dns;
pub mod mux;
pub mod tcp;
pub mod writer;

use std::sync::Arc;

use base64::Engine;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::state::AppState;
use crate::stats::{self, TrafficCounters};

/// Drive one upgraded connection as a tunnel until it closes.
///
/// `ws_protocol` is the client's `Sec-WebSocket-Protocol` offer, which this
/// deployment style reuses as base64url 0-RTT early data.
pub async fn serve<IO>(state: Arc<AppState>, io: IO, ws_protocol: Option<String>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let early_data = match ws_protocol.as_deref().map(decode_early_data).transpose() {
        Ok(data) => data,
        Err(e) => {
            info!(error = %e, "invalid early-data header, dropping tunnel");
            return;
        }
    };

    let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
    let (sink, stream) = ws.split();

    state.metrics.tunnel_opened();
    let traffic = TrafficCounters::new();
    let validator = state.auth.validator().await;

    let uuid = dispatcher::run(
        Arc::clone(&state),
        validator,
        stream,
        sink,
        early_data,
        Arc::clone(&traffic),
    )
    .await;

    state.metrics.tunnel_closed(traffic.uplink(), traffic.downlink());
    debug!(
        uplink = traffic.uplink(),
        downlink = traffic.downlink(),
        "tunnel finished"
    );

    if let Some(uuid) = uuid {
        report_usage(&state, &uuid.to_string(), &traffic);
    }
}

/// Hand `{uuid, uplink, downlink}` to the stats collaborator in the
/// background, when one is configured and the tunnel moved bytes.
fn report_usage(state: &AppState, uuid: &str, traffic: &TrafficCounters) {
    if traffic.is_zero() {
        return;
    }
    let Some(endpoint) = &state.config.stats_report_url else {
        return;
    };
    stats::spawn_usage_report(
        state.http.clone(),
        endpoint.clone(),
        state.config.stats_report_token.clone(),
        uuid.to_string(),
        traffic.uplink(),
        traffic.downlink(),
    );
}

/// Decode the 0-RTT early-data header: base64url with or without padding.
pub fn decode_early_data(header: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let normalized = header.replace('-', "+").replace('_', "/");
    base64::engine::general_purpose::STANDARD_NO_PAD.decode(normalized.trim_end_matches('='))
}
