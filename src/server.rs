//! HTTP front door: liveness banner, key-guarded /api endpoints, and the
//! WebSocket upgrade that hands connections to the tunnel dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{
    HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tracing::{debug, info, warn};

use crate::state::AppState;
use crate::tunnel;

/// Start the server: accept loop plus graceful shutdown.
pub async fn run(
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.listen_port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "new connection");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                }

                let state = Arc::clone(&state);
                tokio::task::spawn(async move {
                    let service = service_fn({
                        let state = Arc::clone(&state);
                        move |req| handle(Arc::clone(&state), req)
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        if !e.to_string().contains("connection closed") {
                            debug!(peer = %peer_addr, error = %e, "connection error");
                        }
                    }
                });
            }
            _ = shutdown_rx.changed() => {
                info!("server shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Route one request.
pub async fn handle<B>(
    state: Arc<AppState>,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Send + 'static,
{
    if is_websocket_upgrade(&req) {
        return Ok(handle_ws_upgrade(state, req));
    }

    let path = req.uri().path().to_string();
    let response = match (req.method(), path.as_str()) {
        (&Method::GET, "/") => liveness(&state),
        (&Method::GET, "/api/uuids") => match require_api_key(&state, &req) {
            Err(denied) => denied,
            Ok(()) => {
                let uuids = state.auth.authorized().await;
                json(
                    StatusCode::OK,
                    &serde_json::json!({ "count": uuids.len(), "uuids": uuids }),
                )
            }
        },
        (&Method::GET, "/api/uuids/refresh") => match require_api_key(&state, &req) {
            Err(denied) => denied,
            Ok(()) => {
                let uuids = state.auth.refresh().await;
                json(
                    StatusCode::OK,
                    &serde_json::json!({ "count": uuids.len(), "uuids": uuids }),
                )
            }
        },
        (&Method::GET, "/api/stats") => match require_api_key(&state, &req) {
            Err(denied) => denied,
            Ok(()) => {
                let m = &state.metrics;
                json(
                    StatusCode::OK,
                    &serde_json::json!({
                        "tunnels_total": m.tunnels_total.load(Ordering::Relaxed),
                        "tunnels_active": m.tunnels_active.load(Ordering::Relaxed),
                        "bytes_uplink": m.bytes_uplink.load(Ordering::Relaxed),
                        "bytes_downlink": m.bytes_downlink.load(Ordering::Relaxed),
                        "uptime_secs": m.uptime_secs(),
                    }),
                )
            }
        },
        _ => not_found(),
    };
    Ok(response)
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Answer 101 and hand the upgraded IO to the tunnel dispatcher. The
/// client's `Sec-WebSocket-Protocol` offer is echoed back and reused as
/// 0-RTT early data.
fn handle_ws_upgrade<B>(state: Arc<AppState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Send + 'static,
{
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return plain(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());
    let protocol = req
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let protocol_for_tunnel = protocol.clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                tunnel::serve(state, TokioIo::new(upgraded), protocol_for_tunnel).await;
            }
            Err(e) => {
                debug!(error = %e, "WebSocket upgrade failed");
            }
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol {
        if let Ok(value) = HeaderValue::from_str(&protocol) {
            builder = builder.header(SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    builder
        .body(Full::new(Bytes::new()))
        .expect("valid upgrade response")
}

/// Check the /api secret: `X-API-Key`, `Authorization: Bearer`, or `?key=`.
fn require_api_key<B>(state: &AppState, req: &Request<B>) -> Result<(), Response<Full<Bytes>>> {
    let Some(expected) = &state.config.api_key else {
        return Err(json(
            StatusCode::UNAUTHORIZED,
            &serde_json::json!({ "error": "API_KEY not configured" }),
        ));
    };

    let header_key = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let bearer = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let query_key = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("key=")));

    let supplied = header_key.or(bearer).or(query_key);
    if supplied == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(json(
            StatusCode::UNAUTHORIZED,
            &serde_json::json!({ "error": "unauthorized" }),
        ))
    }
}

fn liveness(state: &AppState) -> Response<Full<Bytes>> {
    json(
        StatusCode::OK,
        &serde_json::json!({
            "service": "veilgate",
            "version": env!("CARGO_PKG_VERSION"),
            "mux_enabled": state.config.mux_enabled,
        }),
    )
}

fn json(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid json response")
}

fn plain(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(msg.to_string())))
        .expect("valid response")
}

fn not_found() -> Response<Full<Bytes>> {
    plain(StatusCode::NOT_FOUND, "Not Found")
}
