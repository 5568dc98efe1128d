//! DNS-over-HTTPS: the only UDP the tunnel carries.
//!
//! Mux sub-connections on port 53 and non-Mux UDP tunnels both resolve
//! through here. Queries go out as RFC 8484 POSTs; answers come back as
//! raw DNS message bytes.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

/// Ceiling on one DoH round-trip.
pub const DOH_TIMEOUT: Duration = Duration::from_secs(5);

const DNS_MESSAGE: &str = "application/dns-message";

/// Client for the configured DoH endpoint.
#[derive(Clone)]
pub struct DohClient {
    http: reqwest::Client,
    endpoint: String,
}

impl DohClient {
    pub fn new(http: reqwest::Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }

    /// Forward one raw DNS query and return the raw answer bytes.
    pub async fn query(&self, packet: &[u8]) -> anyhow::Result<Bytes> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .timeout(DOH_TIMEOUT)
            .body(packet.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?)
    }
}

/// Split a non-Mux DNS-mode chunk into `[u16 len][query]` framed units.
///
/// A framed query is assumed to never straddle WebSocket messages; a
/// trailing partial frame is dropped, matching the reference behavior
/// rather than reassembling across messages.
pub fn split_queries(chunk: &[u8]) -> Vec<&[u8]> {
    let mut queries = Vec::new();
    let mut offset = 0;
    while offset + 2 <= chunk.len() {
        let len = u16::from_be_bytes([chunk[offset], chunk[offset + 1]]) as usize;
        if offset + 2 + len > chunk.len() {
            debug!(
                declared = len,
                remaining = chunk.len() - offset - 2,
                "partial DNS frame dropped"
            );
            break;
        }
        queries.push(&chunk[offset + 2..offset + 2 + len]);
        offset += 2 + len;
    }
    queries
}

/// Re-frame a DoH answer for the client stream: `[u16 len][body]`.
pub fn frame_response(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + body.len());
    framed.extend_from_slice(&(body.len() as u16).to_be_bytes());
    framed.extend_from_slice(body);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_back_to_back_queries() {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&3u16.to_be_bytes());
        chunk.extend_from_slice(b"abc");
        chunk.extend_from_slice(&2u16.to_be_bytes());
        chunk.extend_from_slice(b"de");
        let queries = split_queries(&chunk);
        assert_eq!(queries, vec![&b"abc"[..], &b"de"[..]]);
    }

    #[test]
    fn drops_trailing_partial_frame() {
        let mut chunk = Vec::new();
        chunk.extend_from_slice(&2u16.to_be_bytes());
        chunk.extend_from_slice(b"ok");
        chunk.extend_from_slice(&28u16.to_be_bytes());
        chunk.extend_from_slice(b"short");
        let queries = split_queries(&chunk);
        assert_eq!(queries, vec![&b"ok"[..]]);
    }

    #[test]
    fn empty_and_header_only_chunks() {
        assert!(split_queries(&[]).is_empty());
        assert!(split_queries(&[0x00]).is_empty());
    }

    #[test]
    fn zero_length_query_is_preserved() {
        let chunk = [0u8, 0, 0, 1, b'x'];
        let queries = split_queries(&chunk);
        assert_eq!(queries, vec![&b""[..], &b"x"[..]]);
    }

    #[test]
    fn response_framing() {
        let framed = frame_response(b"answer");
        assert_eq!(&framed[..2], &6u16.to_be_bytes());
        assert_eq!(&framed[2..], b"answer");
    }
}
