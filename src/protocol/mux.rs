//! Mux.Cool frame codec.
//!
//! Frame layout:
//! ```text
//! | metadata_len (2B, BE) | metadata (NB) | [data_len (2B, BE) | data (NB)] |
//! ```
//! Metadata always starts with `| sub_id (2B) | status (1B) | option (1B) |`;
//! the trailing data section is present iff the low bit of `option` is set.
//! New frames append `| network (1B) | port (2B) | addr_type (1B) | addr |`
//! plus an optional 8-byte XUDP global id; Keep frames may repeat the same
//! address tuple when they carry UDP.

use bytes::{BufMut, Bytes, BytesMut};

use super::{parse_address, Address, AddressError};

/// Option bit: a `[u16 len][data]` section follows the metadata.
pub const OPT_DATA: u8 = 0x01;

/// Smallest valid metadata section (id + status + option).
const MIN_METADATA_LEN: usize = 4;

/// Frame status discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxStatus {
    New = 1,
    Keep = 2,
    End = 3,
    KeepAlive = 4,
}

impl MuxStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::New),
            2 => Some(Self::Keep),
            3 => Some(Self::End),
            4 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

/// Transport requested by a New frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Network {
    Tcp = 1,
    Udp = 2,
}

impl Network {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Tcp),
            2 => Some(Self::Udp),
            _ => None,
        }
    }
}

/// Target tuple embedded in New (and optionally Keep) metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxTarget {
    pub network: Network,
    pub port: u16,
    pub address: Address,
}

/// A parsed Mux frame. `data` borrows from the input buffer; the codec
/// never copies payload bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct MuxFrame<'a> {
    pub sub_id: u16,
    pub status: MuxStatus,
    pub option: u8,
    pub target: Option<MuxTarget>,
    pub global_id: Option<[u8; 8]>,
    pub data: Option<&'a [u8]>,
}

/// Codec errors. `Incomplete` is recoverable — the caller should buffer
/// more bytes and retry; everything else poisons the tunnel.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("frame incomplete: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("metadata too short: {0} bytes")]
    ShortMetadata(usize),
    #[error("unknown frame status: {0}")]
    UnknownStatus(u8),
    #[error("unknown network: {0}")]
    UnknownNetwork(u8),
    #[error("bad target address: {0}")]
    BadAddress(#[from] AddressError),
}

impl MuxError {
    /// True when the caller should wait for more input rather than fail.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MuxError::Incomplete { .. })
    }
}

/// Parse one frame from the head of `buf`.
///
/// Returns the frame and the total number of bytes consumed.
pub fn parse_frame(buf: &[u8]) -> Result<(MuxFrame<'_>, usize), MuxError> {
    if buf.len() < 2 {
        return Err(MuxError::Incomplete {
            expected: 2,
            actual: buf.len(),
        });
    }
    let meta_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if meta_len < MIN_METADATA_LEN {
        return Err(MuxError::ShortMetadata(meta_len));
    }
    if buf.len() < 2 + meta_len {
        return Err(MuxError::Incomplete {
            expected: 2 + meta_len,
            actual: buf.len(),
        });
    }

    let meta = &buf[2..2 + meta_len];
    let sub_id = u16::from_be_bytes([meta[0], meta[1]]);
    let status = MuxStatus::from_u8(meta[2]).ok_or(MuxError::UnknownStatus(meta[2]))?;
    let option = meta[3];
    let extra = &meta[4..];

    let (target, global_id) = match status {
        MuxStatus::New => {
            let (target, used) = parse_target(extra)?;
            let rest = &extra[used..];
            let global_id = if rest.len() >= 8 {
                let mut id = [0u8; 8];
                id.copy_from_slice(&rest[..8]);
                Some(id)
            } else {
                None
            };
            (Some(target), global_id)
        }
        // Keep frames carrying UDP repeat the target tuple.
        MuxStatus::Keep if !extra.is_empty() => {
            let (target, _) = parse_target(extra)?;
            (Some(target), None)
        }
        _ => (None, None),
    };

    let mut consumed = 2 + meta_len;
    let data = if option & OPT_DATA != 0 {
        if buf.len() < consumed + 2 {
            return Err(MuxError::Incomplete {
                expected: consumed + 2,
                actual: buf.len(),
            });
        }
        let data_len = u16::from_be_bytes([buf[consumed], buf[consumed + 1]]) as usize;
        if buf.len() < consumed + 2 + data_len {
            return Err(MuxError::Incomplete {
                expected: consumed + 2 + data_len,
                actual: buf.len(),
            });
        }
        let data = &buf[consumed + 2..consumed + 2 + data_len];
        consumed += 2 + data_len;
        Some(data)
    } else {
        None
    };

    Ok((
        MuxFrame {
            sub_id,
            status,
            option,
            target,
            global_id,
            data,
        },
        consumed,
    ))
}

fn parse_target(buf: &[u8]) -> Result<(MuxTarget, usize), MuxError> {
    if buf.len() < 3 {
        return Err(MuxError::BadAddress(AddressError::Truncated));
    }
    let network = Network::from_u8(buf[0]).ok_or(MuxError::UnknownNetwork(buf[0]))?;
    let port = u16::from_be_bytes([buf[1], buf[2]]);
    let (address, addr_used) = parse_address(&buf[3..])?;
    Ok((
        MuxTarget {
            network,
            port,
            address,
        },
        3 + addr_used,
    ))
}

/// Build a Keep frame for `sub_id`. The data option bit is set iff `data`
/// is non-empty.
pub fn build_keep(sub_id: u16, data: &[u8]) -> Bytes {
    let option = if data.is_empty() { 0 } else { OPT_DATA };
    let mut buf = BytesMut::with_capacity(2 + MIN_METADATA_LEN + 2 + data.len());
    buf.put_u16(MIN_METADATA_LEN as u16);
    buf.put_u16(sub_id);
    buf.put_u8(MuxStatus::Keep as u8);
    buf.put_u8(option);
    if !data.is_empty() {
        buf.put_u16(data.len() as u16);
        buf.put_slice(data);
    }
    buf.freeze()
}

/// Build an End frame for `sub_id`.
pub fn build_end(sub_id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + MIN_METADATA_LEN);
    buf.put_u16(MIN_METADATA_LEN as u16);
    buf.put_u16(sub_id);
    buf.put_u8(MuxStatus::End as u8);
    buf.put_u8(0);
    buf.freeze()
}

/// Build a KeepAlive frame. The sub id is meaningless for keep-alives;
/// a random one is used, as the reference framing does.
pub fn build_keep_alive() -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + MIN_METADATA_LEN);
    buf.put_u16(MIN_METADATA_LEN as u16);
    buf.put_u16(rand::random::<u16>());
    buf.put_u8(MuxStatus::KeepAlive as u8);
    buf.put_u8(0);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built New frame: id, TCP, port, IPv4 target, optional data.
    pub(crate) fn build_new_tcp(sub_id: u16, ip: [u8; 4], port: u16, data: &[u8]) -> Vec<u8> {
        let meta_len = 4 + 1 + 2 + 1 + 4;
        let option = if data.is_empty() { 0 } else { OPT_DATA };
        let mut buf = Vec::new();
        buf.extend_from_slice(&(meta_len as u16).to_be_bytes());
        buf.extend_from_slice(&sub_id.to_be_bytes());
        buf.push(MuxStatus::New as u8);
        buf.push(option);
        buf.push(Network::Tcp as u8);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.push(1); // IPv4
        buf.extend_from_slice(&ip);
        if !data.is_empty() {
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data);
        }
        buf
    }

    #[test]
    fn keep_roundtrip_with_data() {
        let wire = build_keep(7, b"XYZ");
        let (frame, used) = parse_frame(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(frame.sub_id, 7);
        assert_eq!(frame.status, MuxStatus::Keep);
        assert_eq!(frame.option, OPT_DATA);
        assert_eq!(frame.data, Some(&b"XYZ"[..]));
        assert!(frame.target.is_none());
    }

    #[test]
    fn keep_without_data_has_no_option_bit() {
        let wire = build_keep(7, b"");
        let (frame, used) = parse_frame(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(frame.option & OPT_DATA, 0);
        assert!(frame.data.is_none());
    }

    #[test]
    fn end_roundtrip() {
        let wire = build_end(513);
        let (frame, used) = parse_frame(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(frame.sub_id, 513);
        assert_eq!(frame.status, MuxStatus::End);
        assert!(frame.data.is_none());
    }

    #[test]
    fn keep_alive_roundtrip() {
        let wire = build_keep_alive();
        let (frame, used) = parse_frame(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(frame.status, MuxStatus::KeepAlive);
    }

    #[test]
    fn new_frame_carries_target_and_data() {
        let wire = build_new_tcp(7, [1, 1, 1, 1], 443, b"ABC");
        let (frame, used) = parse_frame(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(frame.sub_id, 7);
        assert_eq!(frame.status, MuxStatus::New);
        let target = frame.target.unwrap();
        assert_eq!(target.network, Network::Tcp);
        assert_eq!(target.port, 443);
        assert_eq!(target.address.to_string(), "1.1.1.1");
        assert_eq!(frame.data, Some(&b"ABC"[..]));
    }

    #[test]
    fn new_frame_with_global_id() {
        let meta_len = 4 + 1 + 2 + 1 + 4 + 8;
        let mut buf = Vec::new();
        buf.extend_from_slice(&(meta_len as u16).to_be_bytes());
        buf.extend_from_slice(&9u16.to_be_bytes());
        buf.push(MuxStatus::New as u8);
        buf.push(0);
        buf.push(Network::Udp as u8);
        buf.extend_from_slice(&53u16.to_be_bytes());
        buf.push(1);
        buf.extend_from_slice(&[8, 8, 4, 4]);
        buf.extend_from_slice(&[0xAB; 8]);
        let (frame, used) = parse_frame(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(frame.global_id, Some([0xAB; 8]));
        assert_eq!(frame.target.unwrap().network, Network::Udp);
    }

    #[test]
    fn keep_may_repeat_udp_target() {
        let meta_len = 4 + 1 + 2 + 1 + 4;
        let mut buf = Vec::new();
        buf.extend_from_slice(&(meta_len as u16).to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.push(MuxStatus::Keep as u8);
        buf.push(0);
        buf.push(Network::Udp as u8);
        buf.extend_from_slice(&53u16.to_be_bytes());
        buf.push(1);
        buf.extend_from_slice(&[1, 0, 0, 1]);
        let (frame, _) = parse_frame(&buf).unwrap();
        let target = frame.target.unwrap();
        assert_eq!(target.network, Network::Udp);
        assert_eq!(target.address.to_string(), "1.0.0.1");
    }

    #[test]
    fn short_metadata_is_malformed() {
        // metadata_length = 3 < 4
        let buf = [0x00, 0x03, 0, 0, 0];
        let err = parse_frame(&buf).unwrap_err();
        assert!(matches!(err, MuxError::ShortMetadata(3)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn truncated_metadata_is_recoverable() {
        let wire = build_keep(1, b"payload");
        let err = parse_frame(&wire[..4]).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn declared_data_beyond_buffer_is_recoverable() {
        let wire = build_keep(1, b"payload");
        let err = parse_frame(&wire[..wire.len() - 2]).unwrap_err();
        assert!(matches!(err, MuxError::Incomplete { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn unknown_status_is_malformed() {
        let buf = [0x00, 0x04, 0x00, 0x01, 0x09, 0x00];
        let err = parse_frame(&buf).unwrap_err();
        assert!(matches!(err, MuxError::UnknownStatus(9)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn back_to_back_frames_parse_in_sequence() {
        let mut wire = build_new_tcp(7, [1, 1, 1, 1], 443, b"ABC");
        wire.extend_from_slice(&build_keep(7, b"XYZ"));
        wire.extend_from_slice(&build_end(7));

        let (f1, used1) = parse_frame(&wire).unwrap();
        assert_eq!(f1.status, MuxStatus::New);
        let (f2, used2) = parse_frame(&wire[used1..]).unwrap();
        assert_eq!(f2.status, MuxStatus::Keep);
        assert_eq!(f2.data, Some(&b"XYZ"[..]));
        let (f3, used3) = parse_frame(&wire[used1 + used2..]).unwrap();
        assert_eq!(f3.status, MuxStatus::End);
        assert_eq!(used1 + used2 + used3, wire.len());
    }
}
