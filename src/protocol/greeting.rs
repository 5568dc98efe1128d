//! Greeting parser: the per-tunnel header that authenticates the client
//! and names the target.
//!
//! Layout:
//! ```text
//! | version (1B) | uuid (16B) | opt_len (1B) | opt (NB) | command (1B) |
//! | port (2B, BE) | addr_type (1B) | address (NB) | payload... |
//! ```
//! MUX-command greetings omit port and address entirely; the payload is
//! the first Mux frame.

use uuid::Uuid;

use super::{parse_address, Address, AddressError, MUX_ADDRESS};

/// Minimum bytes before greeting parsing is attempted.
pub const MIN_GREETING_LEN: usize = 24;

/// Tunnel command requested by the greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Tcp = 0x01,
    Udp = 0x02,
    Mux = 0x03,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Tcp),
            0x02 => Some(Self::Udp),
            0x03 => Some(Self::Mux),
            _ => None,
        }
    }
}

/// Parsed greeting header.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub version: u8,
    pub uuid: Uuid,
    pub command: Command,
    /// Zero for MUX greetings (no port field on the wire).
    pub port: u16,
    pub address: Address,
    /// Index of the first payload byte after the header.
    pub raw_data_index: usize,
}

/// Greeting parse failures. All of these close the tunnel before a
/// response prefix is ever written.
#[derive(Debug, thiserror::Error)]
pub enum GreetingError {
    #[error("greeting too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Invalid user")]
    InvalidUser,
    #[error("unsupported command: 0x{0:02x}")]
    UnsupportedCommand(u8),
    #[error("invalid address: {0}")]
    Address(#[from] AddressError),
}

/// Parse a greeting from the head of `buf`, validating the embedded UUID
/// with `is_authorized`.
pub fn parse(
    buf: &[u8],
    is_authorized: impl Fn(&Uuid) -> bool,
) -> Result<Greeting, GreetingError> {
    if buf.len() < MIN_GREETING_LEN {
        return Err(GreetingError::TooShort {
            expected: MIN_GREETING_LEN,
            actual: buf.len(),
        });
    }

    let version = buf[0];

    let mut uuid_bytes = [0u8; 16];
    uuid_bytes.copy_from_slice(&buf[1..17]);
    let uuid = Uuid::from_bytes(uuid_bytes);
    if !is_authorized(&uuid) {
        return Err(GreetingError::InvalidUser);
    }

    let opt_len = buf[17] as usize;
    let cmd_index = 18 + opt_len;
    let cmd_byte = *buf
        .get(cmd_index)
        .ok_or(GreetingError::TooShort {
            expected: cmd_index + 1,
            actual: buf.len(),
        })?;
    let command = Command::from_u8(cmd_byte).ok_or(GreetingError::UnsupportedCommand(cmd_byte))?;

    // MUX carries no port/address fields; the payload starts with the
    // first Mux frame and the address is synthesized.
    if command == Command::Mux {
        return Ok(Greeting {
            version,
            uuid,
            command,
            port: 0,
            address: Address::Domain(MUX_ADDRESS.to_string()),
            raw_data_index: cmd_index + 1,
        });
    }

    let port_index = cmd_index + 1;
    if buf.len() < port_index + 2 {
        return Err(GreetingError::TooShort {
            expected: port_index + 2,
            actual: buf.len(),
        });
    }
    let port = u16::from_be_bytes([buf[port_index], buf[port_index + 1]]);

    let (address, addr_used) = parse_address(&buf[port_index + 2..])?;

    Ok(Greeting {
        version,
        uuid,
        command,
        port,
        address,
        raw_data_index: port_index + 2 + addr_used,
    })
}

/// The two-byte server greeting, prepended once to the tunnel's first
/// server-to-client payload.
pub fn response_prefix(version: u8) -> [u8; 2] {
    [version, 0x00]
}
