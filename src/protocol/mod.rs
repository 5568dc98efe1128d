//! Wire protocol: the VLESS-style greeting and the Mux.Cool frame codec.

pub mod greeting;
pub mod mux;

use std::fmt;
use std::net::Ipv4Addr;

/// Address value carried by greetings and Mux New/Keep metadata.
///
/// IPv6 keeps the raw groups so rendering stays byte-faithful to the wire:
/// eight colon-separated lowercase hex groups, never zero-compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6([u16; 8]),
}

/// Address-type discriminants on the wire.
pub mod addr_type {
    pub const IPV4: u8 = 1;
    pub const DOMAIN: u8 = 2;
    pub const IPV6: u8 = 3;
}

/// A TCP/UDP greeting whose target equals this sentinel is re-classified
/// as a Mux tunnel, exactly like an explicit MUX command byte.
pub const MUX_SENTINEL: &str = "v1.mux.cool";

/// Synthetic address assigned to tunnels opened with the MUX command.
pub const MUX_ADDRESS: &str = "mux.cool";

impl Address {
    /// True when this address names the Mux.Cool sentinel target.
    pub fn is_mux_sentinel(&self) -> bool {
        matches!(self, Address::Domain(d) if d == MUX_SENTINEL)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{ip}"),
            Address::Domain(d) => f.write_str(d),
            Address::Ipv6(groups) => {
                for (i, g) in groups.iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{g:x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Parse an address-type byte plus address value from `buf`.
///
/// Returns the address and the number of bytes consumed (including the
/// type byte). Shared by the greeting parser and the Mux metadata parser.
pub(crate) fn parse_address(buf: &[u8]) -> Result<(Address, usize), AddressError> {
    let atype = *buf.first().ok_or(AddressError::Truncated)?;
    let rest = &buf[1..];
    match atype {
        addr_type::IPV4 => {
            if rest.len() < 4 {
                return Err(AddressError::Truncated);
            }
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            Ok((Address::Ipv4(ip), 1 + 4))
        }
        addr_type::DOMAIN => {
            let len = *rest.first().ok_or(AddressError::Truncated)? as usize;
            if len == 0 {
                return Err(AddressError::Empty);
            }
            if rest.len() < 1 + len {
                return Err(AddressError::Truncated);
            }
            let domain = std::str::from_utf8(&rest[1..1 + len])
                .map_err(|_| AddressError::InvalidDomain)?
                .to_string();
            Ok((Address::Domain(domain), 1 + 1 + len))
        }
        addr_type::IPV6 => {
            if rest.len() < 16 {
                return Err(AddressError::Truncated);
            }
            let mut groups = [0u16; 8];
            for (i, g) in groups.iter_mut().enumerate() {
                *g = u16::from_be_bytes([rest[i * 2], rest[i * 2 + 1]]);
            }
            Ok((Address::Ipv6(groups), 1 + 16))
        }
        other => Err(AddressError::UnknownType(other)),
    }
}

/// Errors from decoding an address tuple.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address value truncated")]
    Truncated,
    #[error("empty address value")]
    Empty,
    #[error("domain is not valid UTF-8")]
    InvalidDomain,
    #[error("unknown address type: {0}")]
    UnknownType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_renders_dotted() {
        let (addr, used) = parse_address(&[1, 1, 2, 3, 4]).unwrap();
        assert_eq!(used, 5);
        assert_eq!(addr.to_string(), "1.2.3.4");
    }

    #[test]
    fn domain_uses_length_prefix() {
        let (addr, used) = parse_address(b"\x02\x03dnsXX").unwrap();
        assert_eq!(used, 5);
        assert_eq!(addr, Address::Domain("dns".to_string()));
    }

    #[test]
    fn domain_zero_length_is_empty() {
        assert_eq!(parse_address(&[2, 0]), Err(AddressError::Empty));
    }

    #[test]
    fn ipv6_renders_uncompressed_lowercase_groups() {
        let mut buf = vec![3u8];
        buf.extend_from_slice(&[
            0x20, 0x01, 0x0d, 0xb8, 0x00, 0x00, 0x00, 0x00, //
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
        ]);
        let (addr, used) = parse_address(&buf).unwrap();
        assert_eq!(used, 17);
        // No :: compression, no zero padding.
        assert_eq!(addr.to_string(), "2001:db8:0:0:0:0:0:1");
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(parse_address(&[9, 1, 2]), Err(AddressError::UnknownType(9)));
    }

    #[test]
    fn mux_sentinel_detection() {
        assert!(Address::Domain("v1.mux.cool".into()).is_mux_sentinel());
        assert!(!Address::Domain("example.com".into()).is_mux_sentinel());
        assert!(!Address::Ipv4(Ipv4Addr::LOCALHOST).is_mux_sentinel());
    }
}
