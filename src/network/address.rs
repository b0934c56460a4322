//! BACnet addressing per ASHRAE 135 Clause 6.
//!
//! A [`BacnetAddress`] pairs an optional network number with a
//! variable-length MAC whose interpretation depends on the attached data
//! link: 6 bytes is an IPv4 host+port, 18 bytes an IPv6 host+port, 6 bytes
//! an Ethernet MAC, 3 bytes a Secure-Connect link VMAC, and 1-7 bytes an
//! MS/TP or proprietary station behind a router. An empty MAC combined with
//! a network number denotes a directed broadcast.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use thiserror::Error;

/// Default BACnet/IP UDP port (0xBAC0).
pub const BACNET_PORT: u16 = 47808;

/// Network number denoting a global broadcast.
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

/// Error produced when an address string cannot be parsed, carrying the
/// attempted input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("unparseable BACnet address: {0:?}")]
    Unparseable(String),
    #[error("network number {0} out of range 1-65534")]
    NetworkOutOfRange(u32),
}

/// A full BACnet address: optional network number plus MAC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BacnetAddress {
    /// `None` for the local network, 1-65534 for a specific remote network,
    /// 0xFFFF for global broadcast.
    pub network: Option<u16>,
    /// MAC on that network; empty for a broadcast.
    pub mac: Vec<u8>,
}

impl BacnetAddress {
    /// Address of a station on the local network.
    pub fn local(mac: Vec<u8>) -> Self {
        Self { network: None, mac }
    }

    /// Local broadcast: no network number, empty MAC.
    pub fn local_broadcast() -> Self {
        Self::default()
    }

    /// Global broadcast (DNET = 0xFFFF).
    pub fn global_broadcast() -> Self {
        Self {
            network: Some(GLOBAL_BROADCAST_NETWORK),
            mac: Vec::new(),
        }
    }

    /// Directed broadcast on a specific remote network.
    pub fn remote_broadcast(network: u16) -> Result<Self, AddressError> {
        Self::check_network(network)?;
        Ok(Self {
            network: Some(network),
            mac: Vec::new(),
        })
    }

    /// Unicast to a station on a remote network.
    pub fn remote_station(network: u16, mac: Vec<u8>) -> Result<Self, AddressError> {
        Self::check_network(network)?;
        Ok(Self {
            network: Some(network),
            mac,
        })
    }

    fn check_network(network: u16) -> Result<(), AddressError> {
        if network == 0 {
            return Err(AddressError::NetworkOutOfRange(network as u32));
        }
        if network == GLOBAL_BROADCAST_NETWORK {
            return Err(AddressError::NetworkOutOfRange(network as u32));
        }
        Ok(())
    }

    /// True if this address targets the local network (no DNET).
    pub fn is_local(&self) -> bool {
        self.network.is_none()
    }

    /// True for any broadcast form: global, remote, or local.
    pub fn is_broadcast(&self) -> bool {
        self.network == Some(GLOBAL_BROADCAST_NETWORK) || self.mac.is_empty()
    }

    /// True for a global broadcast (DNET = 0xFFFF).
    pub fn is_global_broadcast(&self) -> bool {
        self.network == Some(GLOBAL_BROADCAST_NETWORK)
    }

    /// True for a directed broadcast on a specific remote network.
    pub fn is_remote_broadcast(&self) -> bool {
        matches!(self.network, Some(net) if net != GLOBAL_BROADCAST_NETWORK) && self.mac.is_empty()
    }

    /// Build from an IP socket address (6-byte or 18-byte MAC).
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let mac = socket_addr_to_mac(addr);
        Self { network: None, mac }
    }

    /// Interpret the MAC as an IP socket address, when its length allows.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        mac_to_socket_addr(&self.mac)
    }
}

/// Encode an IP socket address to its BACnet MAC form.
pub fn socket_addr_to_mac(addr: SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut mac = Vec::with_capacity(6);
            mac.extend_from_slice(&v4.ip().octets());
            mac.extend_from_slice(&v4.port().to_be_bytes());
            mac
        }
        SocketAddr::V6(v6) => {
            let mut mac = Vec::with_capacity(18);
            mac.extend_from_slice(&v6.ip().octets());
            mac.extend_from_slice(&v6.port().to_be_bytes());
            mac
        }
    }
}

/// Decode a 6-byte or 18-byte BACnet MAC to an IP socket address.
pub fn mac_to_socket_addr(mac: &[u8]) -> Option<SocketAddr> {
    match mac.len() {
        6 => {
            let ip = Ipv4Addr::new(mac[0], mac[1], mac[2], mac[3]);
            let port = u16::from_be_bytes([mac[4], mac[5]]);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&mac[..16]);
            let port = u16::from_be_bytes([mac[16], mac[17]]);
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            )))
        }
        _ => None,
    }
}

impl fmt::Display for BacnetAddress {
    /// Formats round-trip through the parser: `192.168.1.5:47808`,
    /// `2:192.168.1.5:47808`, `[::1]:47808`, `aa:bb:cc:dd:ee:ff`, `*`,
    /// `2:*`, `4352:01`, and the empty string for a local broadcast.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global_broadcast() {
            return write!(f, "*");
        }
        if self.is_remote_broadcast() {
            return write!(f, "{}:*", self.network.expect("remote broadcast has network"));
        }
        if let Some(net) = self.network {
            match self.socket_addr() {
                Some(SocketAddr::V4(v4)) => return write!(f, "{}:{}", net, v4),
                Some(SocketAddr::V6(v6)) => {
                    return write!(f, "{}:[{}]:{}", net, v6.ip(), v6.port())
                }
                None => return write!(f, "{}:{}", net, hex::encode(&self.mac)),
            }
        }
        match self.socket_addr() {
            Some(SocketAddr::V4(v4)) => write!(f, "{}", v4),
            Some(SocketAddr::V6(v6)) => write!(f, "[{}]:{}", v6.ip(), v6.port()),
            None => write!(f, "{}", hex::encode(&self.mac)),
        }
    }
}

impl FromStr for BacnetAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, AddressError> {
        parse_address(s)
    }
}

fn parse_network(text: &str, input: &str) -> Result<u16, AddressError> {
    let value: u32 = text
        .parse()
        .map_err(|_| AddressError::Unparseable(input.to_string()))?;
    if value == 0 || value > 65534 {
        return Err(AddressError::NetworkOutOfRange(value));
    }
    Ok(value as u16)
}

fn is_hex_pair(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a human-readable address string.
///
/// Accepted forms:
///
/// ```text
/// 192.168.1.100            local B/IP, default port 0xBAC0
/// 192.168.1.100:47809      local B/IP, explicit port
/// 2:192.168.1.100:47809    remote network 2
/// [::1]:47808              local B/IPv6 (optional N: prefix)
/// AA:BB:CC:DD:EE:FF        local Ethernet MAC (optional N: prefix)
/// *                        global broadcast
/// 2:*                      remote broadcast on network 2
/// 4352:01                  remote station with raw hex MAC
/// ```
pub fn parse_address(input: &str) -> Result<BacnetAddress, AddressError> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(BacnetAddress::local_broadcast());
    }
    if s == "*" {
        return Ok(BacnetAddress::global_broadcast());
    }
    if let Some(prefix) = s.strip_suffix(":*") {
        let network = parse_network(prefix, input)?;
        return BacnetAddress::remote_broadcast(network);
    }

    // IPv6 bracket form, with optional network prefix.
    if let Some(open) = s.find('[') {
        let network = match &s[..open] {
            "" => None,
            prefix => {
                let prefix = prefix
                    .strip_suffix(':')
                    .ok_or_else(|| AddressError::Unparseable(input.to_string()))?;
                Some(parse_network(prefix, input)?)
            }
        };
        let close = s
            .rfind(']')
            .ok_or_else(|| AddressError::Unparseable(input.to_string()))?;
        let host: Ipv6Addr = s[open + 1..close]
            .parse()
            .map_err(|_| AddressError::Unparseable(input.to_string()))?;
        let port = match &s[close + 1..] {
            "" => BACNET_PORT,
            rest => rest
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| AddressError::Unparseable(input.to_string()))?,
        };
        let mac = socket_addr_to_mac(SocketAddr::V6(SocketAddrV6::new(host, port, 0, 0)));
        return match network {
            Some(net) => BacnetAddress::remote_station(net, mac),
            None => Ok(BacnetAddress::local(mac)),
        };
    }

    let parts: Vec<&str> = s.split(':').collect();

    // Ethernet MAC: six hex pairs, optionally preceded by a network number.
    if parts.len() == 6 && parts.iter().all(|p| is_hex_pair(p)) {
        let mac = parts
            .iter()
            .map(|p| u8::from_str_radix(p, 16).expect("hex pair checked"))
            .collect();
        return Ok(BacnetAddress::local(mac));
    }
    if parts.len() == 7
        && parts[0].chars().all(|c| c.is_ascii_digit())
        && parts[1..].iter().all(|p| is_hex_pair(p))
    {
        let network = parse_network(parts[0], input)?;
        let mac = parts[1..]
            .iter()
            .map(|p| u8::from_str_radix(p, 16).expect("hex pair checked"))
            .collect();
        return BacnetAddress::remote_station(network, mac);
    }

    // IPv4 forms.
    let (network, ip_text, port) = match parts.as_slice() {
        [ip] if ip.contains('.') => (None, *ip, BACNET_PORT),
        [ip, port] if ip.contains('.') => (
            None,
            *ip,
            port.parse()
                .map_err(|_| AddressError::Unparseable(input.to_string()))?,
        ),
        [net, ip] if ip.contains('.') => (Some(parse_network(net, input)?), *ip, BACNET_PORT),
        [net, ip, port] if ip.contains('.') => (
            Some(parse_network(net, input)?),
            *ip,
            port.parse()
                .map_err(|_| AddressError::Unparseable(input.to_string()))?,
        ),
        // Remote station with raw hex MAC (MS/TP or proprietary link).
        [net, mac_hex]
            if !mac_hex.is_empty()
                && mac_hex.len() % 2 == 0
                && mac_hex.len() <= 14
                && mac_hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            let network = parse_network(net, input)?;
            let mac = hex::decode(mac_hex).expect("hex checked");
            return BacnetAddress::remote_station(network, mac);
        }
        _ => return Err(AddressError::Unparseable(input.to_string())),
    };

    let host: Ipv4Addr = ip_text
        .parse()
        .map_err(|_| AddressError::Unparseable(input.to_string()))?;
    let mac = socket_addr_to_mac(SocketAddr::V4(SocketAddrV4::new(host, port)));
    match network {
        Some(net) => BacnetAddress::remote_station(net, mac),
        None => Ok(BacnetAddress::local(mac)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_default_port() {
        let addr: BacnetAddress = "192.168.1.100".parse().unwrap();
        assert!(addr.is_local());
        assert_eq!(addr.mac, vec![192, 168, 1, 100, 0xBA, 0xC0]);
    }

    #[test]
    fn parse_ipv4_explicit_port() {
        let addr: BacnetAddress = "10.0.0.2:47809".parse().unwrap();
        assert_eq!(
            addr.socket_addr(),
            Some("10.0.0.2:47809".parse().unwrap())
        );
    }

    #[test]
    fn parse_remote_ipv4() {
        let addr: BacnetAddress = "2:192.168.1.100:47809".parse().unwrap();
        assert_eq!(addr.network, Some(2));
        assert_eq!(addr.mac.len(), 6);
    }

    #[test]
    fn parse_ipv6_bracket_forms() {
        let addr: BacnetAddress = "[::1]:47808".parse().unwrap();
        assert_eq!(addr.mac.len(), 18);
        assert!(addr.is_local());

        let addr: BacnetAddress = "2:[fe80::1]".parse().unwrap();
        assert_eq!(addr.network, Some(2));
        assert_eq!(addr.mac[16..], [0xBA, 0xC0]);
    }

    #[test]
    fn parse_ethernet_mac() {
        let addr: BacnetAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert!(addr.is_local());
        assert_eq!(addr.mac, vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        let addr: BacnetAddress = "3:AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(addr.network, Some(3));
    }

    #[test]
    fn parse_broadcasts() {
        let addr: BacnetAddress = "*".parse().unwrap();
        assert!(addr.is_global_broadcast());
        assert!(addr.is_broadcast());

        let addr: BacnetAddress = "2:*".parse().unwrap();
        assert!(addr.is_remote_broadcast());
        assert!(!addr.is_global_broadcast());
    }

    #[test]
    fn parse_remote_hex_mac() {
        let addr: BacnetAddress = "4352:01".parse().unwrap();
        assert_eq!(addr.network, Some(4352));
        assert_eq!(addr.mac, vec![0x01]);
    }

    #[test]
    fn reject_invalid_network_numbers() {
        assert!(matches!(
            "0:10.0.0.1".parse::<BacnetAddress>(),
            Err(AddressError::NetworkOutOfRange(0))
        ));
        assert!(matches!(
            "65535:10.0.0.1".parse::<BacnetAddress>(),
            Err(AddressError::NetworkOutOfRange(65535))
        ));
    }

    #[test]
    fn reject_garbage() {
        for input in ["bogus", "1.2.3", "1.2.3.4.5", ":", "2:[::1", "zz:zz:zz:zz:zz:zz"] {
            assert!(
                parse_address(input).is_err(),
                "{input:?} should not parse"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for input in [
            "192.168.1.100:47808",
            "2:192.168.1.100:47809",
            "aa:bb:cc:dd:ee:ff",
            "*",
            "7:*",
            "4352:01",
        ] {
            let addr: BacnetAddress = input.parse().unwrap();
            let shown = addr.to_string();
            let reparsed: BacnetAddress = shown.parse().unwrap();
            assert_eq!(addr, reparsed, "{input} -> {shown}");
        }
    }

    #[test]
    fn predicates() {
        assert!(BacnetAddress::local_broadcast().is_broadcast());
        assert!(BacnetAddress::local_broadcast().is_local());
        assert!(!BacnetAddress::global_broadcast().is_local());
        let remote = BacnetAddress::remote_station(9, vec![1]).unwrap();
        assert!(!remote.is_broadcast());
        assert!(!remote.is_remote_broadcast());
    }
}
