//! BACnet Secure Connect (Annex AB)
//!
//! BACnet/SC tunnels BVLC messages over TLS-wrapped WebSocket connections.
//! This module provides the wire codec ([`bvlc`]), the per-connection state
//! machine ([`connection`]), the hub routing engine ([`hub`]), and a node
//! transport ([`transport`]) that satisfies the common [`Transport`]
//! contract.
//!
//! TLS is an injected concern: the node transport takes a
//! `tokio_tungstenite::Connector` and the hub accepts any established
//! async stream, so certificate handling stays with the caller.
//!
//! [`Transport`]: crate::datalink::Transport

pub mod bvlc;
pub mod connection;
pub mod hub;
pub mod transport;
pub mod websocket;

use std::fmt;

use rand::RngCore;

/// Length of a BACnet/SC virtual MAC address.
pub const SC_VMAC_LEN: usize = 6;

/// WebSocket subprotocol for hub connections.
pub const HUB_SUBPROTOCOL: &str = "hub.bsc.bacnet.org";

/// WebSocket subprotocol for direct connections.
pub const DIRECT_SUBPROTOCOL: &str = "dc.bsc.bacnet.org";

/// A 6-octet BACnet/SC virtual MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScVmac(pub [u8; SC_VMAC_LEN]);

impl ScVmac {
    /// The broadcast VMAC `FF:FF:FF:FF:FF:FF`.
    pub const BROADCAST: ScVmac = ScVmac([0xFF; SC_VMAC_LEN]);

    /// Generate a random VMAC. Annex AB requires bit patterns that do not
    /// collide with the broadcast address; re-rolling on the (vanishing)
    /// all-ones draw suffices.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut vmac = [0u8; SC_VMAC_LEN];
            rng.fill_bytes(&mut vmac);
            if vmac != [0xFF; SC_VMAC_LEN] && vmac != [0u8; SC_VMAC_LEN] {
                return Self(vmac);
            }
        }
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn as_bytes(&self) -> &[u8; SC_VMAC_LEN] {
        &self.0
    }
}

impl fmt::Display for ScVmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "{}", parts.join(":"))
    }
}

impl TryFrom<&[u8]> for ScVmac {
    type Error = super::DataLinkError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; SC_VMAC_LEN] = value
            .try_into()
            .map_err(|_| super::DataLinkError::InvalidFrame)?;
        Ok(Self(bytes))
    }
}

/// A 16-octet device UUID, stable across VMAC changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceUuid(pub [u8; 16]);

impl DeviceUuid {
    pub fn random() -> Self {
        let mut uuid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uuid);
        Self(uuid)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_vmac_is_never_broadcast() {
        for _ in 0..100 {
            assert!(!ScVmac::random().is_broadcast());
        }
    }

    #[test]
    fn vmac_display() {
        let vmac = ScVmac([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]);
        assert_eq!(vmac.to_string(), "de:ad:be:ef:00:01");
    }
}
