//! BACnet data link drivers.
//!
//! Every data link exposes the same [`Transport`] contract: async lifecycle,
//! a receive hook fed with `(npdu, source address)`, link-specific unicast
//! and broadcast sends, the link's own BACnet address, and the usable NPDU
//! length (link MTU minus framing overhead).
//!
//! Four drivers are provided:
//!
//! - [`bip`] — BACnet/IP over UDP (Annex J), with an optional [`bbmd`]
//!   overlay for broadcast management and foreign devices
//! - [`bip6`] — BACnet/IPv6 over UDP multicast with VMAC addressing
//!   (Annex U) and its [`bbmd6`] overlay
//! - [`ethernet`] — ISO 8802-3 raw-socket data link
//! - [`sc`] — BACnet Secure Connect over TLS websockets (Annex AB)
//!
//! Receive hooks are wrapped by the drivers: a panicking application hook is
//! caught and logged, never allowed to take down the socket task. Malformed
//! inbound frames are dropped with a log entry and never answered.

pub mod bbmd;
pub mod bbmd6;
pub mod bip;
pub mod bip6;
pub mod ethernet;
pub mod sc;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::network::address::BacnetAddress;

/// Result type for data link operations.
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Largest NPDU a BACnet/IP or BACnet/IPv6 link will carry
/// (1500-byte MTU minus IP/UDP/BVLL framing, per the BACnet MTU rules).
pub const MAX_NPDU_IP: usize = 1497;

/// Largest NPDU an ISO 8802-3 link will carry.
pub const MAX_NPDU_ETHERNET: usize = 1476;

/// Errors that can occur in data link operations.
#[derive(Debug, Error)]
pub enum DataLinkError {
    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame failed structural validation.
    #[error("invalid frame")]
    InvalidFrame,
    /// Frame exceeds what the link can carry.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    /// Operation requires a started transport.
    #[error("transport not started")]
    NotStarted,
    /// Destination address does not fit this link.
    #[error("destination {0} not valid for this link")]
    BadDestination(BacnetAddress),
    /// A BVLC-Result carried a non-zero result code.
    #[error("BVLC result code {0:#06x}")]
    BvlcResult(u16),
    /// VMAC address resolution did not complete in time.
    #[error("address resolution timed out")]
    ResolutionTimeout,
    /// Peer closed or reset the connection.
    #[error("connection closed")]
    ConnectionClosed,
    /// Websocket-level failure (BACnet/SC).
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// Handshake failed or was refused (BACnet/SC).
    #[error("connect refused: {0}")]
    ConnectRefused(String),
}

/// Handler invoked by a transport for every inbound NPDU.
pub type ReceiveHook = Arc<dyn Fn(Bytes, BacnetAddress) + Send + Sync>;

/// Invoke a receive hook, absorbing panics so a faulty application callback
/// cannot kill the transport's socket task.
pub(crate) fn dispatch_receive(hook: &ReceiveHook, npdu: Bytes, source: BacnetAddress) {
    let result = catch_unwind(AssertUnwindSafe(|| hook(npdu, source.clone())));
    if result.is_err() {
        log::error!("receive hook panicked; frame from {source} dropped");
    }
}

/// Common contract implemented by every data link driver.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind sockets and spawn the receive task.
    async fn start(&self) -> Result<()>;

    /// Stop the receive task and close sockets. Idempotent.
    async fn stop(&self);

    /// Register the handler for inbound `(npdu, source)` pairs. Replaces any
    /// previous hook.
    fn set_receive_hook(&self, hook: ReceiveHook);

    /// Send an NPDU to a single station on this link.
    async fn send_unicast(&self, npdu: &[u8], dest: &BacnetAddress) -> Result<()>;

    /// Send an NPDU to all stations on this link (multicast on IPv6).
    async fn send_broadcast(&self, npdu: &[u8]) -> Result<()>;

    /// This link's own BACnet address.
    fn local_address(&self) -> BacnetAddress;

    /// Largest NPDU this link can carry.
    fn max_npdu_length(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn panicking_hook_is_absorbed() {
        let hook: ReceiveHook = Arc::new(|_, _| panic!("application bug"));
        dispatch_receive(&hook, Bytes::from_static(&[1]), BacnetAddress::local_broadcast());
        // Reaching this point is the assertion.
    }

    #[test]
    fn hook_receives_frame() {
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();
        let hook: ReceiveHook = Arc::new(move |npdu, _| {
            assert_eq!(&npdu[..], &[0x01, 0x02]);
            seen2.store(true, Ordering::SeqCst);
        });
        dispatch_receive(
            &hook,
            Bytes::from_static(&[0x01, 0x02]),
            BacnetAddress::local_broadcast(),
        );
        assert!(seen.load(Ordering::SeqCst));
    }
}
