//! BACnet/Ethernet Data Link (ISO 8802-3, Clause 7)
//!
//! Raw Ethernet framing with the BACnet LLC header and no BVLL overhead.
//! Stations are addressed by their 6-byte IEEE MAC; broadcast uses the
//! all-ones MAC.
//!
//! # Frame Format
//!
//! ```text
//! Destination MAC (6) | Source MAC (6) | Length (2) | LLC 82 82 03 | NPDU
//! ```
//!
//! The length field counts the LLC header plus the NPDU (802.3 length
//! semantics, not an EtherType). The FCS is handled by hardware.
//!
//! Raw-socket access is platform-specific (AF_PACKET on Linux, BPF on the
//! BSDs), so the driver takes its frame I/O through the [`FrameIo`] seam;
//! the caller binds the raw socket and hands it in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use super::{dispatch_receive, DataLinkError, ReceiveHook, Result, Transport, MAX_NPDU_ETHERNET};
use crate::network::address::BacnetAddress;

/// Ethernet broadcast MAC.
pub const ETHERNET_BROADCAST: [u8; 6] = [0xFF; 6];

/// LLC header identifying BACnet: DSAP 0x82, SSAP 0x82, control 0x03 (UI).
pub const BACNET_LLC_HEADER: [u8; 3] = [0x82, 0x82, 0x03];

/// Ethernet MAC header size (dest + src + length).
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Smallest valid frame on the wire, before FCS.
pub const MIN_FRAME_SIZE: usize = 60;

/// An 802.3 frame carrying a BACnet NPDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dest_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub npdu: Vec<u8>,
}

impl EthernetFrame {
    pub fn new(dest_mac: [u8; 6], src_mac: [u8; 6], npdu: Vec<u8>) -> Self {
        Self {
            dest_mac,
            src_mac,
            npdu,
        }
    }

    pub fn broadcast(src_mac: [u8; 6], npdu: Vec<u8>) -> Self {
        Self::new(ETHERNET_BROADCAST, src_mac, npdu)
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest_mac == ETHERNET_BROADCAST
    }

    /// Encode to wire bytes, padded to the 802.3 minimum.
    pub fn encode(&self) -> Vec<u8> {
        let llc_and_npdu = BACNET_LLC_HEADER.len() + self.npdu.len();
        let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + llc_and_npdu);
        frame.extend_from_slice(&self.dest_mac);
        frame.extend_from_slice(&self.src_mac);
        frame.extend_from_slice(&(llc_and_npdu as u16).to_be_bytes());
        frame.extend_from_slice(&BACNET_LLC_HEADER);
        frame.extend_from_slice(&self.npdu);
        frame.resize(frame.len().max(MIN_FRAME_SIZE), 0);
        frame
    }

    /// Decode from wire bytes, stripping 802.3 padding via the length field.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < ETHERNET_HEADER_SIZE + BACNET_LLC_HEADER.len() {
            return Err(DataLinkError::InvalidFrame);
        }
        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&data[0..6]);
        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&data[6..12]);

        let length = u16::from_be_bytes([data[12], data[13]]) as usize;
        // 802.3 length field; values at or above 0x0600 are EtherTypes and
        // therefore not BACnet.
        if length >= 0x0600 || length < BACNET_LLC_HEADER.len() {
            return Err(DataLinkError::InvalidFrame);
        }
        if data.len() < ETHERNET_HEADER_SIZE + length {
            return Err(DataLinkError::InvalidFrame);
        }
        if data[14..17] != BACNET_LLC_HEADER {
            return Err(DataLinkError::InvalidFrame);
        }
        let npdu = data[17..ETHERNET_HEADER_SIZE + length].to_vec();
        Ok(Self {
            dest_mac,
            src_mac,
            npdu,
        })
    }
}

/// Raw frame I/O seam: the caller supplies the platform's packet socket.
#[async_trait]
pub trait FrameIo: Send + Sync {
    /// Transmit one complete Ethernet frame.
    async fn send(&self, frame: &[u8]) -> std::io::Result<()>;
    /// Receive one complete Ethernet frame.
    async fn recv(&self) -> std::io::Result<Vec<u8>>;
}

struct EthernetInner {
    local_mac: [u8; 6],
    io: Arc<dyn FrameIo>,
    hook: RwLock<Option<ReceiveHook>>,
}

impl EthernetInner {
    fn handle_frame(&self, data: &[u8]) {
        let frame = match EthernetFrame::decode(data) {
            Ok(frame) => frame,
            Err(_) => {
                log::debug!("dropping non-BACnet ethernet frame");
                return;
            }
        };
        if frame.src_mac == self.local_mac {
            return;
        }
        // Accept unicasts to us and broadcasts; a promiscuous socket may
        // hand us more.
        if frame.dest_mac != self.local_mac && !frame.is_broadcast() {
            return;
        }
        let hook = self.hook.read().expect("hook lock").clone();
        if let Some(hook) = hook {
            dispatch_receive(
                &hook,
                Bytes::from(frame.npdu),
                BacnetAddress::local(frame.src_mac.to_vec()),
            );
        }
    }
}

/// BACnet/Ethernet data link driver.
pub struct EthernetTransport {
    inner: Arc<EthernetInner>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EthernetTransport {
    /// Build over an opened packet socket for the chosen interface.
    pub fn new(local_mac: [u8; 6], io: Arc<dyn FrameIo>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(EthernetInner {
                local_mac,
                io,
                hook: RwLock::new(None),
            }),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn dest_mac(dest: &BacnetAddress) -> Result<[u8; 6]> {
        if dest.mac.len() != 6 {
            return Err(DataLinkError::BadDestination(dest.clone()));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&dest.mac);
        Ok(mac)
    }
}

#[async_trait]
impl Transport for EthernetTransport {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.tasks.lock().expect("task lock").push(tokio::spawn(async move {
            loop {
                match inner.io.recv().await {
                    Ok(frame) => inner.handle_frame(&frame),
                    Err(err) => {
                        log::error!("ethernet receive failed: {err}");
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
    }

    fn set_receive_hook(&self, hook: ReceiveHook) {
        *self.inner.hook.write().expect("hook lock") = Some(hook);
    }

    async fn send_unicast(&self, npdu: &[u8], dest: &BacnetAddress) -> Result<()> {
        if npdu.len() > MAX_NPDU_ETHERNET {
            return Err(DataLinkError::FrameTooLarge(npdu.len()));
        }
        let frame =
            EthernetFrame::new(Self::dest_mac(dest)?, self.inner.local_mac, npdu.to_vec());
        self.inner.io.send(&frame.encode()).await?;
        Ok(())
    }

    async fn send_broadcast(&self, npdu: &[u8]) -> Result<()> {
        if npdu.len() > MAX_NPDU_ETHERNET {
            return Err(DataLinkError::FrameTooLarge(npdu.len()));
        }
        let frame = EthernetFrame::broadcast(self.inner.local_mac, npdu.to_vec());
        self.inner.io.send(&frame.encode()).await?;
        Ok(())
    }

    fn local_address(&self) -> BacnetAddress {
        BacnetAddress::local(self.inner.local_mac.to_vec())
    }

    fn max_npdu_length(&self) -> usize {
        MAX_NPDU_ETHERNET
    }
}
