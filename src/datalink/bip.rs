//! BACnet/IP Data Link (Annex J)
//!
//! UDP transport on port 47808 (0xBAC0). Every datagram is a BVLL frame:
//! one type octet (0x81), one function octet, a two-octet big-endian total
//! length, and the payload. Broadcast management functions are routed to an
//! optional [`BbmdManager`](super::bbmd::BbmdManager) overlay before any
//! local delivery.
//!
//! The transport can also run as a foreign device: it registers with a
//! remote BBMD, re-registers ahead of the TTL, and emits local broadcasts
//! as Distribute-Broadcast-To-Network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::bbmd::{BbmdConfig, BbmdManager};
use super::{dispatch_receive, DataLinkError, ReceiveHook, Result, Transport, MAX_NPDU_IP};
use crate::network::address::{BacnetAddress, BACNET_PORT};

/// BVLL type octet for BACnet/IP.
pub const BVLL_TYPE_IP4: u8 = 0x81;

/// BVLL header size in octets.
pub const BVLL_HEADER_SIZE: usize = 4;

const RECV_BUFFER_SIZE: usize = 1600;

/// BVLL function codes (Annex J.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    Result = 0x00,
    WriteBroadcastDistributionTable = 0x01,
    ReadBroadcastDistributionTable = 0x02,
    ReadBroadcastDistributionTableAck = 0x03,
    ForwardedNpdu = 0x04,
    RegisterForeignDevice = 0x05,
    ReadForeignDeviceTable = 0x06,
    ReadForeignDeviceTableAck = 0x07,
    DeleteForeignDeviceTableEntry = 0x08,
    DistributeBroadcastToNetwork = 0x09,
    OriginalUnicastNpdu = 0x0A,
    OriginalBroadcastNpdu = 0x0B,
    SecureBvll = 0x0C,
}

impl TryFrom<u8> for BvllFunction {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(BvllFunction::Result),
            0x01 => Ok(BvllFunction::WriteBroadcastDistributionTable),
            0x02 => Ok(BvllFunction::ReadBroadcastDistributionTable),
            0x03 => Ok(BvllFunction::ReadBroadcastDistributionTableAck),
            0x04 => Ok(BvllFunction::ForwardedNpdu),
            0x05 => Ok(BvllFunction::RegisterForeignDevice),
            0x06 => Ok(BvllFunction::ReadForeignDeviceTable),
            0x07 => Ok(BvllFunction::ReadForeignDeviceTableAck),
            0x08 => Ok(BvllFunction::DeleteForeignDeviceTableEntry),
            0x09 => Ok(BvllFunction::DistributeBroadcastToNetwork),
            0x0A => Ok(BvllFunction::OriginalUnicastNpdu),
            0x0B => Ok(BvllFunction::OriginalBroadcastNpdu),
            0x0C => Ok(BvllFunction::SecureBvll),
            _ => Err(DataLinkError::InvalidFrame),
        }
    }
}

/// BVLC-Result codes (Annex J.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BvlcResultCode {
    SuccessfulCompletion = 0x0000,
    WriteBdtNak = 0x0010,
    ReadBdtNak = 0x0020,
    RegisterForeignDeviceNak = 0x0030,
    ReadFdtNak = 0x0040,
    DeleteFdtEntryNak = 0x0050,
    DistributeBroadcastToNetworkNak = 0x0060,
}

/// Encode a complete BVLL frame.
pub fn encode_bvll(function: BvllFunction, payload: &[u8]) -> Vec<u8> {
    let total = BVLL_HEADER_SIZE + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.push(BVLL_TYPE_IP4);
    frame.push(function as u8);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a BVLL frame into its function and payload. The announced length
/// must match the datagram exactly.
pub fn decode_bvll(frame: &[u8]) -> Result<(BvllFunction, &[u8])> {
    if frame.len() < BVLL_HEADER_SIZE || frame[0] != BVLL_TYPE_IP4 {
        return Err(DataLinkError::InvalidFrame);
    }
    let function = BvllFunction::try_from(frame[1])?;
    let length = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if length != frame.len() {
        return Err(DataLinkError::InvalidFrame);
    }
    Ok((function, &frame[BVLL_HEADER_SIZE..]))
}

/// Encode a BVLC-Result frame.
pub fn encode_bvlc_result(code: BvlcResultCode) -> Vec<u8> {
    encode_bvll(BvllFunction::Result, &(code as u16).to_be_bytes())
}

/// Foreign-device registration parameters.
#[derive(Debug, Clone)]
pub struct ForeignDeviceConfig {
    /// The BBMD to register with.
    pub bbmd_address: SocketAddr,
    /// Registration time-to-live in seconds.
    pub ttl: u16,
}

/// BACnet/IP transport configuration.
#[derive(Debug, Clone)]
pub struct BacnetIpConfig {
    /// Local bind address.
    pub bind_address: SocketAddr,
    /// Subnet broadcast address; discovered from the interface table when
    /// unset.
    pub broadcast_address: Option<Ipv4Addr>,
    /// Register as a foreign device with a remote BBMD.
    pub foreign_device: Option<ForeignDeviceConfig>,
    /// Operate a BBMD on this node.
    pub bbmd: Option<BbmdConfig>,
}

impl Default for BacnetIpConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, BACNET_PORT)),
            broadcast_address: None,
            foreign_device: None,
            bbmd: None,
        }
    }
}

/// Find the directed broadcast address of the interface owning `local_ip`.
fn discover_broadcast(local_ip: Ipv4Addr) -> Ipv4Addr {
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for iface in interfaces {
            if let if_addrs::IfAddr::V4(v4) = iface.addr {
                if v4.ip == local_ip || local_ip.is_unspecified() {
                    if let Some(broadcast) = v4.broadcast {
                        return broadcast;
                    }
                }
            }
        }
    }
    Ipv4Addr::BROADCAST
}

struct IpInner {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    broadcast: SocketAddr,
    hook: RwLock<Option<ReceiveHook>>,
    bbmd: Option<Arc<BbmdManager>>,
    foreign: Option<ForeignDeviceConfig>,
}

/// BACnet/IP data link driver.
pub struct BacnetIpTransport {
    inner: Arc<IpInner>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BacnetIpTransport {
    /// Bind the UDP socket and build the transport.
    pub async fn bind(config: BacnetIpConfig) -> Result<Arc<Self>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&config.bind_address.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;

        let local_ip = match local.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => return Err(DataLinkError::InvalidFrame),
        };
        let broadcast_ip = config
            .broadcast_address
            .unwrap_or_else(|| discover_broadcast(local_ip));
        let broadcast = SocketAddr::new(IpAddr::V4(broadcast_ip), local.port());

        let socket = Arc::new(socket);
        let bbmd = config.bbmd.map(|bbmd_config| {
            let send_socket = socket.clone();
            let sender: Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync> =
                Arc::new(move |frame, dest| {
                    if let Err(err) = send_socket.try_send_to(frame, dest) {
                        log::warn!("BBMD send to {dest} failed: {err}");
                    }
                });
            Arc::new(BbmdManager::new(
                match local {
                    SocketAddr::V4(v4) => v4,
                    SocketAddr::V6(_) => unreachable!("IPv4 socket"),
                },
                bbmd_config,
                sender,
            ))
        });

        Ok(Arc::new(Self {
            inner: Arc::new(IpInner {
                socket,
                local,
                broadcast,
                hook: RwLock::new(None),
                bbmd,
                foreign: config.foreign_device,
            }),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// The BBMD overlay, when configured.
    pub fn bbmd(&self) -> Option<&Arc<BbmdManager>> {
        self.inner.bbmd.as_ref()
    }

    #[cfg(test)]
    fn handle_datagram(&self, data: &[u8], source: SocketAddr) {
        self.inner.handle_datagram(data, source);
    }
}

impl IpInner {
    /// Handle one inbound datagram. Malformed frames are dropped with a log
    /// entry; they never propagate.
    fn handle_datagram(&self, data: &[u8], source: SocketAddr) {
        let (function, payload) = match decode_bvll(data) {
            Ok(decoded) => decoded,
            Err(_) => {
                log::debug!("dropping malformed BVLL frame from {source}");
                return;
            }
        };
        let source_v4 = match source {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return,
        };

        if let Some(bbmd) = &self.bbmd {
            if bbmd.handle_bvlc(function, payload, source_v4) {
                return;
            }
        }

        match function {
            BvllFunction::OriginalUnicastNpdu | BvllFunction::OriginalBroadcastNpdu => {
                self.deliver(payload, BacnetAddress::from_socket_addr(source));
            }
            BvllFunction::ForwardedNpdu => {
                // Payload begins with the 6-octet originating address.
                if payload.len() < 6 {
                    log::debug!("dropping short Forwarded-NPDU from {source}");
                    return;
                }
                let origin = BacnetAddress::local(payload[..6].to_vec());
                self.deliver(&payload[6..], origin);
            }
            BvllFunction::Result => {
                if payload.len() == 2 {
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    if code != 0 {
                        log::warn!("BVLC-Result {code:#06x} from {source}");
                    }
                }
            }
            BvllFunction::RegisterForeignDevice => {
                // No BBMD on this node: registration cannot be honored.
                let nak = encode_bvlc_result(BvlcResultCode::RegisterForeignDeviceNak);
                let _ = self.socket.try_send_to(&nak, source);
            }
            BvllFunction::DistributeBroadcastToNetwork => {
                let nak = encode_bvlc_result(BvlcResultCode::DistributeBroadcastToNetworkNak);
                let _ = self.socket.try_send_to(&nak, source);
            }
            BvllFunction::ReadBroadcastDistributionTable => {
                let nak = encode_bvlc_result(BvlcResultCode::ReadBdtNak);
                let _ = self.socket.try_send_to(&nak, source);
            }
            BvllFunction::ReadForeignDeviceTable => {
                let nak = encode_bvlc_result(BvlcResultCode::ReadFdtNak);
                let _ = self.socket.try_send_to(&nak, source);
            }
            BvllFunction::WriteBroadcastDistributionTable => {
                let nak = encode_bvlc_result(BvlcResultCode::WriteBdtNak);
                let _ = self.socket.try_send_to(&nak, source);
            }
            BvllFunction::DeleteForeignDeviceTableEntry => {
                let nak = encode_bvlc_result(BvlcResultCode::DeleteFdtEntryNak);
                let _ = self.socket.try_send_to(&nak, source);
            }
            BvllFunction::ReadBroadcastDistributionTableAck
            | BvllFunction::ReadForeignDeviceTableAck
            | BvllFunction::SecureBvll => {
                log::debug!("ignoring BVLL function {function:?} from {source}");
            }
        }
    }

    fn deliver(&self, npdu: &[u8], source: BacnetAddress) {
        let hook = self.hook.read().expect("hook lock").clone();
        if let Some(hook) = hook {
            dispatch_receive(&hook, Bytes::copy_from_slice(npdu), source);
        }
    }

    fn dest_socket_addr(dest: &BacnetAddress) -> Result<SocketAddr> {
        match dest.socket_addr() {
            Some(addr @ SocketAddr::V4(_)) => Ok(addr),
            _ => Err(DataLinkError::BadDestination(dest.clone())),
        }
    }
}

#[async_trait]
impl Transport for BacnetIpTransport {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut tasks = self.tasks.lock().expect("task lock");

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut buffer = [0u8; RECV_BUFFER_SIZE];
            loop {
                match inner.socket.recv_from(&mut buffer).await {
                    Ok((len, source)) => inner.handle_datagram(&buffer[..len], source),
                    Err(err) => {
                        log::error!("BACnet/IP receive failed: {err}");
                        break;
                    }
                }
            }
        }));

        if let Some(foreign) = self.inner.foreign.clone() {
            // Register now and re-register ahead of the TTL.
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                let interval = Duration::from_secs((u64::from(foreign.ttl) * 2 / 3).max(1));
                loop {
                    let frame =
                        encode_bvll(BvllFunction::RegisterForeignDevice, &foreign.ttl.to_be_bytes());
                    if let Err(err) = inner.socket.send_to(&frame, foreign.bbmd_address).await {
                        log::warn!("foreign device registration failed: {err}");
                    }
                    tokio::time::sleep(interval).await;
                }
            }));
        }

        if let Some(bbmd) = self.inner.bbmd.clone() {
            tasks.push(tokio::spawn(async move {
                bbmd.run_reaper().await;
            }));
        }
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
        if npdu.len() > MAX_NPDU_IP {
            return Err(DataLinkError::FrameTooLarge(npdu.len()));
        }
        let frame = encode_bvll(BvllFunction::OriginalUnicastNpdu, npdu);
        let dest = IpInner::dest_socket_addr(dest)?;
        self.inner.socket.send_to(&frame, dest).await?;
        Ok(())
    }

    async fn send_broadcast(&self, npdu: &[u8]) -> Result<()> {
        if npdu.len() > MAX_NPDU_IP {
            return Err(DataLinkError::FrameTooLarge(npdu.len()));
        }
        if let Some(foreign) = &self.inner.foreign {
            // Foreign devices reach the broadcast domain through their BBMD.
            let frame = encode_bvll(BvllFunction::DistributeBroadcastToNetwork, npdu);
            self.inner.socket.send_to(&frame, foreign.bbmd_address).await?;
            return Ok(());
        }
        let frame = encode_bvll(BvllFunction::OriginalBroadcastNpdu, npdu);
        self.inner.socket.send_to(&frame, self.inner.broadcast).await?;
        if let Some(bbmd) = &self.inner.bbmd {
            // Locally originated broadcasts fan out to peers and foreign
            // devices exactly like a received Original-Broadcast-NPDU.
            bbmd.distribute_local_broadcast(npdu);
        }
        Ok(())
    }

    fn local_address(&self) -> BacnetAddress {
        BacnetAddress::from_socket_addr(self.inner.local)
    }

    fn max_npdu_length(&self) -> usize {
        MAX_NPDU_IP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bvll_round_trip() {
        let frame = encode_bvll(BvllFunction::OriginalUnicastNpdu, &[1, 2, 3]);
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x0A);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 7);
        let (function, payload) = decode_bvll(&frame).unwrap();
        assert_eq!(function, BvllFunction::OriginalUnicastNpdu);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn bvll_length_mismatch_rejected() {
        let mut frame = encode_bvll(BvllFunction::OriginalBroadcastNpdu, &[1, 2, 3]);
        frame.push(0xFF);
        assert!(decode_bvll(&frame).is_err());
    }

    #[test]
    fn bvll_wrong_type_rejected() {
        let mut frame = encode_bvll(BvllFunction::OriginalBroadcastNpdu, &[]);
        frame[0] = 0x82;
        assert!(decode_bvll(&frame).is_err());
    }

    #[test]
    fn bvlc_result_layout() {
        let frame = encode_bvlc_result(BvlcResultCode::RegisterForeignDeviceNak);
        assert_eq!(frame, vec![0x81, 0x00, 0x00, 0x06, 0x00, 0x30]);
    }

    #[tokio::test]
    async fn transport_binds_and_reports_address() {
        let config = BacnetIpConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let transport = BacnetIpTransport::bind(config).await.unwrap();
        let local = transport.local_address();
        assert_eq!(local.mac.len(), 6);
        assert_eq!(transport.max_npdu_length(), MAX_NPDU_IP);
    }

    #[tokio::test]
    async fn unicast_between_two_transports() {
        let a = BacnetIpTransport::bind(BacnetIpConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
        let b = BacnetIpTransport::bind(BacnetIpConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        b.set_receive_hook(Arc::new(move |npdu, source| {
            let _ = tx.send((npdu.to_vec(), source));
        }));
        b.start().await.unwrap();

        a.send_unicast(&[0x01, 0x20, 0xFF], &b.local_address())
            .await
            .unwrap();

        let (npdu, source) =
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timely delivery")
                .expect("channel open");
        assert_eq!(npdu, vec![0x01, 0x20, 0xFF]);
        assert_eq!(source, a.local_address());
        b.stop().await;
    }

    #[tokio::test]
    async fn malformed_datagram_is_dropped() {
        let transport = BacnetIpTransport::bind(BacnetIpConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
        // Must not panic or produce a delivery.
        transport.handle_datagram(&[0x81], "127.0.0.1:1234".parse().unwrap());
        transport.handle_datagram(&[0xFF, 0x0A, 0x00, 0x04], "127.0.0.1:1234".parse().unwrap());
    }
}
