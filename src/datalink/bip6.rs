//! BACnet/IPv6 Data Link (Annex U)
//!
//! UDP transport addressed by 3-byte virtual MACs. Broadcasts use the
//! link-local multicast group `ff02::bac0`; unicasts resolve the destination
//! VMAC to an IPv6 address through an Address-Resolution exchange. Every
//! BVLL6 message carries the sender's VMAC, so the resolution cache learns
//! opportunistically from all inbound traffic.
//!
//! NPDUs addressed to a VMAC that is not yet resolved are queued; the queue
//! drains when the Address-Resolution-ACK arrives and is dropped after a
//! timeout.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::bbmd6::Bbmd6Manager;
use super::{dispatch_receive, DataLinkError, ReceiveHook, Result, Transport, MAX_NPDU_IP};
use crate::network::address::{BacnetAddress, BACNET_PORT};

/// BVLL type octet for BACnet/IPv6.
pub const BVLL_TYPE_IP6: u8 = 0x82;

/// Length of a link-layer virtual MAC.
pub const VMAC_LEN: usize = 3;

/// Default multicast group for Annex U link-local broadcasts.
pub const MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 0xBAC0);

/// How long an unresolved unicast may wait for address resolution.
pub const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER_SIZE: usize = 1600;
const MAX_PENDING_PER_VMAC: usize = 8;

/// BVLL6 function codes (Annex U.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Bvll6Function {
    Result = 0x00,
    OriginalUnicastNpdu = 0x01,
    OriginalBroadcastNpdu = 0x02,
    AddressResolution = 0x03,
    ForwardedAddressResolution = 0x04,
    AddressResolutionAck = 0x05,
    VirtualAddressResolution = 0x06,
    VirtualAddressResolutionAck = 0x07,
    ForwardedNpdu = 0x08,
    RegisterForeignDevice = 0x09,
    DeleteForeignDeviceTableEntry = 0x0A,
    SecureBvll = 0x0B,
    DistributeBroadcastToNetwork = 0x0C,
}

impl Bvll6Function {
    /// Whether this function carries a destination VMAC after the source.
    fn has_dest_vmac(&self) -> bool {
        matches!(
            self,
            Bvll6Function::Result
                | Bvll6Function::OriginalUnicastNpdu
                | Bvll6Function::AddressResolutionAck
                | Bvll6Function::VirtualAddressResolutionAck
        )
    }
}

impl TryFrom<u8> for Bvll6Function {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Bvll6Function::Result),
            0x01 => Ok(Bvll6Function::OriginalUnicastNpdu),
            0x02 => Ok(Bvll6Function::OriginalBroadcastNpdu),
            0x03 => Ok(Bvll6Function::AddressResolution),
            0x04 => Ok(Bvll6Function::ForwardedAddressResolution),
            0x05 => Ok(Bvll6Function::AddressResolutionAck),
            0x06 => Ok(Bvll6Function::VirtualAddressResolution),
            0x07 => Ok(Bvll6Function::VirtualAddressResolutionAck),
            0x08 => Ok(Bvll6Function::ForwardedNpdu),
            0x09 => Ok(Bvll6Function::RegisterForeignDevice),
            0x0A => Ok(Bvll6Function::DeleteForeignDeviceTableEntry),
            0x0B => Ok(Bvll6Function::SecureBvll),
            0x0C => Ok(Bvll6Function::DistributeBroadcastToNetwork),
            _ => Err(DataLinkError::InvalidFrame),
        }
    }
}

/// A decoded BVLL6 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bvll6Message {
    pub function: Bvll6Function,
    /// Link-layer VMAC of the sender; present in every message.
    pub source_vmac: [u8; VMAC_LEN],
    /// Destination VMAC, for the functions that carry one.
    pub dest_vmac: Option<[u8; VMAC_LEN]>,
    /// Remaining payload after the VMAC fields.
    pub data: Vec<u8>,
}

/// Encode a BVLL6 frame.
pub fn encode_bvll6(
    function: Bvll6Function,
    source_vmac: [u8; VMAC_LEN],
    dest_vmac: Option<[u8; VMAC_LEN]>,
    data: &[u8],
) -> Vec<u8> {
    let total = 4 + VMAC_LEN + dest_vmac.map_or(0, |_| VMAC_LEN) + data.len();
    let mut frame = Vec::with_capacity(total);
    frame.push(BVLL_TYPE_IP6);
    frame.push(function as u8);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&source_vmac);
    if let Some(dest) = dest_vmac {
        frame.extend_from_slice(&dest);
    }
    frame.extend_from_slice(data);
    frame
}

/// Decode a BVLL6 frame.
pub fn decode_bvll6(frame: &[u8]) -> Result<Bvll6Message> {
    if frame.len() < 4 + VMAC_LEN || frame[0] != BVLL_TYPE_IP6 {
        return Err(DataLinkError::InvalidFrame);
    }
    let function = Bvll6Function::try_from(frame[1])?;
    let length = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if length != frame.len() {
        return Err(DataLinkError::InvalidFrame);
    }
    let mut pos = 4;
    let mut source_vmac = [0u8; VMAC_LEN];
    source_vmac.copy_from_slice(&frame[pos..pos + VMAC_LEN]);
    pos += VMAC_LEN;

    let dest_vmac = if function.has_dest_vmac() {
        if frame.len() < pos + VMAC_LEN {
            return Err(DataLinkError::InvalidFrame);
        }
        let mut dest = [0u8; VMAC_LEN];
        dest.copy_from_slice(&frame[pos..pos + VMAC_LEN]);
        pos += VMAC_LEN;
        Some(dest)
    } else {
        None
    };

    Ok(Bvll6Message {
        function,
        source_vmac,
        dest_vmac,
        data: frame[pos..].to_vec(),
    })
}

/// VMAC-to-address resolution cache with TTL-based eviction.
#[derive(Debug)]
pub struct VmacCache {
    entries: HashMap<[u8; VMAC_LEN], (SocketAddrV6, Instant)>,
    ttl: Duration,
}

impl VmacCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn put(&mut self, vmac: [u8; VMAC_LEN], address: SocketAddrV6) {
        self.entries.insert(vmac, (address, Instant::now()));
    }

    pub fn get(&mut self, vmac: &[u8; VMAC_LEN]) -> Option<SocketAddrV6> {
        match self.entries.get(vmac) {
            Some((addr, seen)) if seen.elapsed() <= self.ttl => Some(*addr),
            Some(_) => {
                self.entries.remove(vmac);
                None
            }
            None => None,
        }
    }

    pub fn evict_stale(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, seen)| seen.elapsed() <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// BACnet/IPv6 transport configuration.
#[derive(Debug, Clone)]
pub struct BacnetIp6Config {
    /// Local bind address, usually `[::]:47808`.
    pub bind_address: SocketAddrV6,
    /// Multicast group joined for link broadcasts.
    pub multicast_group: Ipv6Addr,
    /// Interface index for the multicast join (0 = default).
    pub interface: u32,
    /// Explicit VMAC; random when unset.
    pub vmac: Option<[u8; VMAC_LEN]>,
    /// TTL for resolution-cache entries.
    pub vmac_ttl: Duration,
    /// Operate an IPv6 BBMD on this node.
    pub bbmd: Option<super::bbmd6::Bbmd6Config>,
}

impl Default for BacnetIp6Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, BACNET_PORT, 0, 0),
            multicast_group: MULTICAST_GROUP,
            interface: 0,
            vmac: None,
            vmac_ttl: Duration::from_secs(300),
            bbmd: None,
        }
    }
}

struct Pending {
    npdu: Vec<u8>,
    queued_at: Instant,
}

struct Ip6Inner {
    socket: Arc<UdpSocket>,
    local: SocketAddrV6,
    vmac: [u8; VMAC_LEN],
    multicast: SocketAddrV6,
    cache: Mutex<VmacCache>,
    pending: Arc<Mutex<HashMap<[u8; VMAC_LEN], Vec<Pending>>>>,
    hook: RwLock<Option<ReceiveHook>>,
    bbmd: Option<Arc<Bbmd6Manager>>,
}

/// BACnet/IPv6 data link driver.
pub struct BacnetIp6Transport {
    inner: Arc<Ip6Inner>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BacnetIp6Transport {
    /// Bind the UDP6 socket, join the multicast group, and pick a VMAC.
    pub async fn bind(config: BacnetIp6Config) -> Result<Arc<Self>> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_only_v6(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V6(config.bind_address).into())?;
        if let Err(err) = socket.join_multicast_v6(&config.multicast_group, config.interface) {
            log::warn!("failed to join multicast group {}: {err}", config.multicast_group);
        }
        let socket = UdpSocket::from_std(socket.into())?;
        let local = match socket.local_addr()? {
            SocketAddr::V6(v6) => v6,
            SocketAddr::V4(_) => return Err(DataLinkError::InvalidFrame),
        };

        let vmac = config.vmac.unwrap_or_else(|| {
            let mut vmac = [0u8; VMAC_LEN];
            rand::thread_rng().fill_bytes(&mut vmac);
            vmac
        });
        let multicast = SocketAddrV6::new(config.multicast_group, config.bind_address.port(), 0, 0);

        let socket = Arc::new(socket);
        let bbmd = config.bbmd.map(|bbmd_config| {
            let send_socket = socket.clone();
            let sender: Arc<dyn Fn(&[u8], SocketAddrV6) + Send + Sync> =
                Arc::new(move |frame, dest| {
                    if let Err(err) = send_socket.try_send_to(frame, SocketAddr::V6(dest)) {
                        log::warn!("BBMD6 send to {dest} failed: {err}");
                    }
                });
            let rebroadcast_socket = socket.clone();
            let rebroadcast: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(move |frame| {
                if let Err(err) =
                    rebroadcast_socket.try_send_to(frame, SocketAddr::V6(multicast))
                {
                    log::warn!("BBMD6 local re-broadcast failed: {err}");
                }
            });
            Arc::new(Bbmd6Manager::new(local, vmac, bbmd_config, sender, rebroadcast))
        });

        log::info!(
            "BACnet/IPv6 bound on [{}]:{}, VMAC {}",
            local.ip(),
            local.port(),
            hex::encode(vmac)
        );

        Ok(Arc::new(Self {
            inner: Arc::new(Ip6Inner {
                socket,
                local,
                vmac,
                multicast,
                cache: Mutex::new(VmacCache::new(config.vmac_ttl)),
                pending: Arc::new(Mutex::new(HashMap::new())),
                hook: RwLock::new(None),
                bbmd,
            }),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// This node's 3-byte VMAC.
    pub fn vmac(&self) -> [u8; VMAC_LEN] {
        self.inner.vmac
    }

    /// The BBMD overlay, when configured.
    pub fn bbmd(&self) -> Option<&Arc<Bbmd6Manager>> {
        self.inner.bbmd.as_ref()
    }
}

impl Ip6Inner {
    fn handle_datagram(&self, data: &[u8], source: SocketAddr) {
        let SocketAddr::V6(sender) = source else {
            return;
        };
        let msg = match decode_bvll6(data) {
            Ok(msg) => msg,
            Err(_) => {
                log::debug!("dropping malformed BVLL6 from [{}]", sender);
                return;
            }
        };

        // Every message teaches us the sender's VMAC.
        self.cache.lock().expect("cache lock").put(msg.source_vmac, sender);

        if let Some(bbmd) = &self.bbmd {
            if bbmd.handle_bvlc6(&msg, sender) {
                return;
            }
        }

        match msg.function {
            Bvll6Function::OriginalUnicastNpdu | Bvll6Function::OriginalBroadcastNpdu => {
                self.deliver(&msg.data, msg.source_vmac);
            }
            Bvll6Function::ForwardedNpdu => {
                // 18-octet originating address precedes the NPDU; the source
                // VMAC already identifies the originator on this link layer.
                if msg.data.len() < 18 {
                    log::debug!("dropping short Forwarded-NPDU from [{}]", sender);
                    return;
                }
                self.deliver(&msg.data[18..], msg.source_vmac);
            }
            Bvll6Function::AddressResolution => {
                if msg.data.len() >= VMAC_LEN && msg.data[..VMAC_LEN] == self.vmac {
                    let ack = encode_bvll6(
                        Bvll6Function::AddressResolutionAck,
                        self.vmac,
                        Some(msg.source_vmac),
                        &[],
                    );
                    let _ = self.socket.try_send_to(&ack, SocketAddr::V6(sender));
                }
            }
            Bvll6Function::AddressResolutionAck => {
                self.flush_pending(msg.source_vmac, sender);
            }
            Bvll6Function::VirtualAddressResolution => {
                let ack = encode_bvll6(
                    Bvll6Function::VirtualAddressResolutionAck,
                    self.vmac,
                    Some(msg.source_vmac),
                    &[],
                );
                let _ = self.socket.try_send_to(&ack, SocketAddr::V6(sender));
            }
            Bvll6Function::Result => {
                if msg.data.len() == 2 {
                    let code = u16::from_be_bytes([msg.data[0], msg.data[1]]);
                    if code != 0 {
                        log::warn!("BVLC6-Result {code:#06x} from [{}]", sender);
                    }
                }
            }
            Bvll6Function::ForwardedAddressResolution
            | Bvll6Function::VirtualAddressResolutionAck
            | Bvll6Function::RegisterForeignDevice
            | Bvll6Function::DeleteForeignDeviceTableEntry
            | Bvll6Function::DistributeBroadcastToNetwork
            | Bvll6Function::SecureBvll => {
                log::debug!("ignoring BVLL6 function {:?} from [{}]", msg.function, sender);
            }
        }
    }

    fn deliver(&self, npdu: &[u8], source_vmac: [u8; VMAC_LEN]) {
        let hook = self.hook.read().expect("hook lock").clone();
        if let Some(hook) = hook {
            dispatch_receive(
                &hook,
                Bytes::copy_from_slice(npdu),
                BacnetAddress::local(source_vmac.to_vec()),
            );
        }
    }

    /// Drain NPDUs parked for a freshly resolved VMAC.
    fn flush_pending(&self, vmac: [u8; VMAC_LEN], address: SocketAddrV6) {
        let drained = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(&vmac)
            .unwrap_or_default();
        for item in drained {
            let frame = encode_bvll6(
                Bvll6Function::OriginalUnicastNpdu,
                self.vmac,
                Some(vmac),
                &item.npdu,
            );
            let _ = self.socket.try_send_to(&frame, SocketAddr::V6(address));
        }
    }

    fn spawn_resolution_timeout(&self, vmac: [u8; VMAC_LEN]) {
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESOLUTION_TIMEOUT).await;
            let mut pending = pending.lock().expect("pending lock");
            if let Some(queue) = pending.get_mut(&vmac) {
                let before = queue.len();
                queue.retain(|p| p.queued_at.elapsed() < RESOLUTION_TIMEOUT);
                if queue.len() < before {
                    log::warn!(
                        "VMAC {} did not resolve, dropped {} NPDU(s)",
                        hex::encode(vmac),
                        before - queue.len()
                    );
                }
                if queue.is_empty() {
                    pending.remove(&vmac);
                }
            }
        });
    }
}

#[async_trait]
impl Transport for BacnetIp6Transport {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let receive = tokio::spawn(async move {
            let mut buffer = [0u8; RECV_BUFFER_SIZE];
            loop {
                match inner.socket.recv_from(&mut buffer).await {
                    Ok((len, source)) => inner.handle_datagram(&buffer[..len], source),
                    Err(err) => {
                        log::error!("BACnet/IPv6 receive failed: {err}");
                        break;
                    }
                }
            }
        });
        let mut tasks = self.tasks.lock().expect("task lock");
        tasks.push(receive);

        // Periodic cache hygiene.
        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                inner.cache.lock().expect("cache lock").evict_stale();
            }
        }));

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
        if dest.mac.len() != VMAC_LEN {
            return Err(DataLinkError::BadDestination(dest.clone()));
        }
        let mut vmac = [0u8; VMAC_LEN];
        vmac.copy_from_slice(&dest.mac);

        let resolved = self.inner.cache.lock().expect("cache lock").get(&vmac);
        match resolved {
            Some(address) => {
                let frame = encode_bvll6(
                    Bvll6Function::OriginalUnicastNpdu,
                    self.inner.vmac,
                    Some(vmac),
                    npdu,
                );
                self.inner.socket.send_to(&frame, SocketAddr::V6(address)).await?;
                Ok(())
            }
            None => {
                {
                    let mut pending = self.inner.pending.lock().expect("pending lock");
                    let queue = pending.entry(vmac).or_default();
                    if queue.len() >= MAX_PENDING_PER_VMAC {
                        return Err(DataLinkError::ResolutionTimeout);
                    }
                    queue.push(Pending {
                        npdu: npdu.to_vec(),
                        queued_at: Instant::now(),
                    });
                }
                let request = encode_bvll6(
                    Bvll6Function::AddressResolution,
                    self.inner.vmac,
                    None,
                    &vmac,
                );
                // The NPDU stays queued even if this send fails; the
                // timeout task cleans up either way.
                if let Err(err) = self
                    .inner
                    .socket
                    .send_to(&request, SocketAddr::V6(self.inner.multicast))
                    .await
                {
                    log::warn!("address resolution request failed: {err}");
                }
                self.inner.spawn_resolution_timeout(vmac);
                Ok(())
            }
        }
    }

    async fn send_broadcast(&self, npdu: &[u8]) -> Result<()> {
        if npdu.len() > MAX_NPDU_IP {
            return Err(DataLinkError::FrameTooLarge(npdu.len()));
        }
        let frame = encode_bvll6(
            Bvll6Function::OriginalBroadcastNpdu,
            self.inner.vmac,
            None,
            npdu,
        );
        self.inner
            .socket
            .send_to(&frame, SocketAddr::V6(self.inner.multicast))
            .await?;
        if let Some(bbmd) = &self.inner.bbmd {
            bbmd.distribute_local_broadcast(npdu);
        }
        Ok(())
    }

    fn local_address(&self) -> BacnetAddress {
        BacnetAddress::local(self.inner.vmac.to_vec())
    }

    fn max_npdu_length(&self) -> usize {
        MAX_NPDU_IP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bvll6_round_trip_with_dest() {
        let frame = encode_bvll6(
            Bvll6Function::OriginalUnicastNpdu,
            [1, 2, 3],
            Some([4, 5, 6]),
            &[0xAA, 0xBB],
        );
        let msg = decode_bvll6(&frame).unwrap();
        assert_eq!(msg.function, Bvll6Function::OriginalUnicastNpdu);
        assert_eq!(msg.source_vmac, [1, 2, 3]);
        assert_eq!(msg.dest_vmac, Some([4, 5, 6]));
        assert_eq!(msg.data, vec![0xAA, 0xBB]);
    }

    #[test]
    fn bvll6_round_trip_without_dest() {
        let frame = encode_bvll6(Bvll6Function::OriginalBroadcastNpdu, [9, 9, 9], None, &[1]);
        let msg = decode_bvll6(&frame).unwrap();
        assert_eq!(msg.dest_vmac, None);
        assert_eq!(msg.data, vec![1]);
    }

    #[test]
    fn bvll6_length_mismatch_rejected() {
        let mut frame = encode_bvll6(Bvll6Function::OriginalBroadcastNpdu, [1, 2, 3], None, &[]);
        frame.push(0);
        assert!(decode_bvll6(&frame).is_err());
    }

    #[test]
    fn vmac_cache_ttl() {
        let mut cache = VmacCache::new(Duration::from_secs(0));
        let addr = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 47808, 0, 0);
        cache.put([1, 2, 3], addr);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&[1, 2, 3]), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn transport_binds_with_random_vmac() {
        let config = BacnetIp6Config {
            bind_address: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0),
            ..Default::default()
        };
        let transport = BacnetIp6Transport::bind(config).await.unwrap();
        assert_eq!(transport.local_address().mac.len(), VMAC_LEN);
        assert_eq!(transport.max_npdu_length(), MAX_NPDU_IP);
    }

    #[tokio::test]
    async fn unresolved_unicast_queues_and_resolves() {
        let a = BacnetIp6Transport::bind(BacnetIp6Config {
            bind_address: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0),
            vmac: Some([0xA, 0xA, 0xA]),
            ..Default::default()
        })
        .await
        .unwrap();

        let dest = BacnetAddress::local(vec![0xB, 0xB, 0xB]);
        a.send_unicast(&[0x01, 0x00], &dest).await.unwrap();
        assert_eq!(a.inner.pending.lock().unwrap().len(), 1);

        // Simulate the ACK from the peer; the queue drains toward it.
        let peer = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 45000, 0, 0);
        let ack = encode_bvll6(
            Bvll6Function::AddressResolutionAck,
            [0xB, 0xB, 0xB],
            Some([0xA, 0xA, 0xA]),
            &[],
        );
        a.inner.handle_datagram(&ack, SocketAddr::V6(peer));
        assert!(a.inner.pending.lock().unwrap().is_empty());
        assert_eq!(
            a.inner.cache.lock().unwrap().get(&[0xB, 0xB, 0xB]),
            Some(peer)
        );
    }

    #[tokio::test]
    async fn address_resolution_request_is_answered() {
        let a = BacnetIp6Transport::bind(BacnetIp6Config {
            bind_address: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0),
            vmac: Some([0xC, 0xC, 0xC]),
            ..Default::default()
        })
        .await
        .unwrap();
        let b = BacnetIp6Transport::bind(BacnetIp6Config {
            bind_address: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0),
            vmac: Some([0xD, 0xD, 0xD]),
            ..Default::default()
        })
        .await
        .unwrap();
        b.start().await.unwrap();

        // a asks for b's VMAC directly (unicast instead of multicast so the
        // test does not depend on interface multicast support).
        let request = encode_bvll6(
            Bvll6Function::AddressResolution,
            a.vmac(),
            None,
            &[0xD, 0xD, 0xD],
        );
        let b_addr = SocketAddr::V6(b.inner.local);
        a.inner.socket.send_to(&request, b_addr).await.unwrap();

        // b answers with an ACK which lands in a's cache.
        let mut buffer = [0u8; 64];
        let (len, _) = tokio::time::timeout(
            Duration::from_secs(1),
            a.inner.socket.recv_from(&mut buffer),
        )
        .await
        .unwrap()
        .unwrap();
        let msg = decode_bvll6(&buffer[..len]).unwrap();
        assert_eq!(msg.function, Bvll6Function::AddressResolutionAck);
        assert_eq!(msg.source_vmac, [0xD, 0xD, 0xD]);
        assert_eq!(msg.dest_vmac, Some([0xC, 0xC, 0xC]));
        b.stop().await;
    }
}
