//! BACnet/IP Broadcast Management Device (Annex J.4-J.5).
//!
//! A BBMD extends broadcast reach across IP subnets and admits foreign
//! devices behind NAT. The [`BbmdManager`] owns the Broadcast Distribution
//! Table and Foreign Device Table and is wired into a
//! [`BacnetIpTransport`](super::bip::BacnetIpTransport), which hands it every
//! management-function frame before normal delivery.
//!
//! Forwarding rules:
//!
//! - A locally received Original-Broadcast-NPDU is wrapped in a
//!   Forwarded-NPDU and sent to every BDT peer (except this node) and every
//!   registered foreign device; the local delivery happens on the normal
//!   path.
//! - A Forwarded-NPDU from a BDT peer goes to foreign devices only, never
//!   back to other BDT peers.
//! - Distribute-Broadcast-To-Network from an unregistered sender is NAKed.
//!
//! Expiry bookkeeping uses the monotonic clock; wall-clock changes cannot
//! resurrect stale entries.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::bip::{encode_bvlc_result, encode_bvll, BvlcResultCode, BvllFunction};

/// Grace period added to every foreign-device TTL (Annex J.5.2.3).
pub const FDT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// BDT entry wire size: 6-octet B/IP address + 4-octet mask.
const BDT_ENTRY_SIZE: usize = 10;

/// FDT entry wire size: 6-octet B/IP address + 2-octet TTL + 2-octet rest.
const FDT_ENTRY_SIZE: usize = 10;

/// Callback used by the BBMD to emit raw datagrams.
pub type DatagramSender = Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync>;

/// One Broadcast Distribution Table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
    pub address: SocketAddrV4,
    pub broadcast_mask: [u8; 4],
}

impl BdtEntry {
    /// Encode to the 10-octet wire format.
    pub fn encode(&self) -> [u8; BDT_ENTRY_SIZE] {
        let mut out = [0u8; BDT_ENTRY_SIZE];
        out[..4].copy_from_slice(&self.address.ip().octets());
        out[4..6].copy_from_slice(&self.address.port().to_be_bytes());
        out[6..].copy_from_slice(&self.broadcast_mask);
        out
    }

    /// Decode from the 10-octet wire format.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < BDT_ENTRY_SIZE {
            return None;
        }
        let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
        let port = u16::from_be_bytes([data[4], data[5]]);
        let mut broadcast_mask = [0u8; 4];
        broadcast_mask.copy_from_slice(&data[6..10]);
        Some(Self {
            address: SocketAddrV4::new(ip, port),
            broadcast_mask,
        })
    }

    /// Forwarding address per J.4.5: `ip | !mask`. An all-ones mask selects
    /// the peer itself (two-hop distribution); anything else a directed
    /// broadcast on the peer's subnet (one-hop).
    pub fn forward_address(&self) -> SocketAddrV4 {
        let ip = self.address.ip().octets();
        let mask = self.broadcast_mask;
        let dest = Ipv4Addr::new(
            ip[0] | !mask[0],
            ip[1] | !mask[1],
            ip[2] | !mask[2],
            ip[3] | !mask[3],
        );
        SocketAddrV4::new(dest, self.address.port())
    }
}

/// One Foreign Device Table entry.
#[derive(Debug, Clone)]
pub struct FdtEntry {
    pub address: SocketAddrV4,
    /// TTL supplied at registration, seconds.
    pub ttl: u16,
    /// Monotonic instant at which the entry expires (TTL + grace).
    pub expiry: Instant,
}

impl FdtEntry {
    /// Seconds left before expiry, saturating at the wire maximum.
    pub fn remaining(&self) -> u16 {
        let now = Instant::now();
        if self.expiry <= now {
            return 0;
        }
        (self.expiry - now).as_secs().min(u16::MAX as u64) as u16
    }
}

/// BBMD configuration.
#[derive(Debug, Clone)]
pub struct BbmdConfig {
    /// Initial Broadcast Distribution Table; should include this node.
    pub bdt: Vec<BdtEntry>,
    /// Hard cap on foreign-device registrations.
    pub max_foreign_devices: usize,
    /// FDT reaper tick.
    pub reaper_interval: Duration,
}

impl Default for BbmdConfig {
    fn default() -> Self {
        Self {
            bdt: Vec::new(),
            max_foreign_devices: 128,
            reaper_interval: Duration::from_secs(10),
        }
    }
}

/// Broadcast Management Device state machine.
pub struct BbmdManager {
    local: SocketAddrV4,
    max_foreign_devices: usize,
    reaper_interval: Duration,
    bdt: Mutex<Vec<BdtEntry>>,
    fdt: Mutex<HashMap<SocketAddrV4, FdtEntry>>,
    send: DatagramSender,
}

impl BbmdManager {
    pub fn new(local: SocketAddrV4, config: BbmdConfig, send: DatagramSender) -> Self {
        Self {
            local,
            max_foreign_devices: config.max_foreign_devices,
            reaper_interval: config.reaper_interval,
            bdt: Mutex::new(config.bdt),
            fdt: Mutex::new(HashMap::new()),
            send,
        }
    }

    /// Replace the Broadcast Distribution Table.
    pub fn set_bdt(&self, entries: Vec<BdtEntry>) {
        let mut bdt = self.bdt.lock().expect("bdt lock");
        log::info!("BDT updated with {} entries", entries.len());
        *bdt = entries;
    }

    /// Current BDT snapshot.
    pub fn bdt(&self) -> Vec<BdtEntry> {
        self.bdt.lock().expect("bdt lock").clone()
    }

    /// Current FDT snapshot.
    pub fn fdt(&self) -> Vec<FdtEntry> {
        self.fdt.lock().expect("fdt lock").values().cloned().collect()
    }

    /// Process one BVLL management frame. Returns `true` when the frame is
    /// fully consumed, `false` when it should also flow down the normal
    /// receive path (broadcast NPDUs are both forwarded and delivered).
    pub fn handle_bvlc(&self, function: BvllFunction, payload: &[u8], source: SocketAddrV4) -> bool {
        match function {
            BvllFunction::OriginalBroadcastNpdu => {
                self.forward_broadcast(payload, source, None);
                false
            }

            BvllFunction::ForwardedNpdu => {
                if payload.len() < 6 {
                    log::debug!("short Forwarded-NPDU from {source}");
                    return true;
                }
                let origin = SocketAddrV4::new(
                    Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]),
                    u16::from_be_bytes([payload[4], payload[5]]),
                );
                if origin == self.local {
                    // Our own forwarding came back around.
                    return true;
                }
                // Forward to foreign devices only; relaying to BDT peers
                // would loop.
                let frame = encode_bvll(BvllFunction::ForwardedNpdu, payload);
                for entry in self.fdt.lock().expect("fdt lock").values() {
                    if entry.address != source {
                        (self.send)(&frame, SocketAddr::V4(entry.address));
                    }
                }
                false
            }

            BvllFunction::DistributeBroadcastToNetwork => {
                let registered = self.fdt.lock().expect("fdt lock").contains_key(&source);
                if !registered {
                    log::warn!("Distribute-Broadcast from unregistered {source}");
                    let nak = encode_bvlc_result(BvlcResultCode::DistributeBroadcastToNetworkNak);
                    (self.send)(&nak, SocketAddr::V4(source));
                    return true;
                }
                self.forward_broadcast(payload, source, Some(source));
                false
            }

            BvllFunction::RegisterForeignDevice => {
                let result = self.register_foreign_device(payload, source);
                (self.send)(&encode_bvlc_result(result), SocketAddr::V4(source));
                true
            }

            BvllFunction::ReadBroadcastDistributionTable => {
                let mut body = Vec::new();
                for entry in self.bdt.lock().expect("bdt lock").iter() {
                    body.extend_from_slice(&entry.encode());
                }
                let frame = encode_bvll(BvllFunction::ReadBroadcastDistributionTableAck, &body);
                (self.send)(&frame, SocketAddr::V4(source));
                true
            }

            BvllFunction::WriteBroadcastDistributionTable => {
                let result = if payload.len() % BDT_ENTRY_SIZE == 0 {
                    let entries: Vec<BdtEntry> = payload
                        .chunks_exact(BDT_ENTRY_SIZE)
                        .filter_map(BdtEntry::decode)
                        .collect();
                    self.set_bdt(entries);
                    BvlcResultCode::SuccessfulCompletion
                } else {
                    BvlcResultCode::WriteBdtNak
                };
                (self.send)(&encode_bvlc_result(result), SocketAddr::V4(source));
                true
            }

            BvllFunction::ReadForeignDeviceTable => {
                let mut body = Vec::new();
                for entry in self.fdt.lock().expect("fdt lock").values() {
                    body.extend_from_slice(&entry.address.ip().octets());
                    body.extend_from_slice(&entry.address.port().to_be_bytes());
                    body.extend_from_slice(&entry.ttl.to_be_bytes());
                    body.extend_from_slice(&entry.remaining().to_be_bytes());
                }
                debug_assert_eq!(body.len() % FDT_ENTRY_SIZE, 0);
                let frame = encode_bvll(BvllFunction::ReadForeignDeviceTableAck, &body);
                (self.send)(&frame, SocketAddr::V4(source));
                true
            }

            BvllFunction::DeleteForeignDeviceTableEntry => {
                let result = if payload.len() == 6 {
                    let target = SocketAddrV4::new(
                        Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]),
                        u16::from_be_bytes([payload[4], payload[5]]),
                    );
                    if self.fdt.lock().expect("fdt lock").remove(&target).is_some() {
                        BvlcResultCode::SuccessfulCompletion
                    } else {
                        BvlcResultCode::DeleteFdtEntryNak
                    }
                } else {
                    BvlcResultCode::DeleteFdtEntryNak
                };
                (self.send)(&encode_bvlc_result(result), SocketAddr::V4(source));
                true
            }

            _ => false,
        }
    }

    /// Fan a locally originated broadcast out to BDT peers and foreign
    /// devices, as if an Original-Broadcast-NPDU had been received from
    /// this node.
    pub fn distribute_local_broadcast(&self, npdu: &[u8]) {
        self.forward_broadcast(npdu, self.local, None);
    }

    /// Wrap `npdu` in a Forwarded-NPDU from `origin` and distribute it to
    /// all BDT peers except this node and all foreign devices except
    /// `skip_foreign`.
    fn forward_broadcast(&self, npdu: &[u8], origin: SocketAddrV4, skip_foreign: Option<SocketAddrV4>) {
        let mut payload = Vec::with_capacity(6 + npdu.len());
        payload.extend_from_slice(&origin.ip().octets());
        payload.extend_from_slice(&origin.port().to_be_bytes());
        payload.extend_from_slice(npdu);
        let frame = encode_bvll(BvllFunction::ForwardedNpdu, &payload);

        for entry in self.bdt.lock().expect("bdt lock").iter() {
            if entry.address == self.local {
                continue;
            }
            (self.send)(&frame, SocketAddr::V4(entry.forward_address()));
        }
        for entry in self.fdt.lock().expect("fdt lock").values() {
            if Some(entry.address) == skip_foreign {
                continue;
            }
            (self.send)(&frame, SocketAddr::V4(entry.address));
        }
    }

    fn register_foreign_device(&self, payload: &[u8], source: SocketAddrV4) -> BvlcResultCode {
        if payload.len() != 2 {
            return BvlcResultCode::RegisterForeignDeviceNak;
        }
        let ttl = u16::from_be_bytes([payload[0], payload[1]]);
        let mut fdt = self.fdt.lock().expect("fdt lock");
        let re_registration = fdt.contains_key(&source);
        if !re_registration && fdt.len() >= self.max_foreign_devices {
            log::warn!("FDT full ({} entries), rejecting {source}", fdt.len());
            return BvlcResultCode::RegisterForeignDeviceNak;
        }
        fdt.insert(
            source,
            FdtEntry {
                address: source,
                ttl,
                expiry: Instant::now() + Duration::from_secs(u64::from(ttl)) + FDT_GRACE_PERIOD,
            },
        );
        log::debug!("foreign device {source} registered, ttl {ttl}s");
        BvlcResultCode::SuccessfulCompletion
    }

    /// Purge expired FDT entries on a fixed tick. Runs until the owning
    /// task is aborted.
    pub async fn run_reaper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.reaper_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.purge_expired();
        }
    }

    /// One reaper pass.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut fdt = self.fdt.lock().expect("fdt lock");
        let before = fdt.len();
        fdt.retain(|_, entry| entry.expiry > now);
        let purged = before - fdt.len();
        if purged > 0 {
            log::debug!("purged {purged} expired foreign device(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    struct Harness {
        bbmd: BbmdManager,
        sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
    }

    impl Harness {
        fn new(config: BbmdConfig) -> Self {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let sink = sent.clone();
            let sender: DatagramSender = Arc::new(move |frame: &[u8], dest| {
                sink.lock().unwrap().push((frame.to_vec(), dest));
            });
            Self {
                bbmd: BbmdManager::new(addr("192.168.1.1:47808"), config, sender),
                sent,
            }
        }

        fn register(&self, source: SocketAddrV4, ttl: u16) {
            let handled =
                self.bbmd
                    .handle_bvlc(BvllFunction::RegisterForeignDevice, &ttl.to_be_bytes(), source);
            assert!(handled);
            let (frame, _) = self.sent.lock().unwrap().pop().unwrap();
            assert_eq!(frame, encode_bvlc_result(BvlcResultCode::SuccessfulCompletion));
        }

        fn drain(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    #[test]
    fn forward_address_computation() {
        // All-ones mask: unicast to the peer (two-hop).
        let entry = BdtEntry {
            address: addr("10.0.0.2:47808"),
            broadcast_mask: [0xFF; 4],
        };
        assert_eq!(entry.forward_address(), addr("10.0.0.2:47808"));

        // /24 mask: directed broadcast on the peer's subnet (one-hop).
        let entry = BdtEntry {
            address: addr("10.0.1.2:47808"),
            broadcast_mask: [0xFF, 0xFF, 0xFF, 0x00],
        };
        assert_eq!(entry.forward_address(), addr("10.0.1.255:47808"));
    }

    #[test]
    fn bdt_entry_wire_round_trip() {
        let entry = BdtEntry {
            address: addr("172.16.5.9:47809"),
            broadcast_mask: [0xFF, 0xFF, 0x00, 0x00],
        };
        let decoded = BdtEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn original_broadcast_forwarded_to_peers_and_foreign_devices() {
        // BDT = {self, 10.0.0.2/ff:ff:ff:ff}, FDT = {10.1.1.1}.
        let harness = Harness::new(BbmdConfig {
            bdt: vec![
                BdtEntry {
                    address: addr("192.168.1.1:47808"),
                    broadcast_mask: [0xFF; 4],
                },
                BdtEntry {
                    address: addr("10.0.0.2:47808"),
                    broadcast_mask: [0xFF; 4],
                },
            ],
            ..Default::default()
        });
        harness.register(addr("10.1.1.1:47808"), 60);

        let npdu = [0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08];
        let handled = harness.bbmd.handle_bvlc(
            BvllFunction::OriginalBroadcastNpdu,
            &npdu,
            addr("192.168.1.5:47808"),
        );
        // Local delivery also happens on the normal path.
        assert!(!handled);

        let sent = harness.drain();
        assert_eq!(sent.len(), 2);

        let expected_payload: Vec<u8> = [192, 168, 1, 5, 0xBA, 0xC0]
            .iter()
            .copied()
            .chain(npdu.iter().copied())
            .collect();
        let expected_frame = encode_bvll(BvllFunction::ForwardedNpdu, &expected_payload);
        let destinations: Vec<SocketAddr> = sent.iter().map(|(_, d)| *d).collect();
        assert!(destinations.contains(&"10.0.0.2:47808".parse().unwrap()));
        assert!(destinations.contains(&"10.1.1.1:47808".parse().unwrap()));
        for (frame, _) in sent {
            assert_eq!(frame, expected_frame);
        }
    }

    #[test]
    fn forwarded_npdu_never_returns_to_bdt_peers() {
        let harness = Harness::new(BbmdConfig {
            bdt: vec![
                BdtEntry {
                    address: addr("192.168.1.1:47808"),
                    broadcast_mask: [0xFF; 4],
                },
                BdtEntry {
                    address: addr("10.0.0.2:47808"),
                    broadcast_mask: [0xFF; 4],
                },
                BdtEntry {
                    address: addr("10.0.0.3:47808"),
                    broadcast_mask: [0xFF; 4],
                },
            ],
            ..Default::default()
        });
        harness.register(addr("10.1.1.1:47808"), 60);

        // Forwarded-NPDU from BDT peer 10.0.0.2.
        let mut payload = vec![10, 9, 8, 7, 0xBA, 0xC0];
        payload.extend_from_slice(&[0x01, 0x00, 0xAA]);
        let handled = harness.bbmd.handle_bvlc(
            BvllFunction::ForwardedNpdu,
            &payload,
            addr("10.0.0.2:47808"),
        );
        assert!(!handled);

        let sent = harness.drain();
        // Only the foreign device hears about it.
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "10.1.1.1:47808".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn self_originated_forwarded_npdu_dropped() {
        let harness = Harness::new(BbmdConfig::default());
        harness.register(addr("10.1.1.1:47808"), 60);

        let mut payload = vec![192, 168, 1, 1, 0xBA, 0xC0];
        payload.extend_from_slice(&[0x01, 0x00]);
        let handled = harness.bbmd.handle_bvlc(
            BvllFunction::ForwardedNpdu,
            &payload,
            addr("10.0.0.2:47808"),
        );
        assert!(handled);
        assert!(harness.drain().is_empty());
    }

    #[test]
    fn distribute_broadcast_requires_registration() {
        let harness = Harness::new(BbmdConfig::default());
        let handled = harness.bbmd.handle_bvlc(
            BvllFunction::DistributeBroadcastToNetwork,
            &[0x01, 0x00],
            addr("10.1.1.1:47808"),
        );
        assert!(handled);
        let sent = harness.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0,
            encode_bvlc_result(BvlcResultCode::DistributeBroadcastToNetworkNak)
        );
    }

    #[test]
    fn distribute_broadcast_skips_originating_foreign_device() {
        let harness = Harness::new(BbmdConfig::default());
        harness.register(addr("10.1.1.1:47808"), 60);
        harness.register(addr("10.1.1.2:47808"), 60);

        let handled = harness.bbmd.handle_bvlc(
            BvllFunction::DistributeBroadcastToNetwork,
            &[0x01, 0x00],
            addr("10.1.1.1:47808"),
        );
        assert!(!handled);
        let sent = harness.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "10.1.1.2:47808".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn fdt_expiry_includes_grace_period() {
        let harness = Harness::new(BbmdConfig::default());
        harness.register(addr("10.1.1.1:47808"), 60);

        let fdt = harness.bbmd.fdt();
        assert_eq!(fdt.len(), 1);
        let remaining = fdt[0].remaining();
        // TTL 60 plus the 30-second grace period.
        assert!((88..=90).contains(&remaining), "remaining {remaining}");

        // Not yet expired: the reaper must keep it.
        harness.bbmd.purge_expired();
        assert_eq!(harness.bbmd.fdt().len(), 1);
    }

    #[test]
    fn fdt_zero_ttl_entry_survives_only_grace() {
        let harness = Harness::new(BbmdConfig::default());
        harness.register(addr("10.1.1.1:47808"), 0);
        let remaining = harness.bbmd.fdt()[0].remaining();
        assert!(remaining <= 30, "remaining {remaining}");
    }

    #[test]
    fn fdt_cap_rejects_new_but_allows_reregistration() {
        let harness = Harness::new(BbmdConfig {
            max_foreign_devices: 2,
            ..Default::default()
        });
        harness.register(addr("10.1.1.1:47808"), 60);
        harness.register(addr("10.1.1.2:47808"), 60);

        // Third registration bounces.
        let handled = harness.bbmd.handle_bvlc(
            BvllFunction::RegisterForeignDevice,
            &60u16.to_be_bytes(),
            addr("10.1.1.3:47808"),
        );
        assert!(handled);
        let sent = harness.drain();
        assert_eq!(
            sent[0].0,
            encode_bvlc_result(BvlcResultCode::RegisterForeignDeviceNak)
        );

        // Re-registration of an existing entry is always admitted.
        harness.register(addr("10.1.1.2:47808"), 120);
        assert_eq!(harness.bbmd.fdt().len(), 2);
    }

    #[test]
    fn read_and_delete_fdt() {
        let harness = Harness::new(BbmdConfig::default());
        harness.register(addr("10.1.1.1:47808"), 60);

        harness
            .bbmd
            .handle_bvlc(BvllFunction::ReadForeignDeviceTable, &[], addr("10.0.0.9:47808"));
        let sent = harness.drain();
        assert_eq!(sent.len(), 1);
        let (frame, _) = &sent[0];
        assert_eq!(frame[1], BvllFunction::ReadForeignDeviceTableAck as u8);
        assert_eq!(frame.len(), 4 + 10);

        harness.bbmd.handle_bvlc(
            BvllFunction::DeleteForeignDeviceTableEntry,
            &[10, 1, 1, 1, 0xBA, 0xC0],
            addr("10.0.0.9:47808"),
        );
        let sent = harness.drain();
        assert_eq!(sent[0].0, encode_bvlc_result(BvlcResultCode::SuccessfulCompletion));
        assert!(harness.bbmd.fdt().is_empty());
    }

    #[test]
    fn read_and_write_bdt() {
        let harness = Harness::new(BbmdConfig::default());
        let entry = BdtEntry {
            address: addr("10.0.0.2:47808"),
            broadcast_mask: [0xFF; 4],
        };
        harness.bbmd.handle_bvlc(
            BvllFunction::WriteBroadcastDistributionTable,
            &entry.encode(),
            addr("10.0.0.9:47808"),
        );
        let sent = harness.drain();
        assert_eq!(sent[0].0, encode_bvlc_result(BvlcResultCode::SuccessfulCompletion));
        assert_eq!(harness.bbmd.bdt(), vec![entry]);

        harness.bbmd.handle_bvlc(
            BvllFunction::ReadBroadcastDistributionTable,
            &[],
            addr("10.0.0.9:47808"),
        );
        let sent = harness.drain();
        let expected = encode_bvll(
            BvllFunction::ReadBroadcastDistributionTableAck,
            &entry.encode(),
        );
        assert_eq!(sent[0].0, expected);
    }
}
