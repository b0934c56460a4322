//! BACnet/IPv6 Broadcast Management Device (Annex U.5).
//!
//! The IPv6 variant differs from its Annex J sibling in three ways: BDT
//! entries carry no broadcast mask (peers are always reached by unicast),
//! every BVLL6 message includes the sender's VMAC, and re-broadcast onto the
//! local link goes through the multicast group via an injected callback.

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::bip6::{encode_bvll6, Bvll6Function, Bvll6Message, VMAC_LEN};

/// Grace period added to every foreign-device TTL, as in Annex J.5.2.3.
pub const FDT6_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// BDT6 entry wire size: 16-octet IPv6 address + 2-octet port.
const BDT6_ENTRY_SIZE: usize = 18;

/// BVLC6-Result codes (Annex U.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Bvlc6ResultCode {
    SuccessfulCompletion = 0x0000,
    AddressResolutionNak = 0x0030,
    VirtualAddressResolutionNak = 0x0060,
    RegisterForeignDeviceNak = 0x0090,
    DeleteForeignDeviceNak = 0x00A0,
    DistributeBroadcastToNetworkNak = 0x00C0,
}

/// Callback used to emit raw datagrams toward a specific peer.
pub type Datagram6Sender = Arc<dyn Fn(&[u8], SocketAddrV6) + Send + Sync>;

/// Callback used to re-broadcast a raw frame on the local multicast group.
pub type LocalRebroadcast = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One IPv6 Broadcast Distribution Table entry. No mask: distribution to a
/// peer is always a unicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bdt6Entry {
    pub address: SocketAddrV6,
}

impl Bdt6Entry {
    pub fn encode(&self) -> [u8; BDT6_ENTRY_SIZE] {
        let mut out = [0u8; BDT6_ENTRY_SIZE];
        out[..16].copy_from_slice(&self.address.ip().octets());
        out[16..].copy_from_slice(&self.address.port().to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < BDT6_ENTRY_SIZE {
            return None;
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[..16]);
        let port = u16::from_be_bytes([data[16], data[17]]);
        Some(Self {
            address: SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0),
        })
    }
}

/// One IPv6 Foreign Device Table entry.
#[derive(Debug, Clone)]
pub struct Fdt6Entry {
    pub address: SocketAddrV6,
    pub vmac: [u8; VMAC_LEN],
    pub ttl: u16,
    pub expiry: Instant,
}

/// IPv6 BBMD configuration.
#[derive(Debug, Clone)]
pub struct Bbmd6Config {
    pub bdt: Vec<Bdt6Entry>,
    pub max_foreign_devices: usize,
    pub reaper_interval: Duration,
}

impl Default for Bbmd6Config {
    fn default() -> Self {
        Self {
            bdt: Vec::new(),
            max_foreign_devices: 128,
            reaper_interval: Duration::from_secs(10),
        }
    }
}

fn encode_result6(code: Bvlc6ResultCode, local_vmac: [u8; VMAC_LEN], dest_vmac: [u8; VMAC_LEN]) -> Vec<u8> {
    encode_bvll6(
        Bvll6Function::Result,
        local_vmac,
        Some(dest_vmac),
        &(code as u16).to_be_bytes(),
    )
}

fn encode_origin(address: &SocketAddrV6) -> [u8; 18] {
    let mut out = [0u8; 18];
    out[..16].copy_from_slice(&address.ip().octets());
    out[16..].copy_from_slice(&address.port().to_be_bytes());
    out
}

/// IPv6 Broadcast Management Device state machine.
pub struct Bbmd6Manager {
    local: SocketAddrV6,
    local_vmac: [u8; VMAC_LEN],
    max_foreign_devices: usize,
    reaper_interval: Duration,
    bdt: Mutex<Vec<Bdt6Entry>>,
    fdt: Mutex<HashMap<SocketAddrV6, Fdt6Entry>>,
    send: Datagram6Sender,
    rebroadcast: LocalRebroadcast,
}

impl Bbmd6Manager {
    pub fn new(
        local: SocketAddrV6,
        local_vmac: [u8; VMAC_LEN],
        config: Bbmd6Config,
        send: Datagram6Sender,
        rebroadcast: LocalRebroadcast,
    ) -> Self {
        Self {
            local,
            local_vmac,
            max_foreign_devices: config.max_foreign_devices,
            reaper_interval: config.reaper_interval,
            bdt: Mutex::new(config.bdt),
            fdt: Mutex::new(HashMap::new()),
            send,
            rebroadcast,
        }
    }

    pub fn set_bdt(&self, entries: Vec<Bdt6Entry>) {
        *self.bdt.lock().expect("bdt lock") = entries;
    }

    pub fn bdt(&self) -> Vec<Bdt6Entry> {
        self.bdt.lock().expect("bdt lock").clone()
    }

    pub fn fdt(&self) -> Vec<Fdt6Entry> {
        self.fdt.lock().expect("fdt lock").values().cloned().collect()
    }

    /// Process one BVLL6 message. Returns `true` when fully consumed.
    pub fn handle_bvlc6(&self, msg: &Bvll6Message, source: SocketAddrV6) -> bool {
        match msg.function {
            Bvll6Function::OriginalBroadcastNpdu => {
                self.forward_broadcast(&msg.data, msg.source_vmac, source, None, false);
                false
            }

            Bvll6Function::ForwardedNpdu => {
                if msg.data.len() < 18 {
                    return true;
                }
                let origin = &msg.data[..18];
                if origin == encode_origin(&self.local) {
                    // Our own forwarding echoed back.
                    return true;
                }
                // Foreign devices plus the local link; never other peers.
                let frame =
                    encode_bvll6(Bvll6Function::ForwardedNpdu, msg.source_vmac, None, &msg.data);
                for entry in self.fdt.lock().expect("fdt lock").values() {
                    if entry.address != source {
                        (self.send)(&frame, entry.address);
                    }
                }
                (self.rebroadcast)(&frame);
                false
            }

            Bvll6Function::DistributeBroadcastToNetwork => {
                let registered = self.fdt.lock().expect("fdt lock").contains_key(&source);
                if !registered {
                    log::warn!("Distribute-Broadcast from unregistered [{source}]");
                    let nak = encode_result6(
                        Bvlc6ResultCode::DistributeBroadcastToNetworkNak,
                        self.local_vmac,
                        msg.source_vmac,
                    );
                    (self.send)(&nak, source);
                    return true;
                }
                self.forward_broadcast(&msg.data, msg.source_vmac, source, Some(source), true);
                false
            }

            Bvll6Function::RegisterForeignDevice => {
                let result = self.register_foreign_device(msg, source);
                (self.send)(
                    &encode_result6(result, self.local_vmac, msg.source_vmac),
                    source,
                );
                true
            }

            Bvll6Function::DeleteForeignDeviceTableEntry => {
                let result = if msg.data.len() == 18 {
                    let target = match Bdt6Entry::decode(&msg.data) {
                        Some(entry) => entry.address,
                        None => return true,
                    };
                    if self.fdt.lock().expect("fdt lock").remove(&target).is_some() {
                        Bvlc6ResultCode::SuccessfulCompletion
                    } else {
                        Bvlc6ResultCode::DeleteForeignDeviceNak
                    }
                } else {
                    Bvlc6ResultCode::DeleteForeignDeviceNak
                };
                (self.send)(
                    &encode_result6(result, self.local_vmac, msg.source_vmac),
                    source,
                );
                true
            }

            _ => false,
        }
    }

    /// Fan a locally originated broadcast out to peers and foreign devices.
    pub fn distribute_local_broadcast(&self, npdu: &[u8]) {
        self.forward_broadcast(npdu, self.local_vmac, self.local, None, false);
    }

    fn forward_broadcast(
        &self,
        npdu: &[u8],
        source_vmac: [u8; VMAC_LEN],
        origin: SocketAddrV6,
        skip_foreign: Option<SocketAddrV6>,
        rebroadcast_locally: bool,
    ) {
        let mut payload = Vec::with_capacity(18 + npdu.len());
        payload.extend_from_slice(&encode_origin(&origin));
        payload.extend_from_slice(npdu);
        let frame = encode_bvll6(Bvll6Function::ForwardedNpdu, source_vmac, None, &payload);

        for entry in self.bdt.lock().expect("bdt lock").iter() {
            if entry.address == self.local {
                continue;
            }
            (self.send)(&frame, entry.address);
        }
        for entry in self.fdt.lock().expect("fdt lock").values() {
            if Some(entry.address) == skip_foreign {
                continue;
            }
            (self.send)(&frame, entry.address);
        }
        if rebroadcast_locally {
            (self.rebroadcast)(&frame);
        }
    }

    fn register_foreign_device(
        &self,
        msg: &Bvll6Message,
        source: SocketAddrV6,
    ) -> Bvlc6ResultCode {
        if msg.data.len() != 2 {
            return Bvlc6ResultCode::RegisterForeignDeviceNak;
        }
        let ttl = u16::from_be_bytes([msg.data[0], msg.data[1]]);
        let mut fdt = self.fdt.lock().expect("fdt lock");
        let re_registration = fdt.contains_key(&source);
        if !re_registration && fdt.len() >= self.max_foreign_devices {
            return Bvlc6ResultCode::RegisterForeignDeviceNak;
        }
        fdt.insert(
            source,
            Fdt6Entry {
                address: source,
                vmac: msg.source_vmac,
                ttl,
                expiry: Instant::now() + Duration::from_secs(u64::from(ttl)) + FDT6_GRACE_PERIOD,
            },
        );
        Bvlc6ResultCode::SuccessfulCompletion
    }

    /// Purge expired FDT entries on a fixed tick.
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
        self.fdt
            .lock()
            .expect("fdt lock")
            .retain(|_, entry| entry.expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::bip6::decode_bvll6;

    fn addr6(port: u16) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)
    }

    struct Harness {
        bbmd: Bbmd6Manager,
        sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddrV6)>>>,
        rebroadcasts: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Harness {
        fn new(config: Bbmd6Config) -> Self {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let rebroadcasts = Arc::new(Mutex::new(Vec::new()));
            let sink = sent.clone();
            let resink = rebroadcasts.clone();
            Self {
                bbmd: Bbmd6Manager::new(
                    addr6(47808),
                    [0xEE, 0xEE, 0xEE],
                    config,
                    Arc::new(move |frame: &[u8], dest| {
                        sink.lock().unwrap().push((frame.to_vec(), dest));
                    }),
                    Arc::new(move |frame: &[u8]| {
                        resink.lock().unwrap().push(frame.to_vec());
                    }),
                ),
                sent,
                rebroadcasts,
            }
        }

        fn register(&self, source: SocketAddrV6, vmac: [u8; 3], ttl: u16) {
            let msg = Bvll6Message {
                function: Bvll6Function::RegisterForeignDevice,
                source_vmac: vmac,
                dest_vmac: None,
                data: ttl.to_be_bytes().to_vec(),
            };
            assert!(self.bbmd.handle_bvlc6(&msg, source));
            let (frame, _) = self.sent.lock().unwrap().pop().unwrap();
            let reply = decode_bvll6(&frame).unwrap();
            assert_eq!(reply.data, vec![0x00, 0x00]);
        }

        fn drain(&self) -> Vec<(Vec<u8>, SocketAddrV6)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    #[test]
    fn broadcast_forwarded_to_peers_without_mask_logic() {
        let harness = Harness::new(Bbmd6Config {
            bdt: vec![
                Bdt6Entry { address: addr6(47808) }, // self
                Bdt6Entry { address: addr6(50001) },
            ],
            ..Default::default()
        });
        harness.register(addr6(50002), [0xFD, 0, 1], 60);

        let msg = Bvll6Message {
            function: Bvll6Function::OriginalBroadcastNpdu,
            source_vmac: [1, 2, 3],
            dest_vmac: None,
            data: vec![0x01, 0x00, 0xAB],
        };
        assert!(!harness.bbmd.handle_bvlc6(&msg, addr6(50009)));

        let sent = harness.drain();
        // One unicast per peer (self excluded) plus the foreign device.
        assert_eq!(sent.len(), 2);
        let forwarded = decode_bvll6(&sent[0].0).unwrap();
        assert_eq!(forwarded.function, Bvll6Function::ForwardedNpdu);
        // 18-octet originating address then the NPDU.
        assert_eq!(&forwarded.data[18..], &[0x01, 0x00, 0xAB]);
    }

    #[test]
    fn self_originated_forwarded_npdu_dropped() {
        let harness = Harness::new(Bbmd6Config::default());
        let mut data = encode_origin(&addr6(47808)).to_vec();
        data.extend_from_slice(&[0x01, 0x00]);
        let msg = Bvll6Message {
            function: Bvll6Function::ForwardedNpdu,
            source_vmac: [5, 5, 5],
            dest_vmac: None,
            data,
        };
        assert!(harness.bbmd.handle_bvlc6(&msg, addr6(50001)));
        assert!(harness.drain().is_empty());
        assert!(harness.rebroadcasts.lock().unwrap().is_empty());
    }

    #[test]
    fn forwarded_npdu_rebroadcast_locally_not_to_peers() {
        let harness = Harness::new(Bbmd6Config {
            bdt: vec![
                Bdt6Entry { address: addr6(47808) },
                Bdt6Entry { address: addr6(50001) },
            ],
            ..Default::default()
        });

        let mut data = encode_origin(&addr6(50001)).to_vec();
        data.extend_from_slice(&[0x01, 0x00]);
        let msg = Bvll6Message {
            function: Bvll6Function::ForwardedNpdu,
            source_vmac: [7, 7, 7],
            dest_vmac: None,
            data,
        };
        assert!(!harness.bbmd.handle_bvlc6(&msg, addr6(50001)));

        // No peer unicast, one local multicast re-broadcast.
        assert!(harness.drain().is_empty());
        assert_eq!(harness.rebroadcasts.lock().unwrap().len(), 1);
    }

    #[test]
    fn distribute_broadcast_requires_registration() {
        let harness = Harness::new(Bbmd6Config::default());
        let msg = Bvll6Message {
            function: Bvll6Function::DistributeBroadcastToNetwork,
            source_vmac: [9, 9, 9],
            dest_vmac: None,
            data: vec![0x01, 0x00],
        };
        assert!(harness.bbmd.handle_bvlc6(&msg, addr6(50003)));
        let sent = harness.drain();
        assert_eq!(sent.len(), 1);
        let nak = decode_bvll6(&sent[0].0).unwrap();
        assert_eq!(
            nak.data,
            (Bvlc6ResultCode::DistributeBroadcastToNetworkNak as u16)
                .to_be_bytes()
                .to_vec()
        );
    }

    #[test]
    fn fdt_cap_and_reregistration() {
        let harness = Harness::new(Bbmd6Config {
            max_foreign_devices: 1,
            ..Default::default()
        });
        harness.register(addr6(50001), [1, 1, 1], 30);

        let msg = Bvll6Message {
            function: Bvll6Function::RegisterForeignDevice,
            source_vmac: [2, 2, 2],
            dest_vmac: None,
            data: 30u16.to_be_bytes().to_vec(),
        };
        assert!(harness.bbmd.handle_bvlc6(&msg, addr6(50002)));
        let (frame, _) = harness.drain().pop().unwrap();
        let reply = decode_bvll6(&frame).unwrap();
        assert_eq!(
            reply.data,
            (Bvlc6ResultCode::RegisterForeignDeviceNak as u16)
                .to_be_bytes()
                .to_vec()
        );

        // Existing device may refresh.
        harness.register(addr6(50001), [1, 1, 1], 60);
        assert_eq!(harness.bbmd.fdt().len(), 1);
    }
}
