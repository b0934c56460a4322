//! BACnet/SC hub function (Annex AB.5.3).
//!
//! The hub accepts inbound connections, completes the acceptor handshake,
//! and maintains `vmac -> connection` and `uuid -> vmac` indices. Routing:
//!
//! - *Unicast*: rewrite the header so the originating VMAC is the
//!   authenticated sender, strip the destination VMAC, forward to the one
//!   target connection.
//! - *Broadcast* (no destination, or the all-ones VMAC): same originating
//!   rewrite, destination pinned to broadcast, forwarded to every peer
//!   except the source. The fan-out is two-phase: the frame is serialized
//!   once, then all peer sends are driven concurrently to minimize
//!   per-peer latency variance.
//!
//! Spoof prevention: a message whose originating VMAC does not match the
//! connection's authenticated peer VMAC is dropped and logged.
//!
//! VMAC collisions are detected against both the live connection table and
//! a pending-reservation set with a 30-second TTL, closing the
//! check/accept TOCTOU window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};

use super::bvlc::{ScFunction, ScMessage};
use super::connection::{ScConnection, ScConnectionConfig, VmacChecker};
use super::websocket;
use super::{DeviceUuid, ScVmac};
use crate::datalink::Result;

/// How long a pending VMAC reservation survives without completing the
/// handshake.
const PENDING_VMAC_TTL: Duration = Duration::from_secs(30);

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct ScHubConfig {
    pub vmac: ScVmac,
    pub uuid: DeviceUuid,
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
    /// Cap on simultaneously connected (or connecting) nodes.
    pub max_connections: usize,
}

impl Default for ScHubConfig {
    fn default() -> Self {
        Self {
            vmac: ScVmac::random(),
            uuid: DeviceUuid::random(),
            max_bvlc_length: 6000,
            max_npdu_length: 1497,
            max_connections: 128,
        }
    }
}

struct HubPeer {
    vmac: ScVmac,
    uuid: DeviceUuid,
    connection: Arc<ScConnection>,
}

/// The hub routing engine.
pub struct ScHubFunction {
    config: ScHubConfig,
    peers: Mutex<HashMap<ScVmac, Arc<HubPeer>>>,
    uuid_index: Mutex<HashMap<DeviceUuid, ScVmac>>,
    pending_vmacs: Mutex<HashMap<ScVmac, Instant>>,
}

impl ScHubFunction {
    pub fn new(config: ScHubConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            peers: Mutex::new(HashMap::new()),
            uuid_index: Mutex::new(HashMap::new()),
            pending_vmacs: Mutex::new(HashMap::new()),
        })
    }

    /// Number of connected nodes.
    pub fn connection_count(&self) -> usize {
        self.peers.lock().expect("peers lock").len()
    }

    /// VMACs of all connected nodes.
    pub fn connected_vmacs(&self) -> Vec<ScVmac> {
        self.peers.lock().expect("peers lock").keys().copied().collect()
    }

    /// Resolve a device UUID to its current VMAC.
    pub fn vmac_for_uuid(&self, uuid: &DeviceUuid) -> Option<ScVmac> {
        self.uuid_index.lock().expect("uuid lock").get(uuid).copied()
    }

    /// Drive one inbound connection to completion: websocket accept,
    /// handshake, then routing until the peer disconnects. The stream is
    /// expected to be TLS-wrapped already in production.
    pub async fn handle_incoming<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, source) = websocket::accept(stream).await?;

        // The checker records which VMAC it reserved so the reservation can
        // be released if the handshake dies between check and accept.
        let reserved: Arc<Mutex<Option<ScVmac>>> = Arc::new(Mutex::new(None));
        let checker: VmacChecker = {
            let hub = self.clone();
            let reserved = reserved.clone();
            Arc::new(move |vmac, uuid| {
                if hub.check_and_reserve(vmac, uuid) {
                    *reserved.lock().expect("reserved lock") = Some(vmac);
                    true
                } else {
                    false
                }
            })
        };

        let config = ScConnectionConfig {
            max_bvlc_length: self.config.max_bvlc_length,
            max_npdu_length: self.config.max_npdu_length,
            ..ScConnectionConfig::new(self.config.vmac, self.config.uuid)
        };

        let connection = match ScConnection::accept(config, sink, source, checker).await {
            Ok(connection) => connection,
            Err(err) => {
                if let Some(vmac) = reserved.lock().expect("reserved lock").take() {
                    self.pending_vmacs.lock().expect("pending lock").remove(&vmac);
                }
                return Err(err);
            }
        };

        let peer_info = connection.peer().expect("accept sets peer");
        let peer = Arc::new(HubPeer {
            vmac: peer_info.vmac,
            uuid: peer_info.uuid,
            connection: connection.clone(),
        });
        self.register(peer.clone());

        let hub = self.clone();
        let source_vmac = peer.vmac;
        let result = connection
            .run_with(|msg| {
                let hub = hub.clone();
                async move { hub.route(msg, source_vmac).await }
            })
            .await;

        self.unregister(&peer);
        log::info!("SC node {} disconnected", peer.vmac);
        result
    }

    /// Atomically validate a proposed (VMAC, UUID) pair and reserve the
    /// VMAC. Stale pending reservations are purged on each call.
    fn check_and_reserve(&self, vmac: ScVmac, uuid: DeviceUuid) -> bool {
        if vmac.is_broadcast() {
            return false;
        }
        let mut pending = self.pending_vmacs.lock().expect("pending lock");
        let now = Instant::now();
        pending.retain(|_, reserved_at| now.duration_since(*reserved_at) <= PENDING_VMAC_TTL);

        let peers = self.peers.lock().expect("peers lock");
        if let Some(existing) = peers.get(&vmac) {
            // The same device reconnecting is fine; a different device on
            // the same VMAC is a collision.
            if existing.uuid != uuid {
                return false;
            }
        }
        if pending.contains_key(&vmac) {
            return false;
        }
        if peers.len() + pending.len() >= self.config.max_connections {
            return false;
        }
        pending.insert(vmac, now);
        true
    }

    fn register(&self, peer: Arc<HubPeer>) {
        self.pending_vmacs.lock().expect("pending lock").remove(&peer.vmac);
        self.uuid_index
            .lock()
            .expect("uuid lock")
            .insert(peer.uuid, peer.vmac);
        let previous = self
            .peers
            .lock()
            .expect("peers lock")
            .insert(peer.vmac, peer.clone());
        if let Some(previous) = previous {
            // A reconnect displaced the old connection.
            let stale = previous.connection.clone();
            tokio::spawn(async move { stale.disconnect().await });
        }
        log::info!("SC node {} ({}) connected", peer.vmac, peer.uuid);
    }

    fn unregister(&self, peer: &Arc<HubPeer>) {
        let mut peers = self.peers.lock().expect("peers lock");
        // Only remove if this exact connection still owns the slot; a
        // reconnect may already have replaced it.
        if let Some(current) = peers.get(&peer.vmac) {
            if Arc::ptr_eq(current, peer) {
                peers.remove(&peer.vmac);
                self.uuid_index.lock().expect("uuid lock").remove(&peer.uuid);
            }
        }
        self.pending_vmacs.lock().expect("pending lock").remove(&peer.vmac);
    }

    /// Route one message from an authenticated peer.
    async fn route(&self, msg: ScMessage, source_vmac: ScVmac) {
        // Spoof prevention: the originating VMAC, when present, must match
        // the connection it arrived on.
        if let Some(claimed) = msg.originating {
            if claimed != source_vmac {
                log::warn!(
                    "dropping spoofed message from {source_vmac} claiming origin {claimed}"
                );
                return;
            }
        }

        match msg.destination {
            Some(dest) if !dest.is_broadcast() => self.unicast(msg, source_vmac, dest).await,
            _ => self.broadcast(msg, source_vmac).await,
        }
    }

    async fn unicast(&self, mut msg: ScMessage, source_vmac: ScVmac, dest: ScVmac) {
        let target = self.peers.lock().expect("peers lock").get(&dest).cloned();
        let Some(target) = target else {
            log::debug!("no route to SC node {dest}, dropping");
            return;
        };
        msg.originating = Some(source_vmac);
        msg.destination = None;
        if let Err(err) = target.connection.send_raw(msg.encode()).await {
            log::warn!("unicast to {dest} failed: {err}");
        }
    }

    async fn broadcast(&self, mut msg: ScMessage, source_vmac: ScVmac) {
        msg.originating = Some(source_vmac);
        msg.destination = Some(ScVmac::BROADCAST);
        // Phase one: serialize once and snapshot the peer set.
        let frame = msg.encode();
        let targets: Vec<Arc<HubPeer>> = self
            .peers
            .lock()
            .expect("peers lock")
            .values()
            .filter(|peer| peer.vmac != source_vmac)
            .cloned()
            .collect();
        // Phase two: drain all peers concurrently.
        let sends = targets.iter().map(|peer| {
            let frame = frame.clone();
            async move {
                if let Err(err) = peer.connection.send_raw(frame).await {
                    log::warn!("broadcast to {} failed: {err}", peer.vmac);
                }
            }
        });
        join_all(sends).await;
    }
}
