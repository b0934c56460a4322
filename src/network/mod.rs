//! BACnet Network Layer
//!
//! NPDU framing, routing, and the network-control messages of ASHRAE 135
//! Clause 6. The [`NetworkLayer`] sits between the application/transaction
//! layers and one or more [`Transport`] ports, wrapping outbound APDUs in
//! NPDUs, resolving routes to remote networks, and unwrapping or forwarding
//! inbound traffic.
//!
//! # NPDU
//!
//! An NPDU carries a version octet (always 1), a control octet, optional
//! destination (DNET/DLEN/DADR) and source (SNET/SLEN/SADR) specifiers, a
//! hop count when a destination is present, and either a network-layer
//! message or an APDU.
//!
//! # Routing
//!
//! Outbound resolution walks the decision tree of Clause 6.5: local unicast
//! and broadcast go straight to the port, global broadcasts carry
//! DNET 0xFFFF, and remote destinations are resolved through the router
//! cache. A miss broadcasts Who-Is-Router-To-Network and parks the NPDU
//! until an I-Am-Router-To-Network arrives or the resolution times out.
//!
//! The router cache is bounded: stale entries are evicted first, then the
//! least recently seen, so an I-Am-Router flood cannot grow memory without
//! limit.

pub mod address;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

use crate::datalink::{ReceiveHook, Transport};
use address::BacnetAddress;

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// BACnet protocol version carried in every NPDU.
pub const PROTOCOL_VERSION: u8 = 1;

/// Initial hop count for routed NPDUs.
pub const DEFAULT_HOP_COUNT: u8 = 255;

/// Decode-time cap on the network list of a single router advertisement.
pub const MAX_NETWORK_LIST: usize = 4096;

/// How long an NPDU may wait for router resolution.
pub const ROUTER_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-network cap on NPDUs queued awaiting router resolution.
const MAX_QUEUED_PER_NETWORK: usize = 16;

/// Longest MAC any BACnet data link defines (B/IPv6 host + port).
const MAX_MAC_LEN: usize = 18;

/// Errors that can occur in network layer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// NPDU failed structural validation.
    #[error("invalid NPDU: {0}")]
    InvalidNpdu(&'static str),
    /// Network message body failed validation.
    #[error("invalid network message: {0}")]
    InvalidMessage(&'static str),
    /// Advertised network list exceeds [`MAX_NETWORK_LIST`].
    #[error("network list too long: {0}")]
    NetworkListTooLong(usize),
    /// No route is known and resolution failed.
    #[error("network {0} unreachable")]
    Unreachable(u16),
    /// Too many NPDUs already parked for this network.
    #[error("resolution queue full for network {0}")]
    QueueFull(u16),
    /// The layer has no port able to carry this destination.
    #[error("no port for destination")]
    NoPort,
}

/// Network layer message types (Clause 6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkMessageType {
    WhoIsRouterToNetwork = 0x00,
    IAmRouterToNetwork = 0x01,
    ICouldBeRouterToNetwork = 0x02,
    RejectMessageToNetwork = 0x03,
    RouterBusyToNetwork = 0x04,
    RouterAvailableToNetwork = 0x05,
    InitializeRoutingTable = 0x06,
    InitializeRoutingTableAck = 0x07,
    WhatIsNetworkNumber = 0x12,
    NetworkNumberIs = 0x13,
}

impl TryFrom<u8> for NetworkMessageType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(NetworkMessageType::WhoIsRouterToNetwork),
            0x01 => Ok(NetworkMessageType::IAmRouterToNetwork),
            0x02 => Ok(NetworkMessageType::ICouldBeRouterToNetwork),
            0x03 => Ok(NetworkMessageType::RejectMessageToNetwork),
            0x04 => Ok(NetworkMessageType::RouterBusyToNetwork),
            0x05 => Ok(NetworkMessageType::RouterAvailableToNetwork),
            0x06 => Ok(NetworkMessageType::InitializeRoutingTable),
            0x07 => Ok(NetworkMessageType::InitializeRoutingTableAck),
            0x12 => Ok(NetworkMessageType::WhatIsNetworkNumber),
            0x13 => Ok(NetworkMessageType::NetworkNumberIs),
            _ => Err(NetworkError::InvalidMessage("unknown message type")),
        }
    }
}

/// One entry of an Initialize-Routing-Table exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTableEntry {
    pub network: u16,
    pub port_id: u8,
    pub port_info: Vec<u8>,
}

/// A decoded network-layer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// Ask which router reaches a network (`None` asks for all).
    WhoIsRouterToNetwork(Option<u16>),
    /// Advertise reachability of the listed networks.
    IAmRouterToNetwork(Vec<u16>),
    /// Offer to route to a network with a performance index.
    ICouldBeRouterToNetwork { network: u16, performance_index: u8 },
    /// A routed message could not be delivered.
    RejectMessageToNetwork { reason: u8, network: u16 },
    /// Router is temporarily congested for the listed networks.
    RouterBusyToNetwork(Vec<u16>),
    /// Router resumed service for the listed networks.
    RouterAvailableToNetwork(Vec<u16>),
    /// Query or replace a router's table.
    InitializeRoutingTable(Vec<RoutingTableEntry>),
    /// Routing-table response.
    InitializeRoutingTableAck(Vec<RoutingTableEntry>),
    /// Ask the local network number.
    WhatIsNetworkNumber,
    /// Announce the local network number; `configured` when administratively
    /// assigned rather than learned.
    NetworkNumberIs { network: u16, configured: bool },
}

fn decode_network_list(body: &[u8]) -> Result<Vec<u16>> {
    if body.len() % 2 != 0 {
        return Err(NetworkError::InvalidMessage("odd network list length"));
    }
    let count = body.len() / 2;
    if count > MAX_NETWORK_LIST {
        return Err(NetworkError::NetworkListTooLong(count));
    }
    Ok(body
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

fn decode_routing_table(body: &[u8]) -> Result<Vec<RoutingTableEntry>> {
    let Some((&count, mut rest)) = body.split_first() else {
        return Err(NetworkError::InvalidMessage("missing entry count"));
    };
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(NetworkError::InvalidMessage("routing entry truncated"));
        }
        let network = u16::from_be_bytes([rest[0], rest[1]]);
        let port_id = rest[2];
        let info_len = rest[3] as usize;
        if rest.len() < 4 + info_len {
            return Err(NetworkError::InvalidMessage("routing entry info truncated"));
        }
        entries.push(RoutingTableEntry {
            network,
            port_id,
            port_info: rest[4..4 + info_len].to_vec(),
        });
        rest = &rest[4 + info_len..];
    }
    Ok(entries)
}

fn encode_routing_table(buffer: &mut Vec<u8>, entries: &[RoutingTableEntry]) {
    buffer.push(entries.len() as u8);
    for entry in entries {
        buffer.extend_from_slice(&entry.network.to_be_bytes());
        buffer.push(entry.port_id);
        buffer.push(entry.port_info.len() as u8);
        buffer.extend_from_slice(&entry.port_info);
    }
}

impl NetworkMessage {
    /// Message type octet for this message.
    pub fn message_type(&self) -> NetworkMessageType {
        match self {
            NetworkMessage::WhoIsRouterToNetwork(_) => NetworkMessageType::WhoIsRouterToNetwork,
            NetworkMessage::IAmRouterToNetwork(_) => NetworkMessageType::IAmRouterToNetwork,
            NetworkMessage::ICouldBeRouterToNetwork { .. } => {
                NetworkMessageType::ICouldBeRouterToNetwork
            }
            NetworkMessage::RejectMessageToNetwork { .. } => {
                NetworkMessageType::RejectMessageToNetwork
            }
            NetworkMessage::RouterBusyToNetwork(_) => NetworkMessageType::RouterBusyToNetwork,
            NetworkMessage::RouterAvailableToNetwork(_) => {
                NetworkMessageType::RouterAvailableToNetwork
            }
            NetworkMessage::InitializeRoutingTable(_) => NetworkMessageType::InitializeRoutingTable,
            NetworkMessage::InitializeRoutingTableAck(_) => {
                NetworkMessageType::InitializeRoutingTableAck
            }
            NetworkMessage::WhatIsNetworkNumber => NetworkMessageType::WhatIsNetworkNumber,
            NetworkMessage::NetworkNumberIs { .. } => NetworkMessageType::NetworkNumberIs,
        }
    }

    /// Encode the message body (everything after the message-type octet).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            NetworkMessage::WhoIsRouterToNetwork(network) => {
                if let Some(net) = network {
                    body.extend_from_slice(&net.to_be_bytes());
                }
            }
            NetworkMessage::IAmRouterToNetwork(nets)
            | NetworkMessage::RouterBusyToNetwork(nets)
            | NetworkMessage::RouterAvailableToNetwork(nets) => {
                for net in nets {
                    body.extend_from_slice(&net.to_be_bytes());
                }
            }
            NetworkMessage::ICouldBeRouterToNetwork {
                network,
                performance_index,
            } => {
                body.extend_from_slice(&network.to_be_bytes());
                body.push(*performance_index);
            }
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                body.push(*reason);
                body.extend_from_slice(&network.to_be_bytes());
            }
            NetworkMessage::InitializeRoutingTable(entries)
            | NetworkMessage::InitializeRoutingTableAck(entries) => {
                encode_routing_table(&mut body, entries);
            }
            NetworkMessage::WhatIsNetworkNumber => {}
            NetworkMessage::NetworkNumberIs {
                network,
                configured,
            } => {
                body.extend_from_slice(&network.to_be_bytes());
                body.push(u8::from(*configured));
            }
        }
        body
    }

    /// Decode a message body for the given type octet.
    pub fn decode(message_type: u8, body: &[u8]) -> Result<Self> {
        let message_type = NetworkMessageType::try_from(message_type)?;
        match message_type {
            NetworkMessageType::WhoIsRouterToNetwork => match body.len() {
                0 => Ok(NetworkMessage::WhoIsRouterToNetwork(None)),
                2 => Ok(NetworkMessage::WhoIsRouterToNetwork(Some(
                    u16::from_be_bytes([body[0], body[1]]),
                ))),
                _ => Err(NetworkError::InvalidMessage("who-is-router body length")),
            },
            NetworkMessageType::IAmRouterToNetwork => {
                Ok(NetworkMessage::IAmRouterToNetwork(decode_network_list(body)?))
            }
            NetworkMessageType::ICouldBeRouterToNetwork => {
                if body.len() != 3 {
                    return Err(NetworkError::InvalidMessage("i-could-be-router body length"));
                }
                Ok(NetworkMessage::ICouldBeRouterToNetwork {
                    network: u16::from_be_bytes([body[0], body[1]]),
                    performance_index: body[2],
                })
            }
            NetworkMessageType::RejectMessageToNetwork => {
                if body.len() != 3 {
                    return Err(NetworkError::InvalidMessage("reject body length"));
                }
                Ok(NetworkMessage::RejectMessageToNetwork {
                    reason: body[0],
                    network: u16::from_be_bytes([body[1], body[2]]),
                })
            }
            NetworkMessageType::RouterBusyToNetwork => {
                Ok(NetworkMessage::RouterBusyToNetwork(decode_network_list(body)?))
            }
            NetworkMessageType::RouterAvailableToNetwork => Ok(
                NetworkMessage::RouterAvailableToNetwork(decode_network_list(body)?),
            ),
            NetworkMessageType::InitializeRoutingTable => Ok(
                NetworkMessage::InitializeRoutingTable(decode_routing_table(body)?),
            ),
            NetworkMessageType::InitializeRoutingTableAck => Ok(
                NetworkMessage::InitializeRoutingTableAck(decode_routing_table(body)?),
            ),
            NetworkMessageType::WhatIsNetworkNumber => Ok(NetworkMessage::WhatIsNetworkNumber),
            NetworkMessageType::NetworkNumberIs => {
                if body.len() != 3 {
                    return Err(NetworkError::InvalidMessage("network-number-is body length"));
                }
                Ok(NetworkMessage::NetworkNumberIs {
                    network: u16::from_be_bytes([body[0], body[1]]),
                    configured: body[2] != 0,
                })
            }
        }
    }
}

/// NPDU control octet flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Payload is a network-layer message rather than an APDU.
    pub network_message: bool,
    /// DNET/DLEN/DADR present.
    pub destination_present: bool,
    /// SNET/SLEN/SADR present.
    pub source_present: bool,
    /// Sender expects a reply.
    pub expecting_reply: bool,
    /// Network priority (0-3).
    pub priority: u8,
}

impl NpduControl {
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte |= self.priority & 0x03;
        byte
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: byte & 0x80 != 0,
            destination_present: byte & 0x20 != 0,
            source_present: byte & 0x08 != 0,
            expecting_reply: byte & 0x04 != 0,
            priority: byte & 0x03,
        }
    }
}

/// A network number + MAC pair as carried in NPDU routing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: u16,
    pub mac: Vec<u8>,
}

impl NetworkAddress {
    pub fn new(network: u16, mac: Vec<u8>) -> Self {
        Self { network, mac }
    }
}

/// Network Protocol Data Unit header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    pub control: NpduControl,
    pub destination: Option<NetworkAddress>,
    pub source: Option<NetworkAddress>,
    pub hop_count: Option<u8>,
    /// Present when `control.network_message` is set.
    pub message_type: Option<u8>,
}

impl Default for Npdu {
    fn default() -> Self {
        Self::new()
    }
}

impl Npdu {
    pub fn new() -> Self {
        Self {
            control: NpduControl::default(),
            destination: None,
            source: None,
            hop_count: None,
            message_type: None,
        }
    }

    /// NPDU addressed as a global broadcast (DNET 0xFFFF).
    pub fn global_broadcast() -> Self {
        Self {
            control: NpduControl {
                destination_present: true,
                ..Default::default()
            },
            destination: Some(NetworkAddress::new(0xFFFF, Vec::new())),
            source: None,
            hop_count: Some(DEFAULT_HOP_COUNT),
            message_type: None,
        }
    }

    /// NPDU wrapping a network-layer message.
    pub fn network_message(message: &NetworkMessage) -> (Self, Vec<u8>) {
        let npdu = Self {
            control: NpduControl {
                network_message: true,
                ..Default::default()
            },
            destination: None,
            source: None,
            hop_count: None,
            message_type: Some(message.message_type() as u8),
        };
        (npdu, message.encode_body())
    }

    /// Encode the NPDU header followed by `payload`.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(payload.len() + 16);
        buffer.push(PROTOCOL_VERSION);

        let mut control = self.control;
        control.destination_present = self.destination.is_some();
        control.source_present = self.source.is_some();
        control.network_message = self.message_type.is_some();
        buffer.push(control.to_byte());

        if let Some(dest) = &self.destination {
            buffer.extend_from_slice(&dest.network.to_be_bytes());
            buffer.push(dest.mac.len() as u8);
            buffer.extend_from_slice(&dest.mac);
        }
        if let Some(source) = &self.source {
            buffer.extend_from_slice(&source.network.to_be_bytes());
            buffer.push(source.mac.len() as u8);
            buffer.extend_from_slice(&source.mac);
        }
        if self.destination.is_some() {
            buffer.push(self.hop_count.unwrap_or(DEFAULT_HOP_COUNT));
        }
        if let Some(message_type) = self.message_type {
            buffer.push(message_type);
        }
        buffer.extend_from_slice(payload);
        buffer
    }

    /// Decode an NPDU header, returning it and the payload offset.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(NetworkError::InvalidNpdu("too short"));
        }
        if data[0] != PROTOCOL_VERSION {
            return Err(NetworkError::InvalidNpdu("unsupported version"));
        }
        let control = NpduControl::from_byte(data[1]);
        let mut pos = 2;

        let mut read_specifier = |data: &[u8], pos: &mut usize| -> Result<NetworkAddress> {
            if *pos + 3 > data.len() {
                return Err(NetworkError::InvalidNpdu("truncated address specifier"));
            }
            let network = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
            let len = data[*pos + 2] as usize;
            *pos += 3;
            if len > MAX_MAC_LEN {
                return Err(NetworkError::InvalidNpdu("address too long"));
            }
            if *pos + len > data.len() {
                return Err(NetworkError::InvalidNpdu("truncated address"));
            }
            let mac = data[*pos..*pos + len].to_vec();
            *pos += len;
            Ok(NetworkAddress::new(network, mac))
        };

        let destination = if control.destination_present {
            Some(read_specifier(data, &mut pos)?)
        } else {
            None
        };
        let source = if control.source_present {
            Some(read_specifier(data, &mut pos)?)
        } else {
            None
        };
        let hop_count = if destination.is_some() {
            let hop = *data
                .get(pos)
                .ok_or(NetworkError::InvalidNpdu("missing hop count"))?;
            pos += 1;
            Some(hop)
        } else {
            None
        };
        let message_type = if control.network_message {
            let mt = *data
                .get(pos)
                .ok_or(NetworkError::InvalidNpdu("missing message type"))?;
            pos += 1;
            Some(mt)
        } else {
            None
        };

        Ok((
            Self {
                control,
                destination,
                source,
                hop_count,
                message_type,
            },
            pos,
        ))
    }
}

// ---------------------------------------------------------------------------
// Router cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RouterCacheEntry {
    mac: Vec<u8>,
    last_seen: Instant,
}

/// Bounded cache of `destination network -> router MAC` learned from
/// I-Am-Router-To-Network messages.
#[derive(Debug)]
pub struct RouterCache {
    entries: HashMap<u16, RouterCacheEntry>,
    capacity: usize,
    ttl: Duration,
}

impl RouterCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Learn or refresh a route. Eviction order on overflow: expired
    /// entries first, then the least recently seen.
    pub fn insert(&mut self, network: u16, mac: Vec<u8>) {
        let now = Instant::now();
        if !self.entries.contains_key(&network) && self.entries.len() >= self.capacity {
            self.evict_one(now);
        }
        self.entries.insert(
            network,
            RouterCacheEntry {
                mac,
                last_seen: now,
            },
        );
    }

    fn evict_one(&mut self, now: Instant) {
        if let Some(&stale) = self
            .entries
            .iter()
            .find(|(_, e)| now.duration_since(e.last_seen) > self.ttl)
            .map(|(net, _)| net)
        {
            self.entries.remove(&stale);
            return;
        }
        if let Some(&oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(net, _)| net)
        {
            self.entries.remove(&oldest);
        }
    }

    /// Resolve a route, refreshing its recency. Expired entries miss.
    pub fn lookup(&mut self, network: u16) -> Option<Vec<u8>> {
        let now = Instant::now();
        let ttl = self.ttl;
        match self.entries.get_mut(&network) {
            Some(entry) if now.duration_since(entry.last_seen) <= ttl => {
                entry.last_seen = now;
                Some(entry.mac.clone())
            }
            Some(_) => {
                self.entries.remove(&network);
                None
            }
            None => None,
        }
    }

    pub fn remove(&mut self, network: u16) {
        self.entries.remove(&network);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RouterCache {
    fn default() -> Self {
        Self::new(256, Duration::from_secs(300))
    }
}

// ---------------------------------------------------------------------------
// Network layer engine
// ---------------------------------------------------------------------------

/// Handler for APDUs delivered upward: `(apdu, source, expecting_reply)`.
pub type ApduHandler = Arc<dyn Fn(Bytes, BacnetAddress, bool) + Send + Sync>;

/// One attachment point of the network layer.
pub struct NetworkPort {
    /// Router-visible port identifier.
    pub id: u8,
    /// Network number of the attached link, when known.
    pub network_number: Option<u16>,
    /// The data link driver.
    pub transport: Arc<dyn Transport>,
}

struct Queued {
    frame: Vec<u8>,
    queued_at: Instant,
}

struct NetworkInner {
    ports: Vec<NetworkPort>,
    /// Index of the port the local application speaks through.
    app_port: usize,
    cache: Mutex<RouterCache>,
    pending: Arc<Mutex<HashMap<u16, Vec<Queued>>>>,
    apdu_handler: RwLock<Option<ApduHandler>>,
}

/// The network layer engine. Owns routing state; shared with transport
/// receive hooks through an internal `Arc`.
pub struct NetworkLayer {
    inner: Arc<NetworkInner>,
}

impl NetworkLayer {
    /// Build a single-port (device) network layer.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_ports(
            vec![NetworkPort {
                id: 1,
                network_number: None,
                transport,
            }],
            0,
        )
    }

    /// Build a multi-port (router) network layer. `app_port` selects the
    /// port the local application is reachable through.
    pub fn with_ports(ports: Vec<NetworkPort>, app_port: usize) -> Self {
        assert!(app_port < ports.len(), "application port out of range");
        Self {
            inner: Arc::new(NetworkInner {
                ports,
                app_port,
                cache: Mutex::new(RouterCache::default()),
                pending: Arc::new(Mutex::new(HashMap::new())),
                apdu_handler: RwLock::new(None),
            }),
        }
    }

    /// Register the upward APDU handler and hook every port's receive path.
    pub fn attach(&self) {
        for (index, port) in self.inner.ports.iter().enumerate() {
            let weak = Arc::downgrade(&self.inner);
            let hook: ReceiveHook = Arc::new(move |frame, source| {
                if let Some(inner) = Weak::upgrade(&weak) {
                    inner.handle_frame(index, &frame, source);
                }
            });
            port.transport.set_receive_hook(hook);
        }
    }

    /// Set the handler invoked for every APDU addressed to this node.
    pub fn set_apdu_handler(&self, handler: ApduHandler) {
        *self.inner.apdu_handler.write().expect("handler lock") = Some(handler);
    }

    /// Largest APDU the application port can carry.
    pub fn max_apdu_length(&self) -> usize {
        // NPDU overhead: version + control + worst-case routing fields.
        self.inner.ports[self.inner.app_port]
            .transport
            .max_npdu_length()
            .saturating_sub(25)
    }

    /// The application port's own address.
    pub fn local_address(&self) -> BacnetAddress {
        self.inner.ports[self.inner.app_port].transport.local_address()
    }

    /// Wrap an APDU in an NPDU and send it toward `dest` (Clause 6.5
    /// decision tree).
    pub async fn send_apdu(
        &self,
        apdu: &[u8],
        dest: &BacnetAddress,
        expecting_reply: bool,
        priority: u8,
    ) -> crate::datalink::Result<()> {
        self.inner.send_apdu(apdu, dest, expecting_reply, priority).await
    }

    /// Broadcast a network-layer message on the application port.
    pub async fn broadcast_message(
        &self,
        message: &NetworkMessage,
    ) -> crate::datalink::Result<()> {
        let (npdu, body) = Npdu::network_message(message);
        let frame = npdu.encode(&body);
        self.inner.ports[self.inner.app_port]
            .transport
            .send_broadcast(&frame)
            .await
    }

    /// Current router-cache size (diagnostics).
    pub fn router_cache_len(&self) -> usize {
        self.inner.cache.lock().expect("cache lock").len()
    }

    #[cfg(test)]
    fn test_learn_route(&self, network: u16, mac: Vec<u8>) {
        self.inner.cache.lock().expect("cache lock").insert(network, mac);
    }
}

impl NetworkInner {
    async fn send_apdu(
        &self,
        apdu: &[u8],
        dest: &BacnetAddress,
        expecting_reply: bool,
        priority: u8,
    ) -> crate::datalink::Result<()> {
        let transport = &self.ports[self.app_port].transport;
        let mut npdu = Npdu::new();
        npdu.control.expecting_reply = expecting_reply;
        npdu.control.priority = priority & 0x03;

        match dest.network {
            // Local unicast.
            None if !dest.mac.is_empty() => {
                let frame = npdu.encode(apdu);
                transport.send_unicast(&frame, dest).await
            }
            // Local broadcast.
            None => {
                let frame = npdu.encode(apdu);
                transport.send_broadcast(&frame).await
            }
            // Global broadcast.
            Some(0xFFFF) => {
                npdu.destination = Some(NetworkAddress::new(0xFFFF, Vec::new()));
                npdu.hop_count = Some(DEFAULT_HOP_COUNT);
                let frame = npdu.encode(apdu);
                transport.send_broadcast(&frame).await
            }
            // Remote unicast or directed broadcast.
            Some(network) => {
                npdu.destination = Some(NetworkAddress::new(network, dest.mac.clone()));
                npdu.hop_count = Some(DEFAULT_HOP_COUNT);
                let frame = npdu.encode(apdu);

                // A directly attached port short-circuits the router cache.
                if let Some(port) = self
                    .ports
                    .iter()
                    .find(|p| p.network_number == Some(network))
                {
                    let plain = Npdu {
                        control: NpduControl {
                            expecting_reply,
                            priority: priority & 0x03,
                            ..Default::default()
                        },
                        ..Npdu::new()
                    }
                    .encode(apdu);
                    return if dest.mac.is_empty() {
                        port.transport.send_broadcast(&plain).await
                    } else {
                        port.transport
                            .send_unicast(&plain, &BacnetAddress::local(dest.mac.clone()))
                            .await
                    };
                }

                let router = self.cache.lock().expect("cache lock").lookup(network);
                match router {
                    Some(mac) => {
                        transport
                            .send_unicast(&frame, &BacnetAddress::local(mac))
                            .await
                    }
                    None => {
                        self.queue_for_resolution(network, frame)?;
                        let (who_is, body) =
                            Npdu::network_message(&NetworkMessage::WhoIsRouterToNetwork(Some(
                                network,
                            )));
                        transport.send_broadcast(&who_is.encode(&body)).await?;
                        self.spawn_resolution_timeout(network);
                        Ok(())
                    }
                }
            }
        }
    }

    fn queue_for_resolution(
        &self,
        network: u16,
        frame: Vec<u8>,
    ) -> crate::datalink::Result<()> {
        let mut pending = self.pending.lock().expect("pending lock");
        let queue = pending.entry(network).or_default();
        if queue.len() >= MAX_QUEUED_PER_NETWORK {
            log::warn!("resolution queue full for network {network}, dropping NPDU");
            return Err(crate::datalink::DataLinkError::ResolutionTimeout);
        }
        queue.push(Queued {
            frame,
            queued_at: Instant::now(),
        });
        Ok(())
    }

    fn spawn_resolution_timeout(&self, network: u16) {
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ROUTER_RESOLUTION_TIMEOUT).await;
            let mut pending = pending.lock().expect("pending lock");
            if let Some(queue) = pending.get_mut(&network) {
                let before = queue.len();
                queue.retain(|q| q.queued_at.elapsed() < ROUTER_RESOLUTION_TIMEOUT);
                let dropped = before - queue.len();
                if dropped > 0 {
                    log::warn!(
                        "router to network {network} not found, dropped {dropped} queued NPDU(s)"
                    );
                }
                if queue.is_empty() {
                    pending.remove(&network);
                }
            }
        });
    }

    /// Entry point for frames arriving on `port_index`.
    fn handle_frame(&self, port_index: usize, frame: &[u8], source: BacnetAddress) {
        let (npdu, payload_at) = match Npdu::decode(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::debug!("dropping malformed NPDU from {source}: {err}");
                return;
            }
        };
        let payload = &frame[payload_at..];

        if let Some(message_type) = npdu.message_type {
            match NetworkMessage::decode(message_type, payload) {
                Ok(message) => self.handle_network_message(port_index, &npdu, message, source),
                Err(err) => log::debug!("dropping network message from {source}: {err}"),
            }
            return;
        }

        match &npdu.destination {
            None => self.deliver_apdu(&npdu, payload, source),
            Some(dest) if dest.network == 0xFFFF => {
                // Global broadcast: deliver locally; a router also floods it
                // out its other ports.
                self.deliver_apdu(&npdu, payload, source.clone());
                self.forward_broadcast(port_index, &npdu, payload, source);
            }
            Some(dest)
                if self.ports[port_index].network_number == Some(dest.network)
                    || self.ports.len() == 1 =>
            {
                // Addressed to our network: strip routing fields, deliver.
                self.deliver_apdu(&npdu, payload, source)
            }
            Some(dest) => self.forward_routed(port_index, &npdu, dest.clone(), payload, source),
        }
    }

    /// Deliver an APDU to the registered handler, mapping SNET/SADR back to
    /// a full BACnet address.
    fn deliver_apdu(&self, npdu: &Npdu, apdu: &[u8], link_source: BacnetAddress) {
        let source = match &npdu.source {
            Some(src) => BacnetAddress {
                network: Some(src.network),
                mac: src.mac.clone(),
            },
            None => link_source,
        };
        let handler = self.apdu_handler.read().expect("handler lock").clone();
        if let Some(handler) = handler {
            handler(
                Bytes::copy_from_slice(apdu),
                source,
                npdu.control.expecting_reply,
            );
        }
    }

    /// Flood a global broadcast out every port except the arrival port.
    fn forward_broadcast(
        &self,
        port_index: usize,
        npdu: &Npdu,
        payload: &[u8],
        source: BacnetAddress,
    ) {
        if self.ports.len() < 2 {
            return;
        }
        let Some(hop) = npdu.hop_count else { return };
        if hop == 0 {
            return;
        }
        let mut forwarded = npdu.clone();
        forwarded.hop_count = Some(hop - 1);
        if forwarded.source.is_none() {
            if let Some(net) = self.ports[port_index].network_number {
                forwarded.source = Some(NetworkAddress::new(net, source.mac.clone()));
            }
        }
        let frame = forwarded.encode(payload);
        for (index, port) in self.ports.iter().enumerate() {
            if index == port_index {
                continue;
            }
            let transport = port.transport.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.send_broadcast(&frame).await {
                    log::warn!("broadcast forward failed: {err}");
                }
            });
        }
    }

    /// Forward a routed NPDU toward a foreign DNET, or reject it.
    fn forward_routed(
        &self,
        port_index: usize,
        npdu: &Npdu,
        dest: NetworkAddress,
        payload: &[u8],
        source: BacnetAddress,
    ) {
        if self.ports.len() < 2 {
            // Not a router: a mis-addressed frame is silently dropped.
            log::debug!("dropping NPDU for network {} (not a router)", dest.network);
            return;
        }
        let hop = npdu.hop_count.unwrap_or(0);
        if hop == 0 {
            log::debug!("hop count exhausted for network {}", dest.network);
            return;
        }

        let Some(out_port) = self
            .ports
            .iter()
            .position(|p| p.network_number == Some(dest.network))
        else {
            // No port toward DNET: answer Reject-Message-To-Network.
            let reject = NetworkMessage::RejectMessageToNetwork {
                reason: 1, // network unreachable
                network: dest.network,
            };
            self.spawn_message_unicast(port_index, reject, source);
            return;
        };

        let mut forwarded = npdu.clone();
        forwarded.hop_count = Some(hop - 1);
        // Stamp the originating network on first crossing.
        if forwarded.source.is_none() {
            if let Some(net) = self.ports[port_index].network_number {
                forwarded.source = Some(NetworkAddress::new(net, source.mac.clone()));
            }
        }
        // Delivering onto the destination network: the routing destination
        // has done its job.
        let final_mac = dest.mac.clone();
        forwarded.destination = None;
        forwarded.hop_count = None;

        let frame = forwarded.encode(payload);
        let transport = self.ports[out_port].transport.clone();
        tokio::spawn(async move {
            let result = if final_mac.is_empty() {
                transport.send_broadcast(&frame).await
            } else {
                transport
                    .send_unicast(&frame, &BacnetAddress::local(final_mac))
                    .await
            };
            if let Err(err) = result {
                log::warn!("routed forward failed: {err}");
            }
        });
    }

    fn handle_network_message(
        &self,
        port_index: usize,
        _npdu: &Npdu,
        message: NetworkMessage,
        source: BacnetAddress,
    ) {
        match message {
            NetworkMessage::IAmRouterToNetwork(networks) => {
                let mut cache = self.cache.lock().expect("cache lock");
                for network in &networks {
                    cache.insert(*network, source.mac.clone());
                }
                drop(cache);
                self.drain_pending(port_index, &networks, &source);
            }

            NetworkMessage::WhoIsRouterToNetwork(asked) => {
                if self.ports.len() < 2 {
                    return;
                }
                let reachable: Vec<u16> = self
                    .ports
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| *index != port_index)
                    .filter_map(|(_, p)| p.network_number)
                    .filter(|net| asked.is_none() || asked == Some(*net))
                    .collect();
                if !reachable.is_empty() {
                    self.spawn_message_broadcast(
                        port_index,
                        NetworkMessage::IAmRouterToNetwork(reachable),
                    );
                }
            }

            NetworkMessage::WhatIsNetworkNumber => {
                if let Some(network) = self.ports[port_index].network_number {
                    self.spawn_message_broadcast(
                        port_index,
                        NetworkMessage::NetworkNumberIs {
                            network,
                            configured: true,
                        },
                    );
                }
            }

            NetworkMessage::NetworkNumberIs { network, .. } => {
                log::debug!("port {} network number announced as {network}", port_index);
            }

            NetworkMessage::InitializeRoutingTable(entries) => {
                if !entries.is_empty() {
                    log::warn!("routing table write via Initialize-Routing-Table not supported");
                }
                let table: Vec<RoutingTableEntry> = self
                    .ports
                    .iter()
                    .filter_map(|p| {
                        p.network_number.map(|network| RoutingTableEntry {
                            network,
                            port_id: p.id,
                            port_info: Vec::new(),
                        })
                    })
                    .collect();
                self.spawn_message_unicast(
                    port_index,
                    NetworkMessage::InitializeRoutingTableAck(table),
                    source,
                );
            }

            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                log::warn!("message to network {network} rejected, reason {reason}");
            }

            NetworkMessage::RouterBusyToNetwork(networks) => {
                log::debug!("router {source} busy for networks {networks:?}");
            }

            NetworkMessage::RouterAvailableToNetwork(networks) => {
                log::debug!("router {source} available for networks {networks:?}");
            }

            NetworkMessage::ICouldBeRouterToNetwork { .. }
            | NetworkMessage::InitializeRoutingTableAck(_) => {
                // Informational; no protocol obligation.
            }
        }
    }

    /// Send any NPDUs parked for the now-resolved networks.
    fn drain_pending(&self, port_index: usize, networks: &[u16], router: &BacnetAddress) {
        let mut drained = Vec::new();
        {
            let mut pending = self.pending.lock().expect("pending lock");
            for network in networks {
                if let Some(queue) = pending.remove(network) {
                    drained.extend(queue.into_iter().map(|q| q.frame));
                }
            }
        }
        if drained.is_empty() {
            return;
        }
        let transport = self.ports[port_index].transport.clone();
        let router_mac = router.mac.clone();
        tokio::spawn(async move {
            for frame in drained {
                if let Err(err) = transport
                    .send_unicast(&frame, &BacnetAddress::local(router_mac.clone()))
                    .await
                {
                    log::warn!("sending queued NPDU failed: {err}");
                }
            }
        });
    }

    fn spawn_message_broadcast(&self, port_index: usize, message: NetworkMessage) {
        let (npdu, body) = Npdu::network_message(&message);
        let frame = npdu.encode(&body);
        let transport = self.ports[port_index].transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.send_broadcast(&frame).await {
                log::warn!("network message broadcast failed: {err}");
            }
        });
    }

    fn spawn_message_unicast(
        &self,
        port_index: usize,
        message: NetworkMessage,
        dest: BacnetAddress,
    ) {
        let (npdu, body) = Npdu::network_message(&message);
        let frame = npdu.encode(&body);
        let transport = self.ports[port_index].transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.send_unicast(&frame, &dest).await {
                log::warn!("network message unicast failed: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::{DataLinkError, Transport as TransportTrait};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn npdu_round_trip_plain() {
        let mut npdu = Npdu::new();
        npdu.control.expecting_reply = true;
        let frame = npdu.encode(&[0xAA, 0xBB]);
        let (decoded, payload_at) = Npdu::decode(&frame).unwrap();
        assert!(decoded.control.expecting_reply);
        assert!(decoded.destination.is_none());
        assert_eq!(&frame[payload_at..], &[0xAA, 0xBB]);
    }

    #[test]
    fn npdu_round_trip_routed() {
        let npdu = Npdu {
            control: NpduControl::default(),
            destination: Some(NetworkAddress::new(42, vec![0x0A, 0x00, 0x00, 0x02, 0xBA, 0xC0])),
            source: Some(NetworkAddress::new(7, vec![0x01])),
            hop_count: Some(254),
            message_type: None,
        };
        let frame = npdu.encode(&[1, 2, 3]);
        let (decoded, payload_at) = Npdu::decode(&frame).unwrap();
        assert_eq!(decoded.destination, npdu.destination);
        assert_eq!(decoded.source, npdu.source);
        assert_eq!(decoded.hop_count, Some(254));
        assert_eq!(&frame[payload_at..], &[1, 2, 3]);
    }

    #[test]
    fn npdu_global_broadcast_layout() {
        let frame = Npdu::global_broadcast().encode(&[]);
        // version, control(dest present), DNET=FFFF, DLEN=0, hop
        assert_eq!(frame, vec![0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);
    }

    #[test]
    fn npdu_rejects_bad_version() {
        assert!(Npdu::decode(&[0x02, 0x00]).is_err());
    }

    #[test]
    fn network_message_round_trips() {
        let messages = [
            NetworkMessage::WhoIsRouterToNetwork(None),
            NetworkMessage::WhoIsRouterToNetwork(Some(42)),
            NetworkMessage::IAmRouterToNetwork(vec![1, 2, 300]),
            NetworkMessage::RejectMessageToNetwork { reason: 1, network: 9 },
            NetworkMessage::RouterBusyToNetwork(vec![5]),
            NetworkMessage::RouterAvailableToNetwork(vec![5, 6]),
            NetworkMessage::InitializeRoutingTable(vec![RoutingTableEntry {
                network: 3,
                port_id: 1,
                port_info: vec![0xAB],
            }]),
            NetworkMessage::WhatIsNetworkNumber,
            NetworkMessage::NetworkNumberIs { network: 12, configured: true },
        ];
        for message in messages {
            let body = message.encode_body();
            let decoded =
                NetworkMessage::decode(message.message_type() as u8, &body).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn network_list_cap_enforced() {
        let body = vec![0u8; (MAX_NETWORK_LIST + 1) * 2];
        assert!(matches!(
            NetworkMessage::decode(NetworkMessageType::IAmRouterToNetwork as u8, &body),
            Err(NetworkError::NetworkListTooLong(_))
        ));
    }

    #[test]
    fn router_cache_never_exceeds_cap() {
        let mut cache = RouterCache::new(8, Duration::from_secs(300));
        for network in 0..1000u16 {
            cache.insert(network, vec![network as u8]);
            assert!(cache.len() <= 8);
        }
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn router_cache_lru_eviction() {
        let mut cache = RouterCache::new(2, Duration::from_secs(300));
        cache.insert(1, vec![1]);
        cache.insert(2, vec![2]);
        // Refresh 1, then overflow: 2 is the LRU victim.
        assert!(cache.lookup(1).is_some());
        cache.insert(3, vec![3]);
        assert!(cache.lookup(1).is_some());
        assert!(cache.lookup(2).is_none());
        assert!(cache.lookup(3).is_some());
    }

    /// Records frames instead of touching a socket.
    struct MockTransport {
        local: BacnetAddress,
        unicasts: StdMutex<Vec<(Vec<u8>, BacnetAddress)>>,
        broadcasts: StdMutex<Vec<Vec<u8>>>,
        hook: StdMutex<Option<ReceiveHook>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                local: "192.168.1.10:47808".parse().unwrap(),
                unicasts: StdMutex::new(Vec::new()),
                broadcasts: StdMutex::new(Vec::new()),
                hook: StdMutex::new(None),
            })
        }

        fn inject(&self, frame: &[u8], source: BacnetAddress) {
            let hook = self.hook.lock().unwrap().clone().expect("hook registered");
            hook(Bytes::copy_from_slice(frame), source);
        }
    }

    #[async_trait]
    impl TransportTrait for MockTransport {
        async fn start(&self) -> std::result::Result<(), DataLinkError> {
            Ok(())
        }
        async fn stop(&self) {}
        fn set_receive_hook(&self, hook: ReceiveHook) {
            *self.hook.lock().unwrap() = Some(hook);
        }
        async fn send_unicast(
            &self,
            npdu: &[u8],
            dest: &BacnetAddress,
        ) -> std::result::Result<(), DataLinkError> {
            self.unicasts.lock().unwrap().push((npdu.to_vec(), dest.clone()));
            Ok(())
        }
        async fn send_broadcast(&self, npdu: &[u8]) -> std::result::Result<(), DataLinkError> {
            self.broadcasts.lock().unwrap().push(npdu.to_vec());
            Ok(())
        }
        fn local_address(&self) -> BacnetAddress {
            self.local.clone()
        }
        fn max_npdu_length(&self) -> usize {
            crate::datalink::MAX_NPDU_IP
        }
    }

    #[tokio::test]
    async fn unresolved_remote_queues_and_asks_router() {
        let transport = MockTransport::new();
        let layer = NetworkLayer::new(transport.clone());
        layer.attach();

        let dest = BacnetAddress::remote_station(42, vec![0x05]).unwrap();
        layer.send_apdu(&[0xA0], &dest, true, 0).await.unwrap();

        // No unicast yet; a Who-Is-Router-To-Network(42) went out broadcast.
        assert!(transport.unicasts.lock().unwrap().is_empty());
        let broadcasts = transport.broadcasts.lock().unwrap().clone();
        assert_eq!(broadcasts.len(), 1);
        let (npdu, at) = Npdu::decode(&broadcasts[0]).unwrap();
        let message = NetworkMessage::decode(npdu.message_type.unwrap(), &broadcasts[0][at..])
            .unwrap();
        assert_eq!(message, NetworkMessage::WhoIsRouterToNetwork(Some(42)));

        // An I-Am-Router-To-Network(42) from R drains the queue as unicast
        // to R.
        let router: BacnetAddress = "10.0.0.99:47808".parse().unwrap();
        let (iam, body) =
            Npdu::network_message(&NetworkMessage::IAmRouterToNetwork(vec![42]));
        transport.inject(&iam.encode(&body), router.clone());

        // Drain happens on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let unicasts = transport.unicasts.lock().unwrap().clone();
        assert_eq!(unicasts.len(), 1);
        assert_eq!(unicasts[0].1.mac, router.mac);
        let (sent, payload_at) = Npdu::decode(&unicasts[0].0).unwrap();
        assert_eq!(sent.destination, Some(NetworkAddress::new(42, vec![0x05])));
        assert_eq!(&unicasts[0].0[payload_at..], &[0xA0]);
    }

    #[tokio::test]
    async fn resolved_remote_goes_straight_to_router() {
        let transport = MockTransport::new();
        let layer = NetworkLayer::new(transport.clone());
        layer.attach();
        layer.test_learn_route(7, vec![0x0A, 0x00, 0x00, 0x01, 0xBA, 0xC0]);

        let dest = BacnetAddress::remote_station(7, vec![0x22]).unwrap();
        layer.send_apdu(&[0x10, 0x08], &dest, false, 0).await.unwrap();

        let unicasts = transport.unicasts.lock().unwrap().clone();
        assert_eq!(unicasts.len(), 1);
        assert_eq!(unicasts[0].1.mac, vec![0x0A, 0x00, 0x00, 0x01, 0xBA, 0xC0]);
    }

    #[tokio::test]
    async fn inbound_apdu_delivered_with_snet_mapping() {
        let transport = MockTransport::new();
        let layer = NetworkLayer::new(transport.clone());
        layer.attach();

        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        layer.set_apdu_handler(Arc::new(move |apdu, source, reply| {
            received2.lock().unwrap().push((apdu.to_vec(), source, reply));
        }));

        let npdu = Npdu {
            control: NpduControl {
                expecting_reply: true,
                ..Default::default()
            },
            destination: None,
            source: Some(NetworkAddress::new(4352, vec![0x01])),
            hop_count: None,
            message_type: None,
        };
        let link_source: BacnetAddress = "10.0.0.3:47808".parse().unwrap();
        transport.inject(&npdu.encode(&[0x55]), link_source);

        let got = received.lock().unwrap().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, vec![0x55]);
        assert_eq!(got[0].1, BacnetAddress::remote_station(4352, vec![0x01]).unwrap());
        assert!(got[0].2);
    }

    #[tokio::test]
    async fn who_is_router_answered_by_router_node() {
        let port_a = MockTransport::new();
        let port_b = MockTransport::new();
        let layer = NetworkLayer::with_ports(
            vec![
                NetworkPort {
                    id: 1,
                    network_number: Some(1),
                    transport: port_a.clone(),
                },
                NetworkPort {
                    id: 2,
                    network_number: Some(2),
                    transport: port_b.clone(),
                },
            ],
            0,
        );
        layer.attach();

        let (ask, body) =
            Npdu::network_message(&NetworkMessage::WhoIsRouterToNetwork(Some(2)));
        port_a.inject(&ask.encode(&body), "10.0.0.4:47808".parse().unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let broadcasts = port_a.broadcasts.lock().unwrap().clone();
        assert_eq!(broadcasts.len(), 1);
        let (reply, at) = Npdu::decode(&broadcasts[0]).unwrap();
        let message =
            NetworkMessage::decode(reply.message_type.unwrap(), &broadcasts[0][at..]).unwrap();
        assert_eq!(message, NetworkMessage::IAmRouterToNetwork(vec![2]));
    }
}
