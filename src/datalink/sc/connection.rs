//! BACnet/SC connection state machine (Annex AB.6).
//!
//! Both roles share the states IDLE, AWAITING (accept or request),
//! CONNECTED, and DISCONNECTING. The initiator sends Connect-Request on
//! websocket-up and waits for Connect-Accept or a NAK; the acceptor waits
//! for Connect-Request, consults a VMAC checker, and answers. Once
//! CONNECTED, a single per-connection task ([`ScConnection::run`]) owns the
//! websocket read half, so inbound frames arrive serially.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use super::bvlc::{
    ConnectPayload, ScFunction, ScMessage, ScResultCode, ScResultPayload,
    ERROR_NODE_DUPLICATE_VMAC,
};
use super::websocket::{close, recv_frame, send_frame, WsSink, WsSource};
use super::{DeviceUuid, ScVmac};
use crate::datalink::{DataLinkError, Result};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScConnectionState {
    Idle,
    AwaitingAccept,
    AwaitingRequest,
    Connected,
    Disconnecting,
}

/// Identity and limits advertised by the peer during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub vmac: ScVmac,
    pub uuid: DeviceUuid,
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
}

/// Checker consulted by the acceptor before admitting a peer; returns
/// `false` on VMAC collision.
pub type VmacChecker = Arc<dyn Fn(ScVmac, DeviceUuid) -> bool + Send + Sync>;

/// Handler for messages received while CONNECTED.
pub type ScMessageHandler = Arc<dyn Fn(ScMessage) + Send + Sync>;

/// Invoked on the initiator when the acceptor NAKs with
/// NODE_DUPLICATE_VMAC.
pub type VmacCollisionHook = Arc<dyn Fn() + Send + Sync>;

/// Per-connection configuration.
#[derive(Clone)]
pub struct ScConnectionConfig {
    pub local_vmac: ScVmac,
    pub local_uuid: DeviceUuid,
    /// Largest BVLC-SC message this node accepts.
    pub max_bvlc_length: u16,
    /// Largest NPDU this node accepts.
    pub max_npdu_length: u16,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub on_vmac_collision: Option<VmacCollisionHook>,
}

impl ScConnectionConfig {
    pub fn new(local_vmac: ScVmac, local_uuid: DeviceUuid) -> Self {
        Self {
            local_vmac,
            local_uuid,
            max_bvlc_length: 6000,
            max_npdu_length: 1497,
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(10),
            on_vmac_collision: None,
        }
    }

    fn connect_payload(&self) -> ConnectPayload {
        ConnectPayload {
            vmac: self.local_vmac,
            uuid: self.local_uuid,
            max_bvlc_length: self.max_bvlc_length,
            max_npdu_length: self.max_npdu_length,
        }
    }
}

/// One established (or establishing) BACnet/SC connection.
pub struct ScConnection {
    config: ScConnectionConfig,
    state: Mutex<ScConnectionState>,
    peer: Mutex<Option<PeerInfo>>,
    sink: tokio::sync::Mutex<WsSink>,
    source: tokio::sync::Mutex<Option<WsSource>>,
    next_message_id: AtomicU16,
}

impl ScConnection {
    fn new(config: ScConnectionConfig, sink: WsSink, source: WsSource) -> Self {
        Self {
            config,
            state: Mutex::new(ScConnectionState::Idle),
            peer: Mutex::new(None),
            sink: tokio::sync::Mutex::new(sink),
            source: tokio::sync::Mutex::new(Some(source)),
            next_message_id: AtomicU16::new(1),
        }
    }

    /// Current state.
    pub fn state(&self) -> ScConnectionState {
        *self.state.lock().expect("state lock")
    }

    /// Peer identity once CONNECTED.
    pub fn peer(&self) -> Option<PeerInfo> {
        *self.peer.lock().expect("peer lock")
    }

    fn set_state(&self, state: ScConnectionState) {
        *self.state.lock().expect("state lock") = state;
    }

    fn take_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Initiator role: send Connect-Request and await the verdict.
    pub async fn initiate(
        config: ScConnectionConfig,
        sink: WsSink,
        source: WsSource,
    ) -> Result<Arc<Self>> {
        let conn = Arc::new(Self::new(config, sink, source));
        conn.set_state(ScConnectionState::AwaitingAccept);

        let request = ScMessage::with_payload(
            ScFunction::ConnectRequest,
            conn.take_message_id(),
            conn.config.connect_payload().encode(),
        );
        send_frame(&mut *conn.sink.lock().await, request.encode()).await?;

        let verdict = timeout(conn.config.connect_timeout, conn.await_accept()).await;
        match verdict {
            Ok(Ok(peer)) => {
                *conn.peer.lock().expect("peer lock") = Some(peer);
                conn.set_state(ScConnectionState::Connected);
                log::info!("SC connected to {} ({})", peer.vmac, peer.uuid);
                Ok(conn)
            }
            Ok(Err(err)) => {
                conn.set_state(ScConnectionState::Idle);
                Err(err)
            }
            Err(_) => {
                conn.set_state(ScConnectionState::Idle);
                Err(DataLinkError::ConnectRefused("connect timeout".into()))
            }
        }
    }

    async fn await_accept(&self) -> Result<PeerInfo> {
        let mut source_guard = self.source.lock().await;
        let source = source_guard.as_mut().ok_or(DataLinkError::NotStarted)?;
        loop {
            let Some(frame) = recv_frame(source).await? else {
                return Err(DataLinkError::ConnectionClosed);
            };
            let msg = match ScMessage::decode(&frame) {
                Ok(msg) => msg,
                Err(_) => {
                    log::debug!("dropping malformed BVLC-SC frame during handshake");
                    continue;
                }
            };
            match msg.function {
                ScFunction::ConnectAccept => {
                    let payload = ConnectPayload::decode(&msg.payload)?;
                    return Ok(PeerInfo {
                        vmac: payload.vmac,
                        uuid: payload.uuid,
                        max_bvlc_length: payload.max_bvlc_length,
                        max_npdu_length: payload.max_npdu_length,
                    });
                }
                ScFunction::Result => {
                    let result = ScResultPayload::decode(&msg.payload)?;
                    if result.result == ScResultCode::Nak
                        && result.for_function == ScFunction::ConnectRequest
                    {
                        if result.error_code == ERROR_NODE_DUPLICATE_VMAC {
                            if let Some(hook) = &self.config.on_vmac_collision {
                                hook();
                            }
                        }
                        return Err(DataLinkError::ConnectRefused(format!(
                            "NAK error code {:#06x}",
                            result.error_code
                        )));
                    }
                }
                other => {
                    log::debug!("ignoring {other:?} while awaiting Connect-Accept");
                }
            }
        }
    }

    /// Acceptor role: await Connect-Request, consult the checker, answer.
    pub async fn accept(
        config: ScConnectionConfig,
        sink: WsSink,
        source: WsSource,
        checker: VmacChecker,
    ) -> Result<Arc<Self>> {
        let conn = Arc::new(Self::new(config, sink, source));
        conn.set_state(ScConnectionState::AwaitingRequest);

        let verdict = timeout(conn.config.connect_timeout, conn.await_request(checker)).await;
        match verdict {
            Ok(Ok(peer)) => {
                *conn.peer.lock().expect("peer lock") = Some(peer);
                conn.set_state(ScConnectionState::Connected);
                Ok(conn)
            }
            Ok(Err(err)) => {
                conn.set_state(ScConnectionState::Idle);
                Err(err)
            }
            Err(_) => {
                conn.set_state(ScConnectionState::Idle);
                Err(DataLinkError::ConnectRefused("accept timeout".into()))
            }
        }
    }

    async fn await_request(&self, checker: VmacChecker) -> Result<PeerInfo> {
        let request = {
            let mut source_guard = self.source.lock().await;
            let source = source_guard.as_mut().ok_or(DataLinkError::NotStarted)?;
            loop {
                let Some(frame) = recv_frame(source).await? else {
                    return Err(DataLinkError::ConnectionClosed);
                };
                match ScMessage::decode(&frame) {
                    Ok(msg) if msg.function == ScFunction::ConnectRequest => break msg,
                    Ok(other) => {
                        // Anything else before Connect-Request is a protocol
                        // violation.
                        log::debug!("unexpected {:?} before Connect-Request", other.function);
                        return Err(DataLinkError::ConnectRefused(
                            "unexpected message before Connect-Request".into(),
                        ));
                    }
                    Err(_) => continue,
                }
            }
        };

        let payload = ConnectPayload::decode(&request.payload)?;
        if !checker(payload.vmac, payload.uuid) {
            let nak = ScMessage::with_payload(
                ScFunction::Result,
                request.message_id,
                ScResultPayload::nak(
                    ScFunction::ConnectRequest,
                    0,
                    ERROR_NODE_DUPLICATE_VMAC,
                    "vmac in use",
                )
                .encode(),
            );
            send_frame(&mut *self.sink.lock().await, nak.encode()).await?;
            return Err(DataLinkError::ConnectRefused("duplicate vmac".into()));
        }

        let accept = ScMessage::with_payload(
            ScFunction::ConnectAccept,
            request.message_id,
            self.config.connect_payload().encode(),
        );
        send_frame(&mut *self.sink.lock().await, accept.encode()).await?;

        Ok(PeerInfo {
            vmac: payload.vmac,
            uuid: payload.uuid,
            max_bvlc_length: payload.max_bvlc_length,
            max_npdu_length: payload.max_npdu_length,
        })
    }

    /// Drive the CONNECTED state: forward Encapsulated-NPDUs (and other
    /// non-housekeeping messages) to `handler`, answer heartbeats, honor
    /// disconnects. Returns when the connection leaves CONNECTED.
    pub async fn run(&self, handler: ScMessageHandler) -> Result<()> {
        let mut source_guard = self.source.lock().await;
        let source = source_guard.as_mut().ok_or(DataLinkError::NotStarted)?;
        loop {
            let frame = match recv_frame(source).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.set_state(ScConnectionState::Idle);
                    return Ok(());
                }
                Err(err) => {
                    self.set_state(ScConnectionState::Idle);
                    return Err(err);
                }
            };
            let msg = match ScMessage::decode(&frame) {
                Ok(msg) => msg,
                Err(_) => {
                    log::debug!("dropping malformed BVLC-SC frame");
                    continue;
                }
            };

            match msg.function {
                ScFunction::HeartbeatRequest => {
                    let ack = ScMessage::plain(ScFunction::HeartbeatAck, msg.message_id);
                    send_frame(&mut *self.sink.lock().await, ack.encode()).await?;
                }
                ScFunction::DisconnectRequest => {
                    let ack = ScMessage::plain(ScFunction::DisconnectAck, msg.message_id);
                    send_frame(&mut *self.sink.lock().await, ack.encode()).await?;
                    self.set_state(ScConnectionState::Idle);
                    return Ok(());
                }
                ScFunction::DisconnectAck => {
                    if self.state() == ScConnectionState::Disconnecting {
                        self.set_state(ScConnectionState::Idle);
                        return Ok(());
                    }
                }
                _ => handler(msg),
            }
        }
    }

    /// Like [`run`](Self::run), but the handler is awaited inline, so
    /// per-connection message order is preserved through async routing.
    pub async fn run_with<F, Fut>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(ScMessage) -> Fut + Send,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut source_guard = self.source.lock().await;
        let source = source_guard.as_mut().ok_or(DataLinkError::NotStarted)?;
        loop {
            let frame = match recv_frame(source).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.set_state(ScConnectionState::Idle);
                    return Ok(());
                }
                Err(err) => {
                    self.set_state(ScConnectionState::Idle);
                    return Err(err);
                }
            };
            let msg = match ScMessage::decode(&frame) {
                Ok(msg) => msg,
                Err(_) => {
                    log::debug!("dropping malformed BVLC-SC frame");
                    continue;
                }
            };
            match msg.function {
                ScFunction::HeartbeatRequest => {
                    let ack = ScMessage::plain(ScFunction::HeartbeatAck, msg.message_id);
                    send_frame(&mut *self.sink.lock().await, ack.encode()).await?;
                }
                ScFunction::DisconnectRequest => {
                    let ack = ScMessage::plain(ScFunction::DisconnectAck, msg.message_id);
                    send_frame(&mut *self.sink.lock().await, ack.encode()).await?;
                    self.set_state(ScConnectionState::Idle);
                    return Ok(());
                }
                ScFunction::DisconnectAck => {
                    if self.state() == ScConnectionState::Disconnecting {
                        self.set_state(ScConnectionState::Idle);
                        return Ok(());
                    }
                }
                _ => handler(msg).await,
            }
        }
    }

    /// Send pre-encoded frame bytes; used by the hub's two-phase fan-out.
    pub(crate) async fn send_raw(&self, frame: Vec<u8>) -> Result<()> {
        send_frame(&mut *self.sink.lock().await, frame).await
    }

    /// Send a message on an established connection.
    pub async fn send_message(&self, mut msg: ScMessage) -> Result<()> {
        match self.state() {
            ScConnectionState::Connected | ScConnectionState::Disconnecting => {}
            _ => return Err(DataLinkError::NotStarted),
        }
        if msg.message_id == 0 {
            msg.message_id = self.take_message_id();
        }
        send_frame(&mut *self.sink.lock().await, msg.encode()).await
    }

    /// Send an Encapsulated-NPDU toward `destination`.
    pub async fn send_npdu(&self, npdu: &[u8], destination: Option<ScVmac>) -> Result<()> {
        let msg = ScMessage {
            function: ScFunction::EncapsulatedNpdu,
            message_id: self.take_message_id(),
            originating: None,
            destination,
            dest_options: Vec::new(),
            data_options: Vec::new(),
            payload: npdu.to_vec(),
        };
        self.send_message(msg).await
    }

    /// Graceful disconnect: send Disconnect-Request and wait for the run
    /// loop to see the ACK; on timeout fall back to IDLE regardless.
    pub async fn disconnect(&self) {
        if self.state() != ScConnectionState::Connected {
            return;
        }
        self.set_state(ScConnectionState::Disconnecting);
        let request = ScMessage::plain(ScFunction::DisconnectRequest, self.take_message_id());
        if send_frame(&mut *self.sink.lock().await, request.encode()).await.is_err() {
            self.set_state(ScConnectionState::Idle);
            return;
        }
        // The run loop observes the Disconnect-ACK; poll for the
        // transition with a hard deadline.
        let deadline = tokio::time::Instant::now() + self.config.disconnect_timeout;
        while self.state() != ScConnectionState::Idle
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.state() != ScConnectionState::Idle {
            log::debug!("Disconnect-ACK timeout; forcing IDLE");
            self.set_state(ScConnectionState::Idle);
        }
        close(&mut *self.sink.lock().await).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::sc::websocket;

    /// Build a connected websocket pair over an in-memory duplex stream.
    async fn ws_pair() -> ((WsSink, WsSource), (WsSink, WsSource)) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move { websocket::accept(server_io).await.unwrap() });
        let client = tokio_tungstenite::client_async("ws://sc.test/", client_io)
            .await
            .unwrap()
            .0;
        let (sink, source) = {
            use futures_util::StreamExt;
            let (sink, source) = client.split();
            (
                Box::pin(sink) as WsSink,
                Box::pin(source) as WsSource,
            )
        };
        ((sink, source), server.await.unwrap())
    }

    fn accept_all() -> VmacChecker {
        Arc::new(|_, _| true)
    }

    #[tokio::test]
    async fn full_handshake_both_sides_connected() {
        let ((client_sink, client_source), (server_sink, server_source)) = ws_pair().await;

        let initiator_config =
            ScConnectionConfig::new(ScVmac([1; 6]), DeviceUuid([0xA; 16]));
        let acceptor_config = ScConnectionConfig::new(ScVmac([2; 6]), DeviceUuid([0xB; 16]));

        let acceptor = tokio::spawn(async move {
            ScConnection::accept(acceptor_config, server_sink, server_source, accept_all()).await
        });
        let initiator =
            ScConnection::initiate(initiator_config, client_sink, client_source).await.unwrap();
        let acceptor = acceptor.await.unwrap().unwrap();

        assert_eq!(initiator.state(), ScConnectionState::Connected);
        assert_eq!(acceptor.state(), ScConnectionState::Connected);
        assert_eq!(initiator.peer().unwrap().vmac, ScVmac([2; 6]));
        assert_eq!(acceptor.peer().unwrap().vmac, ScVmac([1; 6]));
        assert_eq!(acceptor.peer().unwrap().uuid, DeviceUuid([0xA; 16]));
    }

    #[tokio::test]
    async fn collision_nak_returns_initiator_to_idle() {
        let ((client_sink, client_source), (server_sink, server_source)) = ws_pair().await;

        let collided = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let collided2 = collided.clone();
        let mut initiator_config =
            ScConnectionConfig::new(ScVmac([1; 6]), DeviceUuid([0xA; 16]));
        initiator_config.on_vmac_collision = Some(Arc::new(move || {
            collided2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        let acceptor_config = ScConnectionConfig::new(ScVmac([2; 6]), DeviceUuid([0xB; 16]));

        let acceptor = tokio::spawn(async move {
            ScConnection::accept(
                acceptor_config,
                server_sink,
                server_source,
                Arc::new(|_, _| false),
            )
            .await
        });
        let result =
            ScConnection::initiate(initiator_config, client_sink, client_source).await;
        assert!(matches!(result, Err(DataLinkError::ConnectRefused(_))));
        assert!(collided.load(std::sync::atomic::Ordering::SeqCst));
        assert!(acceptor.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn heartbeat_answered_and_npdu_delivered() {
        let ((client_sink, client_source), (server_sink, server_source)) = ws_pair().await;

        let initiator_config =
            ScConnectionConfig::new(ScVmac([1; 6]), DeviceUuid([0xA; 16]));
        let acceptor_config = ScConnectionConfig::new(ScVmac([2; 6]), DeviceUuid([0xB; 16]));

        let acceptor_task = tokio::spawn(async move {
            ScConnection::accept(acceptor_config, server_sink, server_source, accept_all()).await
        });
        let initiator =
            ScConnection::initiate(initiator_config, client_sink, client_source).await.unwrap();
        let acceptor = acceptor_task.await.unwrap().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let acceptor_for_run = acceptor.clone();
        let run = tokio::spawn(async move {
            acceptor_for_run
                .run(Arc::new(move |msg| {
                    let _ = tx.send(msg);
                }))
                .await
        });

        // NPDU flows through to the handler.
        initiator.send_npdu(&[0x01, 0x00, 0x10, 0x08], None).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.function, ScFunction::EncapsulatedNpdu);
        assert_eq!(msg.payload, vec![0x01, 0x00, 0x10, 0x08]);

        // Heartbeat is answered by the run loop, not the handler.
        initiator
            .send_message(ScMessage::plain(ScFunction::HeartbeatRequest, 0))
            .await
            .unwrap();
        {
            let mut source = initiator.source.lock().await;
            let frame = recv_frame(source.as_mut().unwrap()).await.unwrap().unwrap();
            let reply = ScMessage::decode(&frame).unwrap();
            assert_eq!(reply.function, ScFunction::HeartbeatAck);
        }

        // Disconnect request makes the acceptor ack and return to IDLE.
        initiator
            .send_message(ScMessage::plain(ScFunction::DisconnectRequest, 0))
            .await
            .unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(acceptor.state(), ScConnectionState::Idle);
    }
}
