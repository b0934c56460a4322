//! Transaction management (Clause 5).
//!
//! Two cooperating state machines: the **client TSM** originates confirmed
//! requests, allocates per-peer invoke ids, retries on timeout, and
//! reassembles segmented ComplexACKs; the **server TSM** reassembles
//! segmented requests, dispatches them to the registered service handler,
//! and segments oversized responses.
//!
//! Segmentation is transparent to callers: a request larger than the peer's
//! advertised APDU limit is split with a sliding window
//! ([`segmentation`]); the response path is symmetric.
//!
//! All inbound APDUs funnel through one processing task, so per-peer
//! ordering is preserved without fine-grained locking.

pub mod segmentation;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::encoding::apdu::{Apdu, MaxApduSize, MaxSegments};
use crate::error::{AbortReason, BacnetError, Error, ErrorClass, ErrorCode, RejectReason, Result};
use crate::network::address::BacnetAddress;
use crate::network::NetworkLayer;
use segmentation::{ReceiverAction, SegmentReassembler, SegmentSender, SenderProgress};

/// Transaction timing and sizing parameters.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Wait per attempt for a confirmed-request response.
    pub apdu_timeout: Duration,
    /// Retries after the first attempt.
    pub apdu_retries: u32,
    /// Wait for the next segment or segment ACK.
    pub segment_timeout: Duration,
    /// Window size proposed when segmenting.
    pub proposed_window_size: u8,
    /// Largest APDU this node itself accepts.
    pub max_apdu_length: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            apdu_timeout: Duration::from_secs(3),
            apdu_retries: 3,
            segment_timeout: Duration::from_secs(2),
            proposed_window_size: 16,
            max_apdu_length: 1476,
        }
    }
}

/// Successful outcome of a confirmed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmedOutcome {
    /// Peer answered SimpleACK.
    SimpleAck { service_choice: u8 },
    /// Peer answered ComplexACK with the given service payload.
    ComplexAck {
        service_choice: u8,
        service_data: Vec<u8>,
    },
}

/// What a service handler returns for a confirmed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    SimpleAck,
    ComplexAck { service_choice: u8, data: Vec<u8> },
}

/// Server-side handler for confirmed requests:
/// `(service_choice, service_data, source)`.
pub type ConfirmedHandler =
    Arc<dyn Fn(u8, &[u8], &BacnetAddress) -> Result<ServiceResponse> + Send + Sync>;

/// Server-side handler for unconfirmed requests.
pub type UnconfirmedHandler = Arc<dyn Fn(u8, &[u8], &BacnetAddress) + Send + Sync>;

type TxKey = (BacnetAddress, u8);

struct ClientTx {
    responder: Option<oneshot::Sender<Result<ConfirmedOutcome>>>,
    /// Outbound segmented request in flight.
    sender: Option<SegmentSender>,
    service_choice: u8,
    /// Inbound segmented ComplexACK being reassembled.
    reassembly: Option<(SegmentReassembler, u8)>,
    last_activity: Instant,
}

struct ServerAssembly {
    reassembler: SegmentReassembler,
    service_choice: u8,
    max_apdu: MaxApduSize,
    segmented_response_accepted: bool,
    last_activity: Instant,
}

struct ServerResponseTx {
    sender: SegmentSender,
    service_choice: u8,
    last_activity: Instant,
}

struct TsmInner {
    config: TransactionConfig,
    network: Arc<NetworkLayer>,
    client: Mutex<HashMap<TxKey, ClientTx>>,
    server_rx: Mutex<HashMap<TxKey, ServerAssembly>>,
    server_tx: Mutex<HashMap<TxKey, ServerResponseTx>>,
    confirmed_handler: RwLock<Option<ConfirmedHandler>>,
    unconfirmed_handler: RwLock<Option<UnconfirmedHandler>>,
}

/// Removes the invoke-id reservation when the request future completes or
/// is cancelled; late responses then find no transaction and are dropped
/// silently.
struct Reservation {
    inner: Weak<TsmInner>,
    key: TxKey,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.client.lock().expect("client lock").remove(&self.key);
        }
    }
}

/// The transaction manager.
pub struct TransactionManager {
    inner: Arc<TsmInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionManager {
    pub fn new(network: Arc<NetworkLayer>, config: TransactionConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(TsmInner {
                config,
                network,
                client: Mutex::new(HashMap::new()),
                server_rx: Mutex::new(HashMap::new()),
                server_tx: Mutex::new(HashMap::new()),
                confirmed_handler: RwLock::new(None),
                unconfirmed_handler: RwLock::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the server-side confirmed-request handler.
    pub fn set_confirmed_handler(&self, handler: ConfirmedHandler) {
        *self.inner.confirmed_handler.write().expect("handler lock") = Some(handler);
    }

    /// Register the unconfirmed-request handler.
    pub fn set_unconfirmed_handler(&self, handler: UnconfirmedHandler) {
        *self.inner.unconfirmed_handler.write().expect("handler lock") = Some(handler);
    }

    /// Hook the network layer's APDU path and spawn the processing and
    /// sweeper tasks.
    pub fn start(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Bytes, BacnetAddress)>();
        self.inner.network.set_apdu_handler(Arc::new(move |apdu, source, _expecting_reply| {
            let _ = tx.send((apdu, source));
        }));

        let inner = self.inner.clone();
        let process = tokio::spawn(async move {
            while let Some((apdu, source)) = rx.recv().await {
                inner.process_apdu(&apdu, source).await;
            }
        });

        let inner = self.inner.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                ticker.tick().await;
                inner.sweep_stalled();
            }
        });

        let mut tasks = self.tasks.lock().expect("task lock");
        tasks.push(process);
        tasks.push(sweeper);
    }

    /// Cancel all pending transactions and stop background tasks.
    pub fn shutdown(&self) {
        for (_, mut tx) in self.inner.client.lock().expect("client lock").drain() {
            if let Some(responder) = tx.responder.take() {
                let _ = responder.send(Err(Error::Timeout));
            }
        }
        self.inner.server_rx.lock().expect("server lock").clear();
        self.inner.server_tx.lock().expect("server lock").clear();
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
    }

    /// Issue a confirmed request and await its typed outcome.
    ///
    /// `peer_max_apdu` is the destination's advertised limit; requests
    /// larger than that are segmented transparently.
    pub async fn confirmed_request(
        &self,
        dest: &BacnetAddress,
        service_choice: u8,
        service_data: Vec<u8>,
        peer_max_apdu: usize,
    ) -> Result<ConfirmedOutcome> {
        let invoke_id = self.inner.allocate_invoke_id(dest, service_choice)?;
        let key = (dest.clone(), invoke_id);
        let _reservation = Reservation {
            inner: Arc::downgrade(&self.inner),
            key: key.clone(),
        };

        let config = &self.inner.config;
        for _attempt in 0..=config.apdu_retries {
            let (responder, receiver) = oneshot::channel();
            self.inner.arm_attempt(&key, responder, &service_data, peer_max_apdu)?;
            self.inner
                .send_request(&key, &service_data, service_choice, peer_max_apdu)
                .await?;

            match tokio::time::timeout(config.apdu_timeout, receiver).await {
                Ok(Ok(outcome)) => return outcome,
                // Responder dropped without an answer (shutdown).
                Ok(Err(_)) => return Err(Error::Timeout),
                Err(_) => continue,
            }
        }
        Err(Error::Timeout)
    }

    /// Send an unconfirmed request.
    pub async fn unconfirmed_request(
        &self,
        dest: &BacnetAddress,
        service_choice: u8,
        service_data: Vec<u8>,
    ) -> Result<()> {
        let apdu = Apdu::UnconfirmedRequest {
            service_choice,
            service_data,
        };
        self.inner
            .network
            .send_apdu(&apdu.encode(), dest, false, 0)
            .await?;
        Ok(())
    }

    /// Number of live client transactions (diagnostics).
    pub fn pending_count(&self) -> usize {
        self.inner.client.lock().expect("client lock").len()
    }
}

impl TsmInner {
    /// Reserve a free invoke id for `dest` from the per-peer 0..=255 pool.
    fn allocate_invoke_id(&self, dest: &BacnetAddress, service_choice: u8) -> Result<u8> {
        let mut client = self.client.lock().expect("client lock");
        let invoke_id = (0..=255u8)
            .find(|id| !client.contains_key(&(dest.clone(), *id)))
            .ok_or(Error::Abort {
                reason: AbortReason::OutOfResources,
                by_server: false,
            })?;
        client.insert(
            (dest.clone(), invoke_id),
            ClientTx {
                responder: None,
                sender: None,
                service_choice,
                reassembly: None,
                last_activity: Instant::now(),
            },
        );
        Ok(invoke_id)
    }

    /// Reset per-attempt state (responder and any segmentation progress).
    fn arm_attempt(
        &self,
        key: &TxKey,
        responder: oneshot::Sender<Result<ConfirmedOutcome>>,
        service_data: &[u8],
        peer_max_apdu: usize,
    ) -> Result<()> {
        let mut client = self.client.lock().expect("client lock");
        let tx = client.get_mut(key).ok_or(Error::Timeout)?;
        tx.responder = Some(responder);
        tx.reassembly = None;
        tx.last_activity = Instant::now();
        tx.sender = if self.needs_segmentation(service_data.len(), peer_max_apdu) {
            let chunk = peer_max_apdu.saturating_sub(6).max(1);
            Some(
                SegmentSender::new(service_data, chunk, self.config.proposed_window_size).ok_or(
                    Error::Abort {
                        reason: AbortReason::ApduTooLong,
                        by_server: false,
                    },
                )?,
            )
        } else {
            None
        };
        Ok(())
    }

    fn needs_segmentation(&self, data_len: usize, peer_max_apdu: usize) -> bool {
        // Unsegmented ConfirmedRequest overhead: fixed header (3) + choice.
        data_len + 4 > peer_max_apdu
    }

    async fn send_request(
        &self,
        key: &TxKey,
        service_data: &[u8],
        service_choice: u8,
        peer_max_apdu: usize,
    ) -> Result<()> {
        let (dest, invoke_id) = key;
        if !self.needs_segmentation(service_data.len(), peer_max_apdu) {
            let apdu = Apdu::ConfirmedRequest {
                segmented: false,
                more_follows: false,
                segmented_response_accepted: true,
                max_segments: MaxSegments::GreaterThan64,
                max_apdu: MaxApduSize::for_length(self.config.max_apdu_length),
                invoke_id: *invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice,
                service_data: service_data.to_vec(),
            };
            self.network.send_apdu(&apdu.encode(), dest, true, 0).await?;
            return Ok(());
        }

        let batch = {
            let mut client = self.client.lock().expect("client lock");
            let tx = client.get_mut(key).ok_or(Error::Timeout)?;
            tx.sender.as_mut().map(SegmentSender::next_batch).unwrap_or_default()
        };
        self.send_request_segments(key, service_choice, batch).await
    }

    async fn send_request_segments(
        &self,
        key: &TxKey,
        service_choice: u8,
        batch: Vec<(u8, bool, Vec<u8>)>,
    ) -> Result<()> {
        let (dest, invoke_id) = key;
        for (sequence, more_follows, chunk) in batch {
            let apdu = Apdu::ConfirmedRequest {
                segmented: true,
                more_follows,
                segmented_response_accepted: true,
                max_segments: MaxSegments::GreaterThan64,
                max_apdu: MaxApduSize::for_length(self.config.max_apdu_length),
                invoke_id: *invoke_id,
                sequence_number: Some(sequence),
                proposed_window_size: Some(self.config.proposed_window_size),
                service_choice,
                service_data: chunk,
            };
            self.network.send_apdu(&apdu.encode(), dest, true, 0).await?;
        }
        Ok(())
    }

    /// Complete a client transaction. The reservation guard in the request
    /// future removes the map entry.
    fn finish_client(&self, key: &TxKey, outcome: Result<ConfirmedOutcome>) {
        let responder = {
            let mut client = self.client.lock().expect("client lock");
            client.get_mut(key).and_then(|tx| tx.responder.take())
        };
        match responder {
            Some(responder) => {
                let _ = responder.send(outcome);
            }
            None => log::debug!("late response for {}#{} dropped", key.0, key.1),
        }
    }

    /// Main dispatch for inbound APDUs.
    async fn process_apdu(&self, data: &[u8], source: BacnetAddress) {
        let apdu = match Apdu::decode(data) {
            Ok(apdu) => apdu,
            Err(err) => {
                log::debug!("dropping malformed APDU from {source}: {err}");
                return;
            }
        };

        match apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                let handler = self.unconfirmed_handler.read().expect("handler lock").clone();
                if let Some(handler) = handler {
                    handler(service_choice, &service_data, &source);
                }
            }

            Apdu::ConfirmedRequest {
                segmented: false,
                invoke_id,
                service_choice,
                service_data,
                max_apdu,
                segmented_response_accepted,
                ..
            } => {
                self.dispatch_confirmed(
                    source,
                    invoke_id,
                    service_choice,
                    &service_data,
                    max_apdu,
                    segmented_response_accepted,
                )
                .await;
            }

            Apdu::ConfirmedRequest {
                segmented: true,
                invoke_id,
                service_choice,
                service_data,
                sequence_number,
                proposed_window_size,
                max_apdu,
                segmented_response_accepted,
                more_follows,
                ..
            } => {
                self.accept_request_segment(
                    source,
                    invoke_id,
                    service_choice,
                    sequence_number.unwrap_or(0),
                    proposed_window_size.unwrap_or(1),
                    more_follows,
                    &service_data,
                    max_apdu,
                    segmented_response_accepted,
                )
                .await;
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                self.finish_client(
                    &(source, invoke_id),
                    Ok(ConfirmedOutcome::SimpleAck { service_choice }),
                );
            }

            Apdu::ComplexAck {
                segmented: false,
                invoke_id,
                service_choice,
                service_data,
                ..
            } => {
                self.finish_client(
                    &(source, invoke_id),
                    Ok(ConfirmedOutcome::ComplexAck {
                        service_choice,
                        service_data,
                    }),
                );
            }

            Apdu::ComplexAck {
                segmented: true,
                invoke_id,
                service_choice,
                service_data,
                sequence_number,
                proposed_window_size,
                more_follows,
            } => {
                self.accept_ack_segment(
                    source,
                    invoke_id,
                    service_choice,
                    sequence_number.unwrap_or(0),
                    proposed_window_size.unwrap_or(1),
                    more_follows,
                    &service_data,
                )
                .await;
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                if server {
                    // The server acks segments of our request.
                    self.advance_request_sender(
                        source,
                        invoke_id,
                        sequence_number,
                        actual_window_size,
                        negative,
                    )
                    .await;
                } else {
                    // The client acks segments of our response.
                    self.advance_response_sender(
                        source,
                        invoke_id,
                        sequence_number,
                        actual_window_size,
                        negative,
                    )
                    .await;
                }
            }

            Apdu::Error {
                invoke_id,
                error_class,
                error_code,
                ..
            } => {
                self.finish_client(
                    &(source, invoke_id),
                    Err(Error::Bacnet(BacnetError::from_raw(error_class, error_code))),
                );
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                self.finish_client(
                    &(source, invoke_id),
                    Err(Error::Reject(RejectReason::from(reject_reason))),
                );
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                self.finish_client(
                    &(source, invoke_id),
                    Err(Error::Abort {
                        reason: AbortReason::from(abort_reason),
                        by_server: server,
                    }),
                );
            }
        }
    }

    /// Run the registered handler and send the reply, segmenting when the
    /// response exceeds the client's advertised APDU limit.
    async fn dispatch_confirmed(
        &self,
        source: BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        service_data: &[u8],
        peer_max_apdu: MaxApduSize,
        segmented_response_accepted: bool,
    ) {
        let handler = self.confirmed_handler.read().expect("handler lock").clone();
        let reply = match handler {
            Some(handler) => handler(service_choice, service_data, &source),
            None => Err(Error::Reject(RejectReason::UnrecognizedService)),
        };

        let apdu = match reply {
            Ok(ServiceResponse::SimpleAck) => Apdu::SimpleAck {
                invoke_id,
                service_choice,
            },
            Ok(ServiceResponse::ComplexAck {
                service_choice: ack_choice,
                data,
            }) => {
                // Unsegmented ComplexACK overhead: 2 octets + choice.
                if data.len() + 3 <= peer_max_apdu.size() {
                    Apdu::ComplexAck {
                        segmented: false,
                        more_follows: false,
                        invoke_id,
                        sequence_number: None,
                        proposed_window_size: None,
                        service_choice: ack_choice,
                        service_data: data,
                    }
                } else if segmented_response_accepted {
                    self.begin_segmented_response(source, invoke_id, ack_choice, data, peer_max_apdu)
                        .await;
                    return;
                } else {
                    Apdu::Abort {
                        server: true,
                        invoke_id,
                        abort_reason: AbortReason::SegmentationNotSupported as u8,
                    }
                }
            }
            Err(Error::Bacnet(err)) => Apdu::Error {
                invoke_id,
                service_choice,
                error_class: err.class as u16,
                error_code: err.code as u16,
            },
            Err(Error::Reject(reason)) => Apdu::Reject {
                invoke_id,
                reject_reason: reason as u8,
            },
            Err(Error::Abort { reason, .. }) => Apdu::Abort {
                server: true,
                invoke_id,
                abort_reason: reason as u8,
            },
            Err(err) => {
                log::warn!("service handler failed: {err}");
                Apdu::Error {
                    invoke_id,
                    service_choice,
                    error_class: ErrorClass::Device as u16,
                    error_code: ErrorCode::OperationalProblem as u16,
                }
            }
        };

        if let Err(err) = self.network.send_apdu(&apdu.encode(), &source, false, 0).await {
            log::warn!("sending response to {source} failed: {err}");
        }
    }

    async fn begin_segmented_response(
        &self,
        source: BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        data: Vec<u8>,
        peer_max_apdu: MaxApduSize,
    ) {
        // Segmented ComplexACK overhead: 4 octets + choice.
        let chunk = peer_max_apdu.size().saturating_sub(5).max(1);
        let Some(mut sender) =
            SegmentSender::new(&data, chunk, self.config.proposed_window_size)
        else {
            let abort = Apdu::Abort {
                server: true,
                invoke_id,
                abort_reason: AbortReason::ApduTooLong as u8,
            };
            let _ = self.network.send_apdu(&abort.encode(), &source, false, 0).await;
            return;
        };

        let batch = sender.next_batch();
        self.server_tx.lock().expect("server lock").insert(
            (source.clone(), invoke_id),
            ServerResponseTx {
                sender,
                service_choice,
                last_activity: Instant::now(),
            },
        );
        self.send_response_segments(&source, invoke_id, service_choice, batch).await;
    }

    async fn send_response_segments(
        &self,
        dest: &BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        batch: Vec<(u8, bool, Vec<u8>)>,
    ) {
        for (sequence, more_follows, chunk) in batch {
            let apdu = Apdu::ComplexAck {
                segmented: true,
                more_follows,
                invoke_id,
                sequence_number: Some(sequence),
                proposed_window_size: Some(self.config.proposed_window_size),
                service_choice,
                service_data: chunk,
            };
            if let Err(err) = self.network.send_apdu(&apdu.encode(), dest, true, 0).await {
                log::warn!("sending response segment failed: {err}");
                return;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_request_segment(
        &self,
        source: BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        sequence: u8,
        proposed_window: u8,
        more_follows: bool,
        chunk: &[u8],
        max_apdu: MaxApduSize,
        segmented_response_accepted: bool,
    ) {
        let key = (source.clone(), invoke_id);
        let action = {
            let mut server_rx = self.server_rx.lock().expect("server lock");
            let assembly = server_rx.entry(key.clone()).or_insert_with(|| ServerAssembly {
                reassembler: SegmentReassembler::new(
                    proposed_window,
                    self.config.proposed_window_size,
                ),
                service_choice,
                max_apdu,
                segmented_response_accepted,
                last_activity: Instant::now(),
            });
            assembly.last_activity = Instant::now();
            assembly.reassembler.accept(sequence, more_follows, chunk)
        };

        match action {
            ReceiverAction::Pending => {}
            ReceiverAction::Ack { sequence } => {
                self.send_segment_ack(&source, invoke_id, sequence, true, false).await;
            }
            ReceiverAction::Nak { sequence } => {
                self.send_segment_ack(&source, invoke_id, sequence, true, true).await;
            }
            ReceiverAction::Complete { sequence, data } => {
                let assembly = self.server_rx.lock().expect("server lock").remove(&key);
                self.send_segment_ack(&source, invoke_id, sequence, true, false).await;
                if let Some(assembly) = assembly {
                    self.dispatch_confirmed(
                        source,
                        invoke_id,
                        assembly.service_choice,
                        &data,
                        assembly.max_apdu,
                        assembly.segmented_response_accepted,
                    )
                    .await;
                }
            }
        }
    }

    async fn accept_ack_segment(
        &self,
        source: BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        sequence: u8,
        proposed_window: u8,
        more_follows: bool,
        chunk: &[u8],
    ) {
        let key = (source.clone(), invoke_id);
        let action = {
            let mut client = self.client.lock().expect("client lock");
            let Some(tx) = client.get_mut(&key) else {
                log::debug!("segmented ComplexACK for unknown transaction {invoke_id}");
                return;
            };
            tx.last_activity = Instant::now();
            let (reassembler, _) = tx.reassembly.get_or_insert_with(|| {
                (
                    SegmentReassembler::new(proposed_window, self.config.proposed_window_size),
                    service_choice,
                )
            });
            reassembler.accept(sequence, more_follows, chunk)
        };

        match action {
            ReceiverAction::Pending => {}
            ReceiverAction::Ack { sequence } => {
                self.send_segment_ack(&source, invoke_id, sequence, false, false).await;
            }
            ReceiverAction::Nak { sequence } => {
                self.send_segment_ack(&source, invoke_id, sequence, false, true).await;
            }
            ReceiverAction::Complete { sequence, data } => {
                self.send_segment_ack(&source, invoke_id, sequence, false, false).await;
                self.finish_client(
                    &key,
                    Ok(ConfirmedOutcome::ComplexAck {
                        service_choice,
                        service_data: data,
                    }),
                );
            }
        }
    }

    async fn advance_request_sender(
        &self,
        source: BacnetAddress,
        invoke_id: u8,
        sequence: u8,
        actual_window: u8,
        negative: bool,
    ) {
        let key = (source, invoke_id);
        let (service_choice, batch) = {
            let mut client = self.client.lock().expect("client lock");
            let Some(tx) = client.get_mut(&key) else { return };
            tx.last_activity = Instant::now();
            let Some(sender) = tx.sender.as_mut() else { return };
            match sender.handle_ack(sequence, actual_window, negative) {
                SenderProgress::NoProgress => return,
                SenderProgress::Complete => {
                    tx.sender = None;
                    return;
                }
                SenderProgress::Continue => (tx.service_choice, sender.next_batch()),
            }
        };
        if let Err(err) = self.send_request_segments(&key, service_choice, batch).await {
            self.finish_client(&key, Err(err));
        }
    }

    async fn advance_response_sender(
        &self,
        source: BacnetAddress,
        invoke_id: u8,
        sequence: u8,
        actual_window: u8,
        negative: bool,
    ) {
        let key = (source.clone(), invoke_id);
        let action = {
            let mut server_tx = self.server_tx.lock().expect("server lock");
            let Some(response) = server_tx.get_mut(&key) else { return };
            response.last_activity = Instant::now();
            match response.sender.handle_ack(sequence, actual_window, negative) {
                SenderProgress::NoProgress => None,
                SenderProgress::Complete => {
                    server_tx.remove(&key);
                    None
                }
                SenderProgress::Continue => {
                    Some((response.service_choice, response.sender.next_batch()))
                }
            }
        };
        if let Some((service_choice, batch)) = action {
            self.send_response_segments(&source, invoke_id, service_choice, batch).await;
        }
    }

    async fn send_segment_ack(
        &self,
        dest: &BacnetAddress,
        invoke_id: u8,
        sequence: u8,
        server: bool,
        negative: bool,
    ) {
        let apdu = Apdu::SegmentAck {
            negative,
            server,
            invoke_id,
            sequence_number: sequence,
            actual_window_size: self.config.proposed_window_size,
        };
        if let Err(err) = self.network.send_apdu(&apdu.encode(), dest, false, 0).await {
            log::warn!("sending SegmentACK failed: {err}");
        }
    }

    /// Abort segment exchanges that have stalled past the segment timeout.
    fn sweep_stalled(&self) {
        let cutoff = self.config.segment_timeout;

        let stalled: Vec<TxKey> = {
            let client = self.client.lock().expect("client lock");
            client
                .iter()
                .filter(|(_, tx)| {
                    (tx.sender.is_some() || tx.reassembly.is_some())
                        && tx.last_activity.elapsed() > cutoff
                })
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in stalled {
            self.finish_client(&key, Err(Error::SegmentationTimeout));
        }

        self.server_rx
            .lock()
            .expect("server lock")
            .retain(|_, assembly| assembly.last_activity.elapsed() <= cutoff);
        self.server_tx
            .lock()
            .expect("server lock")
            .retain(|_, response| response.last_activity.elapsed() <= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::{DataLinkError, ReceiveHook, Transport};
    use crate::error::{ErrorClass, ErrorCode};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// A pair of transports whose sends are delivered into each other's
    /// receive hooks.
    struct LinkedTransport {
        local: BacnetAddress,
        peer_hook: StdMutex<Option<ReceiveHook>>,
        hook: StdMutex<Option<ReceiveHook>>,
    }

    impl LinkedTransport {
        fn pair() -> (Arc<Self>, Arc<Self>) {
            let a = Arc::new(Self {
                local: "10.0.0.1:47808".parse().unwrap(),
                peer_hook: StdMutex::new(None),
                hook: StdMutex::new(None),
            });
            let b = Arc::new(Self {
                local: "10.0.0.2:47808".parse().unwrap(),
                peer_hook: StdMutex::new(None),
                hook: StdMutex::new(None),
            });
            (a, b)
        }

        fn link(a: &Arc<Self>, b: &Arc<Self>) {
            *a.peer_hook.lock().unwrap() = b.hook.lock().unwrap().clone();
            *b.peer_hook.lock().unwrap() = a.hook.lock().unwrap().clone();
        }
    }

    #[async_trait]
    impl Transport for LinkedTransport {
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
            _dest: &BacnetAddress,
        ) -> std::result::Result<(), DataLinkError> {
            if let Some(hook) = self.peer_hook.lock().unwrap().clone() {
                hook(Bytes::copy_from_slice(npdu), self.local.clone());
            }
            Ok(())
        }
        async fn send_broadcast(&self, npdu: &[u8]) -> std::result::Result<(), DataLinkError> {
            self.send_unicast(npdu, &BacnetAddress::local_broadcast()).await
        }
        fn local_address(&self) -> BacnetAddress {
            self.local.clone()
        }
        fn max_npdu_length(&self) -> usize {
            crate::datalink::MAX_NPDU_IP
        }
    }

    fn quick_config() -> TransactionConfig {
        TransactionConfig {
            apdu_timeout: Duration::from_millis(100),
            apdu_retries: 1,
            segment_timeout: Duration::from_millis(300),
            proposed_window_size: 4,
            max_apdu_length: 1476,
        }
    }

    async fn linked_managers() -> (Arc<TransactionManager>, Arc<TransactionManager>, BacnetAddress)
    {
        let (ta, tb) = LinkedTransport::pair();
        let net_a = Arc::new(NetworkLayer::new(ta.clone() as Arc<dyn Transport>));
        let net_b = Arc::new(NetworkLayer::new(tb.clone() as Arc<dyn Transport>));
        net_a.attach();
        net_b.attach();
        LinkedTransport::link(&ta, &tb);

        let tsm_a = TransactionManager::new(net_a, quick_config());
        let tsm_b = TransactionManager::new(net_b, quick_config());
        tsm_a.start();
        tsm_b.start();
        let b_addr = tb.local_address();
        (tsm_a, tsm_b, b_addr)
    }

    #[tokio::test]
    async fn confirmed_request_complex_ack() {
        let (client, server, server_addr) = linked_managers().await;
        server.set_confirmed_handler(Arc::new(|choice, data, _| {
            assert_eq!(choice, 12);
            assert_eq!(data, &[0x01, 0x02]);
            Ok(ServiceResponse::ComplexAck {
                service_choice: 12,
                data: vec![0xAA, 0xBB],
            })
        }));

        let outcome = client
            .confirmed_request(&server_addr, 12, vec![0x01, 0x02], 1476)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConfirmedOutcome::ComplexAck {
                service_choice: 12,
                service_data: vec![0xAA, 0xBB],
            }
        );
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn confirmed_request_simple_ack_and_error() {
        let (client, server, server_addr) = linked_managers().await;
        server.set_confirmed_handler(Arc::new(|choice, _, _| match choice {
            15 => Ok(ServiceResponse::SimpleAck),
            _ => Err(Error::Bacnet(BacnetError::new(
                ErrorClass::Object,
                ErrorCode::UnknownObject,
            ))),
        }));

        let ack = client
            .confirmed_request(&server_addr, 15, vec![], 1476)
            .await
            .unwrap();
        assert_eq!(ack, ConfirmedOutcome::SimpleAck { service_choice: 15 });

        let err = client
            .confirmed_request(&server_addr, 12, vec![], 1476)
            .await
            .unwrap_err();
        match err {
            Error::Bacnet(e) => {
                assert_eq!(e.class, ErrorClass::Object);
                assert_eq!(e.code, ErrorCode::UnknownObject);
            }
            other => panic!("expected BacnetError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_handler_yields_reject() {
        let (client, _server, server_addr) = linked_managers().await;
        let err = client
            .confirmed_request(&server_addr, 1, vec![], 1476)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Reject(RejectReason::UnrecognizedService)
        ));
    }

    #[tokio::test]
    async fn timeout_after_retries() {
        let (ta, _tb) = LinkedTransport::pair();
        // Never linked: every send vanishes.
        let net = Arc::new(NetworkLayer::new(ta as Arc<dyn Transport>));
        net.attach();
        let tsm = TransactionManager::new(net, quick_config());
        tsm.start();

        let dest: BacnetAddress = "10.0.0.9:47808".parse().unwrap();
        let started = Instant::now();
        let err = tsm.confirmed_request(&dest, 12, vec![], 1476).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // Two attempts of 100ms each.
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(tsm.pending_count(), 0);
    }

    #[tokio::test]
    async fn segmented_request_reassembled_by_server() {
        let (client, server, server_addr) = linked_managers().await;
        let body: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let expected = body.clone();
        server.set_confirmed_handler(Arc::new(move |_, data, _| {
            assert_eq!(data, &expected[..]);
            Ok(ServiceResponse::SimpleAck)
        }));

        // Peer limit 480 forces segmentation.
        let outcome = client
            .confirmed_request(&server_addr, 12, body, 480)
            .await
            .unwrap();
        assert_eq!(outcome, ConfirmedOutcome::SimpleAck { service_choice: 12 });
    }

    #[tokio::test]
    async fn segmented_response_reassembled_by_client() {
        let (client, server, server_addr) = linked_managers().await;
        let body: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        let body_for_server = body.clone();
        server.set_confirmed_handler(Arc::new(move |_, _, _| {
            Ok(ServiceResponse::ComplexAck {
                service_choice: 12,
                data: body_for_server.clone(),
            })
        }));

        let outcome = client
            .confirmed_request(&server_addr, 12, vec![], 480)
            .await
            .unwrap();
        match outcome {
            ConfirmedOutcome::ComplexAck { service_data, .. } => {
                assert_eq!(service_data, body);
            }
            other => panic!("expected ComplexAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unconfirmed_request_delivered() {
        let (client, server, _server_addr) = linked_managers().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.set_unconfirmed_handler(Arc::new(move |choice, data, _| {
            let _ = tx.send((choice, data.to_vec()));
        }));

        client
            .unconfirmed_request(&BacnetAddress::local_broadcast(), 8, vec![0x09, 0x1C])
            .await
            .unwrap();
        let (choice, data) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(choice, 8);
        assert_eq!(data, vec![0x09, 0x1C]);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending() {
        let (ta, _tb) = LinkedTransport::pair();
        let net = Arc::new(NetworkLayer::new(ta as Arc<dyn Transport>));
        net.attach();
        let tsm = TransactionManager::new(
            net,
            TransactionConfig {
                apdu_timeout: Duration::from_secs(30),
                ..quick_config()
            },
        );
        tsm.start();

        let dest: BacnetAddress = "10.0.0.9:47808".parse().unwrap();
        let tsm2 = tsm.clone();
        let pending = tokio::spawn(async move {
            tsm2.confirmed_request(&dest, 12, vec![], 1476).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tsm.shutdown();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
