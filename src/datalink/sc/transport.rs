//! BACnet/SC node transport.
//!
//! Implements the common [`Transport`] contract over a hub connection:
//! outbound NPDUs become Encapsulated-NPDU messages, broadcasts go to the
//! all-ones VMAC and are fanned out by the hub. A lost websocket triggers a
//! reconnect loop with exponential backoff; a NODE_DUPLICATE_VMAC NAK
//! re-rolls the local VMAC before the next attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_tungstenite::Connector;

use super::bvlc::ScFunction;
use super::connection::{ScConnection, ScConnectionConfig};
use super::websocket;
use super::{DeviceUuid, ScVmac, HUB_SUBPROTOCOL, SC_VMAC_LEN};
use crate::datalink::{dispatch_receive, DataLinkError, ReceiveHook, Result, Transport};
use crate::network::address::BacnetAddress;

/// BACnet/SC node configuration.
#[derive(Clone)]
pub struct ScNodeConfig {
    /// Hub websocket URI (`wss://hub.example:4443`).
    pub hub_uri: String,
    /// Local VMAC; random when unset, re-rolled on collision.
    pub vmac: Option<ScVmac>,
    /// Stable device UUID.
    pub uuid: DeviceUuid,
    /// Injected TLS context; `None` limits the URI to `ws://`.
    pub connector: Option<Connector>,
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
    /// Initial reconnect delay; doubles up to [`Self::max_backoff`].
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ScNodeConfig {
    pub fn new(hub_uri: impl Into<String>, uuid: DeviceUuid) -> Self {
        Self {
            hub_uri: hub_uri.into(),
            vmac: None,
            uuid,
            connector: None,
            max_bvlc_length: 6000,
            max_npdu_length: 1497,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

struct ScNodeInner {
    config: ScNodeConfig,
    vmac: Mutex<ScVmac>,
    vmac_collided: Arc<AtomicBool>,
    connection: Mutex<Option<Arc<ScConnection>>>,
    hook: Arc<RwLock<Option<ReceiveHook>>>,
    running: AtomicBool,
}

/// BACnet/SC data link driver (node role).
pub struct ScNodeTransport {
    inner: Arc<ScNodeInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ScNodeTransport {
    pub fn new(config: ScNodeConfig) -> Arc<Self> {
        let vmac = config.vmac.unwrap_or_else(ScVmac::random);
        Arc::new(Self {
            inner: Arc::new(ScNodeInner {
                config,
                vmac: Mutex::new(vmac),
                vmac_collided: Arc::new(AtomicBool::new(false)),
                connection: Mutex::new(None),
                hook: Arc::new(RwLock::new(None)),
                running: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current local VMAC (may change after collisions).
    pub fn vmac(&self) -> ScVmac {
        *self.inner.vmac.lock().expect("vmac lock")
    }

    /// Whether the hub connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.lock().expect("connection lock").is_some()
    }

    fn current_connection(&self) -> Result<Arc<ScConnection>> {
        self.inner
            .connection
            .lock()
            .expect("connection lock")
            .clone()
            .ok_or(DataLinkError::NotStarted)
    }
}

impl ScNodeInner {
    /// Connect, run until the connection dies, reconnect with backoff.
    async fn connect_loop(self: Arc<Self>) {
        let mut backoff = self.config.initial_backoff;
        while self.running.load(Ordering::SeqCst) {
            // A collision NAK on the previous attempt retires the VMAC.
            if self.vmac_collided.swap(false, Ordering::SeqCst) {
                let fresh = ScVmac::random();
                log::warn!("VMAC collision reported by hub; re-rolling to {fresh}");
                *self.vmac.lock().expect("vmac lock") = fresh;
            }

            match self.connect_once().await {
                Ok(()) => {
                    // Connection was up and then closed; restart promptly.
                    backoff = self.config.initial_backoff;
                }
                Err(err) => {
                    log::warn!(
                        "SC hub connection failed ({err}); retrying in {}s",
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let (sink, source) =
            websocket::connect(&self.config.hub_uri, HUB_SUBPROTOCOL, self.config.connector.clone())
                .await?;

        let collided = {
            let flag = self.vmac_collided.clone();
            Arc::new(move || {
                flag.store(true, Ordering::SeqCst);
            })
        };
        let config = ScConnectionConfig {
            max_bvlc_length: self.config.max_bvlc_length,
            max_npdu_length: self.config.max_npdu_length,
            on_vmac_collision: Some(collided),
            ..ScConnectionConfig::new(
                *self.vmac.lock().expect("vmac lock"),
                self.config.uuid,
            )
        };

        let connection = ScConnection::initiate(config, sink, source).await?;
        *self.connection.lock().expect("connection lock") = Some(connection.clone());

        let hook_slot = self.hook.clone();
        let result = connection
            .run(Arc::new(move |msg| {
                if msg.function != ScFunction::EncapsulatedNpdu {
                    log::debug!("ignoring {:?} from hub", msg.function);
                    return;
                }
                let Some(origin) = msg.originating else {
                    log::debug!("Encapsulated-NPDU without originating VMAC, dropping");
                    return;
                };
                let hook = hook_slot.read().expect("hook lock").clone();
                if let Some(hook) = hook {
                    dispatch_receive(
                        &hook,
                        Bytes::from(msg.payload),
                        BacnetAddress::local(origin.as_bytes().to_vec()),
                    );
                }
            }))
            .await;

        *self.connection.lock().expect("connection lock") = None;
        result
    }
}

#[async_trait]
impl Transport for ScNodeTransport {
    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.clone();
        self.tasks
            .lock()
            .expect("task lock")
            .push(tokio::spawn(inner.connect_loop()));
        Ok(())
    }

    async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let connection = self.inner.connection.lock().expect("connection lock").clone();
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        *self.inner.connection.lock().expect("connection lock") = None;
    }

    fn set_receive_hook(&self, hook: ReceiveHook) {
        *self.inner.hook.write().expect("hook lock") = Some(hook);
    }

    async fn send_unicast(&self, npdu: &[u8], dest: &BacnetAddress) -> Result<()> {
        if dest.mac.len() != SC_VMAC_LEN {
            return Err(DataLinkError::BadDestination(dest.clone()));
        }
        if npdu.len() > self.max_npdu_length() {
            return Err(DataLinkError::FrameTooLarge(npdu.len()));
        }
        let vmac = ScVmac::try_from(dest.mac.as_slice())?;
        self.current_connection()?.send_npdu(npdu, Some(vmac)).await
    }

    async fn send_broadcast(&self, npdu: &[u8]) -> Result<()> {
        if npdu.len() > self.max_npdu_length() {
            return Err(DataLinkError::FrameTooLarge(npdu.len()));
        }
        self.current_connection()?
            .send_npdu(npdu, Some(ScVmac::BROADCAST))
            .await
    }

    fn local_address(&self) -> BacnetAddress {
        BacnetAddress::local(self.vmac().as_bytes().to_vec())
    }

    fn max_npdu_length(&self) -> usize {
        self.inner.config.max_npdu_length as usize
    }
}
