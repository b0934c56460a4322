//! Application layer.
//!
//! [`Application`] assembles the stack: one or more data links, the network
//! layer, the transaction manager, the object database with its Device
//! object, and the COV manager. It dispatches inbound service requests to
//! the native implementations (ReadProperty, WriteProperty,
//! ReadPropertyMultiple, SubscribeCOV(Property), Who-Is/Who-Has) or to
//! caller-registered handlers, and exposes typed client helpers for the
//! standard services.
//!
//! Shutdown is ordered: pending transactions are cancelled, secure
//! connections disconnect gracefully, sockets close, and background tasks
//! are aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::datalink::bip::{BacnetIpConfig, BacnetIpTransport};
use crate::datalink::bip6::{BacnetIp6Config, BacnetIp6Transport};
use crate::datalink::ethernet::{EthernetTransport, FrameIo};
use crate::datalink::sc::transport::{ScNodeConfig, ScNodeTransport};
use crate::datalink::Transport;
use crate::error::{Error, Result};
use crate::network::address::BacnetAddress;
use crate::network::{NetworkLayer, NetworkPort};
use crate::object::cov::{CovConfig, CovManager, CovNotificationData, SubscriptionKey};
use crate::object::database::ObjectDatabase;
use crate::object::device::DeviceInfo;
use crate::object::{BacnetObject, ObjectIdentifier, PropertyIdentifier, PropertyValue};
use crate::service::{
    ConfirmedServiceChoice, CovNotification, IAm, IHave, ReadProperty, ReadPropertyAck,
    ReadPropertyMultiple, ReadPropertyMultipleAck, ReadAccessResult, ReadAccessResultElement,
    ReadAccessResultValue, SubscribeCov, SubscribeCovProperty, UnconfirmedServiceChoice, WhoHas,
    WhoHasSelector, WhoIs, WriteProperty,
};
use crate::transaction::{
    ConfirmedOutcome, ServiceResponse, TransactionConfig, TransactionManager,
};

/// Which data link the application speaks.
pub enum LinkConfig {
    /// BACnet/IP (Annex J), optionally with BBMD or foreign-device mode.
    Ipv4(BacnetIpConfig),
    /// BACnet/IPv6 (Annex U).
    Ipv6(BacnetIp6Config),
    /// ISO 8802-3 over an injected packet socket.
    Ethernet {
        local_mac: [u8; 6],
        io: Arc<dyn FrameIo>,
    },
    /// BACnet Secure Connect node (Annex AB).
    SecureConnect(ScNodeConfig),
}

/// Top-level device configuration. The link choice is an enum, so exactly
/// one data link is configured by construction.
pub struct DeviceConfig {
    pub device: DeviceInfo,
    pub link: LinkConfig,
    pub transactions: TransactionConfig,
    pub cov: CovConfig,
}

impl DeviceConfig {
    pub fn new(device: DeviceInfo, link: LinkConfig) -> Self {
        Self {
            device,
            link,
            transactions: TransactionConfig::default(),
            cov: CovConfig::default(),
        }
    }
}

/// One port of a routing node.
pub struct RouterPortConfig {
    pub id: u8,
    pub network_number: u16,
    pub link: LinkConfig,
}

/// Configuration for a multi-port router node.
pub struct RouterConfig {
    pub device: DeviceInfo,
    pub ports: Vec<RouterPortConfig>,
    /// Index into `ports` of the port the application itself speaks on.
    pub application_port: usize,
    pub transactions: TransactionConfig,
    pub cov: CovConfig,
}

/// Raw handler for confirmed services without a native implementation.
pub type RawConfirmedHandler =
    Arc<dyn Fn(&[u8], &BacnetAddress) -> Result<ServiceResponse> + Send + Sync>;

/// Raw handler for unconfirmed services without a native implementation.
pub type RawUnconfirmedHandler = Arc<dyn Fn(&[u8], &BacnetAddress) + Send + Sync>;

/// Handler invoked for received COV notifications (both forms).
pub type CovNotificationHandler = Arc<dyn Fn(CovNotification, BacnetAddress) + Send + Sync>;

async fn build_transport(link: LinkConfig) -> Result<Arc<dyn Transport>> {
    Ok(match link {
        LinkConfig::Ipv4(config) => BacnetIpTransport::bind(config).await? as Arc<dyn Transport>,
        LinkConfig::Ipv6(config) => BacnetIp6Transport::bind(config).await? as Arc<dyn Transport>,
        LinkConfig::Ethernet { local_mac, io } => {
            EthernetTransport::new(local_mac, io) as Arc<dyn Transport>
        }
        LinkConfig::SecureConnect(config) => {
            ScNodeTransport::new(config) as Arc<dyn Transport>
        }
    })
}

struct AppState {
    device_id: ObjectIdentifier,
    device_info: DeviceInfo,
    database: Arc<ObjectDatabase>,
    cov: Arc<CovManager>,
    tsm: Arc<TransactionManager>,
    /// Device instance -> (address, max APDU) learned from I-Am.
    address_cache: Mutex<HashMap<u32, (BacnetAddress, u32)>>,
    iam_events: tokio::sync::broadcast::Sender<(IAm, BacnetAddress)>,
    confirmed_handlers: RwLock<HashMap<u8, RawConfirmedHandler>>,
    unconfirmed_handlers: RwLock<HashMap<u8, RawUnconfirmedHandler>>,
    cov_handler: RwLock<Option<CovNotificationHandler>>,
}

/// A running BACnet application.
pub struct Application {
    state: Arc<AppState>,
    network: Arc<NetworkLayer>,
    transports: Vec<Arc<dyn Transport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Application {
    /// Build and start a single-link device application.
    pub async fn start(config: DeviceConfig) -> Result<Arc<Self>> {
        let transport = build_transport(config.link).await?;
        let network = Arc::new(NetworkLayer::new(transport.clone()));
        Self::finish_start(
            config.device,
            network,
            vec![transport],
            config.transactions,
            config.cov,
        )
        .await
    }

    /// Build and start a router application with multiple ports.
    pub async fn start_router(config: RouterConfig) -> Result<Arc<Self>> {
        if config.ports.is_empty() {
            return Err(Error::InvalidConfiguration("router needs at least one port".into()));
        }
        if config.application_port >= config.ports.len() {
            return Err(Error::InvalidConfiguration(
                "application port index out of range".into(),
            ));
        }
        let mut transports = Vec::new();
        let mut ports = Vec::new();
        for port in config.ports {
            let transport = build_transport(port.link).await?;
            transports.push(transport.clone());
            ports.push(NetworkPort {
                id: port.id,
                network_number: Some(port.network_number),
                transport,
            });
        }
        let network = Arc::new(NetworkLayer::with_ports(ports, config.application_port));
        Self::finish_start(
            config.device,
            network,
            transports,
            config.transactions,
            config.cov,
        )
        .await
    }

    async fn finish_start(
        device_info: DeviceInfo,
        network: Arc<NetworkLayer>,
        transports: Vec<Arc<dyn Transport>>,
        transactions: TransactionConfig,
        cov_config: CovConfig,
    ) -> Result<Arc<Self>> {
        network.attach();
        let tsm = TransactionManager::new(network.clone(), transactions);
        tsm.start();

        let database = ObjectDatabase::new(BacnetObject::device(&device_info));
        let device_id = database.device_id();
        let cov = CovManager::new(database.clone(), cov_config);
        cov.clone().attach();

        let (iam_events, _) = tokio::sync::broadcast::channel(64);
        let state = Arc::new(AppState {
            device_id,
            device_info,
            database,
            cov: cov.clone(),
            tsm: tsm.clone(),
            address_cache: Mutex::new(HashMap::new()),
            iam_events,
            confirmed_handlers: RwLock::new(HashMap::new()),
            unconfirmed_handlers: RwLock::new(HashMap::new()),
            cov_handler: RwLock::new(None),
        });

        // COV notifications leave through the normal request path.
        {
            let state_for_cov = Arc::downgrade(&state);
            cov.set_notifier(Arc::new(move |data: CovNotificationData| {
                let Some(state) = state_for_cov.upgrade() else { return };
                tokio::spawn(async move { state.deliver_cov_notification(data).await });
            }));
        }

        {
            let state_for_confirmed = state.clone();
            tsm.set_confirmed_handler(Arc::new(move |choice, data, source| {
                state_for_confirmed.handle_confirmed(choice, data, source)
            }));
        }
        {
            let state_for_unconfirmed = state.clone();
            tsm.set_unconfirmed_handler(Arc::new(move |choice, data, source| {
                state_for_unconfirmed.handle_unconfirmed(choice, data, source);
            }));
        }

        for transport in &transports {
            transport.start().await?;
        }

        let app = Arc::new(Self {
            state,
            network,
            transports,
            tasks: Mutex::new(Vec::new()),
        });
        app.tasks
            .lock()
            .expect("task lock")
            .push(tokio::spawn(cov.run_reaper()));
        Ok(app)
    }

    /// The object database.
    pub fn database(&self) -> &Arc<ObjectDatabase> {
        &self.state.database
    }

    /// The COV manager.
    pub fn cov(&self) -> &Arc<CovManager> {
        &self.state.cov
    }

    /// The local device identifier.
    pub fn device_id(&self) -> ObjectIdentifier {
        self.state.device_id
    }

    /// The application port's address.
    pub fn local_address(&self) -> BacnetAddress {
        self.network.local_address()
    }

    /// Add an object, purging nothing; see [`Self::remove_object`] for the
    /// inverse.
    pub fn add_object(&self, object: BacnetObject) -> Result<()> {
        self.state.database.add_object(object).map_err(Error::from)
    }

    /// Remove an object and purge its subscriptions.
    pub fn remove_object(&self, id: ObjectIdentifier) -> Result<()> {
        self.state.database.remove_object(id)?;
        self.state.cov.purge_object(id);
        Ok(())
    }

    /// Register a handler for a confirmed service the core does not
    /// implement natively.
    pub fn set_confirmed_handler(&self, choice: ConfirmedServiceChoice, handler: RawConfirmedHandler) {
        self.state
            .confirmed_handlers
            .write()
            .expect("handler lock")
            .insert(choice as u8, handler);
    }

    /// Register a handler for an unconfirmed service.
    pub fn set_unconfirmed_handler(
        &self,
        choice: UnconfirmedServiceChoice,
        handler: RawUnconfirmedHandler,
    ) {
        self.state
            .unconfirmed_handlers
            .write()
            .expect("handler lock")
            .insert(choice as u8, handler);
    }

    /// Register the sink for COV notifications received from peers.
    pub fn set_cov_notification_handler(&self, handler: CovNotificationHandler) {
        *self.state.cov_handler.write().expect("handler lock") = Some(handler);
    }

    /// Graceful shutdown: cancel transactions, stop links, stop tasks.
    pub async fn shutdown(&self) {
        self.state.tsm.shutdown();
        for transport in &self.transports {
            transport.stop().await;
        }
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
    }

    fn peer_max_apdu(&self, dest: &BacnetAddress) -> usize {
        let cache = self.state.address_cache.lock().expect("cache lock");
        cache
            .values()
            .find(|(address, _)| address == dest)
            .map(|(_, max_apdu)| *max_apdu as usize)
            .unwrap_or(1476)
    }

    /// Resolve a device instance to its address, from I-Am history.
    pub fn device_address(&self, instance: u32) -> Option<BacnetAddress> {
        self.state
            .address_cache
            .lock()
            .expect("cache lock")
            .get(&instance)
            .map(|(address, _)| address.clone())
    }

    // -- client helpers ----------------------------------------------------

    /// ReadProperty from a peer.
    pub async fn read_property(
        &self,
        dest: &BacnetAddress,
        object_id: ObjectIdentifier,
        property: PropertyIdentifier,
        array_index: Option<u32>,
    ) -> Result<PropertyValue> {
        let request = ReadProperty {
            object_id,
            property,
            array_index,
        };
        let outcome = self
            .state
            .tsm
            .confirmed_request(
                dest,
                ConfirmedServiceChoice::ReadProperty as u8,
                request.encode(),
                self.peer_max_apdu(dest),
            )
            .await?;
        match outcome {
            ConfirmedOutcome::ComplexAck { service_data, .. } => {
                Ok(ReadPropertyAck::decode(&service_data)?.value)
            }
            ConfirmedOutcome::SimpleAck { .. } => {
                Err(Error::InvalidConfiguration("unexpected SimpleACK for ReadProperty".into()))
            }
        }
    }

    /// WriteProperty on a peer.
    pub async fn write_property(
        &self,
        dest: &BacnetAddress,
        object_id: ObjectIdentifier,
        property: PropertyIdentifier,
        value: PropertyValue,
        priority: Option<u8>,
        array_index: Option<u32>,
    ) -> Result<()> {
        let request = WriteProperty {
            object_id,
            property,
            array_index,
            value,
            priority,
        };
        self.state
            .tsm
            .confirmed_request(
                dest,
                ConfirmedServiceChoice::WriteProperty as u8,
                request.encode(),
                self.peer_max_apdu(dest),
            )
            .await?;
        Ok(())
    }

    /// ReadPropertyMultiple from a peer.
    pub async fn read_property_multiple(
        &self,
        dest: &BacnetAddress,
        request: ReadPropertyMultiple,
    ) -> Result<ReadPropertyMultipleAck> {
        let outcome = self
            .state
            .tsm
            .confirmed_request(
                dest,
                ConfirmedServiceChoice::ReadPropertyMultiple as u8,
                request.encode(),
                self.peer_max_apdu(dest),
            )
            .await?;
        match outcome {
            ConfirmedOutcome::ComplexAck { service_data, .. } => {
                Ok(ReadPropertyMultipleAck::decode(&service_data)?)
            }
            ConfirmedOutcome::SimpleAck { .. } => Err(Error::InvalidConfiguration(
                "unexpected SimpleACK for ReadPropertyMultiple".into(),
            )),
        }
    }

    /// SubscribeCOV on a peer.
    pub async fn subscribe_cov(
        &self,
        dest: &BacnetAddress,
        process_id: u32,
        object_id: ObjectIdentifier,
        confirmed: bool,
        lifetime_seconds: u32,
    ) -> Result<()> {
        let request = SubscribeCov {
            process_id,
            object_id,
            confirmed: Some(confirmed),
            lifetime_seconds: Some(lifetime_seconds),
        };
        self.state
            .tsm
            .confirmed_request(
                dest,
                ConfirmedServiceChoice::SubscribeCov as u8,
                request.encode(),
                self.peer_max_apdu(dest),
            )
            .await?;
        Ok(())
    }

    /// Broadcast Who-Is and collect I-Am answers for `wait`.
    pub async fn who_is(&self, range: WhoIs, wait: Duration) -> Result<Vec<(IAm, BacnetAddress)>> {
        let mut events = self.state.iam_events.subscribe();
        self.state
            .tsm
            .unconfirmed_request(
                &BacnetAddress::global_broadcast(),
                UnconfirmedServiceChoice::WhoIs as u8,
                range.encode(),
            )
            .await?;

        let mut found = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(entry)) => found.push(entry),
                Ok(Err(_)) | Err(_) => break,
            }
        }
        Ok(found)
    }

    /// Announce this device with a broadcast I-Am.
    pub async fn announce(&self) -> Result<()> {
        let iam = self.state.local_iam();
        self.state
            .tsm
            .unconfirmed_request(
                &BacnetAddress::global_broadcast(),
                UnconfirmedServiceChoice::IAm as u8,
                iam.encode(),
            )
            .await
    }
}

impl AppState {
    fn local_iam(&self) -> IAm {
        IAm {
            device_id: self.device_id,
            max_apdu: self.device_info.max_apdu_length,
            segmentation: crate::object::device::segmentation::BOTH,
            vendor_id: self.device_info.vendor_identifier,
        }
    }

    /// Native dispatch of confirmed requests; falls through to raw
    /// handlers, then to Reject.
    fn handle_confirmed(
        &self,
        choice: u8,
        data: &[u8],
        source: &BacnetAddress,
    ) -> Result<ServiceResponse> {
        match ConfirmedServiceChoice::try_from(choice) {
            Ok(ConfirmedServiceChoice::ReadProperty) => self.serve_read_property(data),
            Ok(ConfirmedServiceChoice::WriteProperty) => self.serve_write_property(data),
            Ok(ConfirmedServiceChoice::ReadPropertyMultiple) => {
                self.serve_read_property_multiple(data)
            }
            Ok(ConfirmedServiceChoice::SubscribeCov) => self.serve_subscribe_cov(data, source),
            Ok(ConfirmedServiceChoice::SubscribeCovProperty) => {
                self.serve_subscribe_cov_property(data, source)
            }
            Ok(ConfirmedServiceChoice::ConfirmedCovNotification) => {
                if let Ok(notification) = CovNotification::decode(data) {
                    let handler = self.cov_handler.read().expect("handler lock").clone();
                    if let Some(handler) = handler {
                        handler(notification, source.clone());
                    }
                }
                Ok(ServiceResponse::SimpleAck)
            }
            _ => {
                let handler = self
                    .confirmed_handlers
                    .read()
                    .expect("handler lock")
                    .get(&choice)
                    .cloned();
                match handler {
                    Some(handler) => handler(data, source),
                    None => Err(Error::Reject(
                        crate::error::RejectReason::UnrecognizedService,
                    )),
                }
            }
        }
    }

    fn serve_read_property(&self, data: &[u8]) -> Result<ServiceResponse> {
        let request = ReadProperty::decode(data)
            .map_err(|_| Error::Reject(crate::error::RejectReason::InvalidTag))?;
        let value = self
            .database
            .read_property(request.object_id, request.property, request.array_index)
            .map_err(|err| Error::Bacnet(err.to_bacnet()))?;
        let ack = ReadPropertyAck {
            object_id: request.object_id,
            property: request.property,
            array_index: request.array_index,
            value,
        };
        Ok(ServiceResponse::ComplexAck {
            service_choice: ConfirmedServiceChoice::ReadProperty as u8,
            data: ack.encode(),
        })
    }

    fn serve_write_property(&self, data: &[u8]) -> Result<ServiceResponse> {
        let request = WriteProperty::decode(data)
            .map_err(|_| Error::Reject(crate::error::RejectReason::InvalidTag))?;
        self.database
            .write_property(
                request.object_id,
                request.property,
                request.value,
                request.priority,
                request.array_index,
            )
            .map_err(|err| Error::Bacnet(err.to_bacnet()))?;
        Ok(ServiceResponse::SimpleAck)
    }

    fn serve_read_property_multiple(&self, data: &[u8]) -> Result<ServiceResponse> {
        let request = ReadPropertyMultiple::decode(data)
            .map_err(|_| Error::Reject(crate::error::RejectReason::InvalidTag))?;
        let mut results = Vec::new();
        for spec in request.specifications {
            let mut elements = Vec::new();
            for reference in spec.properties {
                let outcome = self
                    .database
                    .read_property(spec.object_id, reference.property, reference.array_index);
                elements.push(ReadAccessResultElement {
                    property: reference.property,
                    array_index: reference.array_index,
                    result: match outcome {
                        Ok(value) => ReadAccessResultValue::Value(value),
                        Err(err) => ReadAccessResultValue::Error(err.to_bacnet()),
                    },
                });
            }
            results.push(ReadAccessResult {
                object_id: spec.object_id,
                elements,
            });
        }
        let ack = ReadPropertyMultipleAck { results };
        Ok(ServiceResponse::ComplexAck {
            service_choice: ConfirmedServiceChoice::ReadPropertyMultiple as u8,
            data: ack.encode(),
        })
    }

    fn serve_subscribe_cov(&self, data: &[u8], source: &BacnetAddress) -> Result<ServiceResponse> {
        let request = SubscribeCov::decode(data)
            .map_err(|_| Error::Reject(crate::error::RejectReason::InvalidTag))?;
        if request.is_cancellation() {
            self.cov.unsubscribe(&SubscriptionKey {
                subscriber: source.clone(),
                process_id: request.process_id,
                object_id: request.object_id,
                monitored: None,
            });
            return Ok(ServiceResponse::SimpleAck);
        }
        let lifetime = request
            .lifetime_seconds
            .filter(|seconds| *seconds > 0)
            .map(|seconds| Duration::from_secs(u64::from(seconds)));
        self.cov
            .subscribe_object(
                source.clone(),
                request.process_id,
                request.object_id,
                request.confirmed.unwrap_or(false),
                lifetime,
            )
            .map_err(|err| Error::Bacnet(err.to_bacnet()))?;
        Ok(ServiceResponse::SimpleAck)
    }

    fn serve_subscribe_cov_property(
        &self,
        data: &[u8],
        source: &BacnetAddress,
    ) -> Result<ServiceResponse> {
        let request = SubscribeCovProperty::decode(data)
            .map_err(|_| Error::Reject(crate::error::RejectReason::InvalidTag))?;
        if request.is_cancellation() {
            self.cov.unsubscribe(&SubscriptionKey {
                subscriber: source.clone(),
                process_id: request.process_id,
                object_id: request.object_id,
                monitored: Some((request.property, request.array_index)),
            });
            return Ok(ServiceResponse::SimpleAck);
        }
        let lifetime = request
            .lifetime_seconds
            .filter(|seconds| *seconds > 0)
            .map(|seconds| Duration::from_secs(u64::from(seconds)));
        self.cov
            .subscribe_property(
                source.clone(),
                request.process_id,
                request.object_id,
                request.property,
                request.array_index,
                request.cov_increment.map(f64::from),
                request.confirmed.unwrap_or(false),
                lifetime,
            )
            .map_err(|err| Error::Bacnet(err.to_bacnet()))?;
        Ok(ServiceResponse::SimpleAck)
    }

    fn handle_unconfirmed(&self, choice: u8, data: &[u8], source: &BacnetAddress) {
        match UnconfirmedServiceChoice::try_from(choice) {
            Ok(UnconfirmedServiceChoice::WhoIs) => {
                let Ok(request) = WhoIs::decode(data) else { return };
                if request.matches(self.device_id.instance) {
                    let iam = self.local_iam();
                    let tsm = self.tsm.clone();
                    let dest = source.clone();
                    tokio::spawn(async move {
                        let _ = tsm
                            .unconfirmed_request(
                                &dest,
                                UnconfirmedServiceChoice::IAm as u8,
                                iam.encode(),
                            )
                            .await;
                    });
                }
            }
            Ok(UnconfirmedServiceChoice::IAm) => {
                let Ok(iam) = IAm::decode(data) else { return };
                self.address_cache
                    .lock()
                    .expect("cache lock")
                    .insert(iam.device_id.instance, (source.clone(), iam.max_apdu));
                let _ = self.iam_events.send((iam, source.clone()));
            }
            Ok(UnconfirmedServiceChoice::WhoHas) => {
                let Ok(request) = WhoHas::decode(data) else { return };
                if let (Some(low), Some(high)) = (request.low_limit, request.high_limit) {
                    if !(low..=high).contains(&self.device_id.instance) {
                        return;
                    }
                }
                let hit = match &request.selector {
                    WhoHasSelector::ById(id) => {
                        self.database.contains(*id).then_some(*id)
                    }
                    WhoHasSelector::ByName(name) => self.database.find_by_name(name),
                };
                let Some(object_id) = hit else { return };
                let object_name = self
                    .database
                    .read_property(object_id, PropertyIdentifier::ObjectName, None)
                    .ok()
                    .and_then(|value| value.as_str().map(str::to_string))
                    .unwrap_or_default();
                let ihave = IHave {
                    device_id: self.device_id,
                    object_id,
                    object_name,
                };
                let tsm = self.tsm.clone();
                let dest = source.clone();
                tokio::spawn(async move {
                    let _ = tsm
                        .unconfirmed_request(
                            &dest,
                            UnconfirmedServiceChoice::IHave as u8,
                            ihave.encode(),
                        )
                        .await;
                });
            }
            Ok(UnconfirmedServiceChoice::UnconfirmedCovNotification) => {
                if let Ok(notification) = CovNotification::decode(data) {
                    let handler = self.cov_handler.read().expect("handler lock").clone();
                    if let Some(handler) = handler {
                        handler(notification, source.clone());
                    }
                }
            }
            _ => {
                let handler = self
                    .unconfirmed_handlers
                    .read()
                    .expect("handler lock")
                    .get(&choice)
                    .cloned();
                if let Some(handler) = handler {
                    handler(data, source);
                }
            }
        }
    }

    /// Send one COV notification through the request path. Confirmed
    /// failures are reported back to the manager, which keeps the
    /// subscription.
    async fn deliver_cov_notification(self: Arc<Self>, data: CovNotificationData) {
        let notification = CovNotification {
            process_id: data.process_id,
            initiating_device: self.device_id,
            object_id: data.object_id,
            time_remaining: data.time_remaining,
            values: data.values.clone(),
        };
        if data.confirmed {
            let result = self
                .tsm
                .confirmed_request(
                    &data.subscriber,
                    ConfirmedServiceChoice::ConfirmedCovNotification as u8,
                    notification.encode(),
                    1476,
                )
                .await;
            if let Err(err) = result {
                log::warn!("confirmed COV notification to {} failed: {err}", data.subscriber);
                self.cov.notification_failed(&SubscriptionKey {
                    subscriber: data.subscriber.clone(),
                    process_id: data.process_id,
                    object_id: data.object_id,
                    monitored: None,
                });
            }
        } else {
            let _ = self
                .tsm
                .unconfirmed_request(
                    &data.subscriber,
                    UnconfirmedServiceChoice::UnconfirmedCovNotification as u8,
                    notification.encode(),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, ErrorCode};
    use crate::object::analog::units;
    use crate::object::ObjectType;
    use crate::service::PropertyReference;
    use crate::service::ReadAccessSpecification;

    async fn loopback_app(instance: u32, name: &str) -> Arc<Application> {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = DeviceConfig::new(
            DeviceInfo::new(instance, name),
            LinkConfig::Ipv4(BacnetIpConfig {
                bind_address: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            }),
        );
        Application::start(config).await.unwrap()
    }

    #[tokio::test]
    async fn read_and_write_property_end_to_end() {
        let server = loopback_app(100, "server-100").await;
        let client = loopback_app(200, "client-200").await;

        server
            .add_object(BacnetObject::analog_value(1, "setpoint", units::PERCENT, Some(72.0)))
            .unwrap();

        let av = ObjectIdentifier::new(ObjectType::AnalogValue, 1);
        let server_addr = server.local_address();

        let value = client
            .read_property(&server_addr, av, PropertyIdentifier::PresentValue, None)
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::Real(72.0));

        client
            .write_property(
                &server_addr,
                av,
                PropertyIdentifier::PresentValue,
                PropertyValue::Real(50.0),
                Some(8),
                None,
            )
            .await
            .unwrap();
        let value = client
            .read_property(&server_addr, av, PropertyIdentifier::PresentValue, None)
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::Real(50.0));

        // Current command priority follows the write.
        let priority = client
            .read_property(&server_addr, av, PropertyIdentifier::CurrentCommandPriority, None)
            .await
            .unwrap();
        assert_eq!(priority, PropertyValue::Unsigned(8));

        server.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn read_unknown_object_surfaces_typed_error() {
        let server = loopback_app(101, "server-101").await;
        let client = loopback_app(201, "client-201").await;

        let missing = ObjectIdentifier::new(ObjectType::AnalogValue, 99);
        let err = client
            .read_property(
                &server.local_address(),
                missing,
                PropertyIdentifier::PresentValue,
                None,
            )
            .await
            .unwrap_err();
        match err {
            Error::Bacnet(e) => {
                assert_eq!(e.class, ErrorClass::Object);
                assert_eq!(e.code, ErrorCode::UnknownObject);
            }
            other => panic!("expected BacnetError, got {other:?}"),
        }

        server.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn read_property_multiple_mixed_results() {
        let server = loopback_app(102, "server-102").await;
        let client = loopback_app(202, "client-202").await;
        server
            .add_object(BacnetObject::analog_value(1, "av", units::PERCENT, None))
            .unwrap();

        let av = ObjectIdentifier::new(ObjectType::AnalogValue, 1);
        let ack = client
            .read_property_multiple(
                &server.local_address(),
                ReadPropertyMultiple {
                    specifications: vec![ReadAccessSpecification {
                        object_id: av,
                        properties: vec![
                            PropertyReference {
                                property: PropertyIdentifier::PresentValue,
                                array_index: None,
                            },
                            PropertyReference {
                                property: PropertyIdentifier::Other(4444),
                                array_index: None,
                            },
                        ],
                    }],
                },
            )
            .await
            .unwrap();

        assert_eq!(ack.results.len(), 1);
        let elements = &ack.results[0].elements;
        assert!(matches!(elements[0].result, ReadAccessResultValue::Value(_)));
        assert!(matches!(elements[1].result, ReadAccessResultValue::Error(_)));

        server.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn who_is_answered_with_i_am() {
        let server = loopback_app(103, "server-103").await;
        let client = loopback_app(203, "client-203").await;

        // Unicast Who-Is straight to the server; the I-Am lands in the
        // client's address cache.
        client
            .state
            .tsm
            .unconfirmed_request(
                &server.local_address(),
                UnconfirmedServiceChoice::WhoIs as u8,
                WhoIs::default().encode(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            client.device_address(103),
            Some(server.local_address())
        );

        // Out-of-range Who-Is stays unanswered.
        client
            .state
            .tsm
            .unconfirmed_request(
                &server.local_address(),
                UnconfirmedServiceChoice::WhoIs as u8,
                WhoIs {
                    low_limit: Some(5000),
                    high_limit: Some(6000),
                }
                .encode(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.device_address(5000).is_none());

        server.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn cov_subscription_delivers_notifications() {
        let server = loopback_app(104, "server-104").await;
        let client = loopback_app(204, "client-204").await;
        server
            .add_object(BacnetObject::analog_value(1, "temp", units::DEGREES_CELSIUS, Some(10.0)))
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.set_cov_notification_handler(Arc::new(move |notification, _| {
            let _ = tx.send(notification);
        }));

        let av = ObjectIdentifier::new(ObjectType::AnalogValue, 1);
        client
            .subscribe_cov(&server.local_address(), 7, av, false, 300)
            .await
            .unwrap();

        // Initial notification arrives first.
        let initial = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(initial.object_id, av);
        assert_eq!(initial.process_id, 7);

        // A change produces another one.
        server
            .database()
            .write_property(av, PropertyIdentifier::PresentValue, PropertyValue::Real(42.0), None, None)
            .unwrap();
        let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            update.values[0],
            (PropertyIdentifier::PresentValue, PropertyValue::Real(42.0))
        );

        server.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn who_has_answered_by_name() {
        let server = loopback_app(105, "server-105").await;
        let client = loopback_app(205, "client-205").await;
        server
            .add_object(BacnetObject::binary_value(2, "pump-status", None))
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client.set_unconfirmed_handler(
            UnconfirmedServiceChoice::IHave,
            Arc::new(move |data, _| {
                if let Ok(ihave) = IHave::decode(data) {
                    let _ = tx.send(ihave);
                }
            }),
        );

        client
            .state
            .tsm
            .unconfirmed_request(
                &server.local_address(),
                UnconfirmedServiceChoice::WhoHas as u8,
                WhoHas {
                    low_limit: None,
                    high_limit: None,
                    selector: WhoHasSelector::ByName("pump-status".into()),
                }
                .encode(),
            )
            .await
            .unwrap();

        let ihave = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ihave.object_id, ObjectIdentifier::new(ObjectType::BinaryValue, 2));
        assert_eq!(ihave.object_name, "pump-status");

        server.shutdown().await;
        client.shutdown().await;
    }
}
