//! The application: objects, device discovery, client services, and the
//! dispatch of incoming requests to their handlers
//!
//! An [`Application`] sits on top of one [`Asap`]/[`Nsap`] pair. Client
//! calls (`who_is`, `read_property`, ...) build the service parameters,
//! run the confirmed-service machinery, and decode the ack against the
//! vendor registry. Incoming requests dispatch on the service choice to a
//! `do_*` handler; handler errors become Error/Reject/Abort PDUs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    apdu::{
        ConfirmedService, ErrorClass, ErrorCode, RejectReason, Segmentation, UnconfirmedService,
    },
    constructed::{Any, PropertyValue, TypeSpec},
    cov::{CovClient, CovServer},
    error::{Error, Result},
    link::DataLink,
    network::Nsap,
    object::{Object, ObjectClass, PropertyIdentifier, VendorRegistry},
    pdu::Address,
    primitives::{Enumerated, ObjectIdentifier},
    service::{
        IAm, IHave, PropertyResult, ReadAccessResult, ReadProperty, ReadPropertyAck,
        ReadPropertyMultiple, ReadPropertyMultipleAck, ReadRange, ReadRangeAck, ReadRangeSpec,
        ReadResult, ServiceParameters, SubscribeCov, WhoHas, WhoHasObject, WhoIs, WriteProperty,
        WritePropertyMultiple, status_flags,
    },
    tsm::{Asap, AsapConfig, IncomingApdu, IncomingRequest, IncomingUnconfirmed, Response},
};

/// collection window for Who-Is and Who-Has
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// What the host must provide to stand up a device
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// device object instance number
    pub device_instance: u32,
    /// device object name
    pub device_name: String,
    /// our vendor identifier
    pub vendor_identifier: u16,
    /// model-name property
    pub model_name: String,
    /// firmware-revision property
    pub firmware_revision: String,
    /// application-software-version property
    pub application_software_version: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            device_instance: 0,
            device_name: "bacproto".into(),
            vendor_identifier: 0,
            model_name: "bacproto".into(),
            firmware_revision: env!("CARGO_PKG_VERSION").into(),
            application_software_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Everything the stack knows about a peer device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_instance: u32,
    pub address: Address,
    pub max_apdu_length_accepted: u16,
    pub segmentation_supported: Segmentation,
    pub vendor_identifier: u16,
    /// 0 = unspecified
    pub max_segments_accepted: u8,
    pub max_npdu_length: Option<u16>,
    ref_count: u32,
}

/// In-memory device-info database, indexed by instance and by address.
///
/// Records are reference-counted while a transaction state machine holds
/// them; a held record is refreshed in place rather than evicted.
#[derive(Debug, Default)]
pub struct DeviceInfoCache {
    by_instance: HashMap<u32, Address>,
    by_address: HashMap<Address, DeviceInfo>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// record (or refresh) a peer from its I-Am
    pub fn update_from_i_am(&mut self, address: Address, i_am: &IAm) {
        let instance = i_am.device_identifier.instance;
        // an instance moving to a new address invalidates the old record
        if let Some(old_address) = self.by_instance.get(&instance)
            && *old_address != address
        {
            let held = self
                .by_address
                .get(old_address)
                .map(|info| info.ref_count > 0)
                .unwrap_or(false);
            if !held {
                self.by_address.remove(old_address);
            }
        }
        let ref_count = self
            .by_address
            .get(&address)
            .map(|info| info.ref_count)
            .unwrap_or(0);
        self.by_instance.insert(instance, address.clone());
        self.by_address.insert(
            address.clone(),
            DeviceInfo {
                device_instance: instance,
                address,
                max_apdu_length_accepted: i_am.max_apdu_length_accepted,
                segmentation_supported: i_am.segmentation_supported,
                vendor_identifier: i_am.vendor_identifier,
                max_segments_accepted: 0,
                max_npdu_length: None,
                ref_count,
            },
        );
    }

    /// look up by device instance
    pub fn get_by_instance(&self, instance: u32) -> Option<&DeviceInfo> {
        self.by_address.get(self.by_instance.get(&instance)?)
    }

    /// look up by address
    pub fn get_by_address(&self, address: &Address) -> Option<&DeviceInfo> {
        self.by_address.get(address)
    }

    /// take a reference for a transaction's lifetime
    pub fn acquire_by_address(&mut self, address: &Address) -> Option<DeviceInfo> {
        let info = self.by_address.get_mut(address)?;
        info.ref_count += 1;
        Some(info.clone())
    }

    /// release a transaction's reference
    pub fn release(&mut self, address: &Address) {
        if let Some(info) = self.by_address.get_mut(address) {
            info.ref_count = info.ref_count.saturating_sub(1);
        }
    }

    /// number of known devices
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    /// true when no devices are known
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

struct WhoIsQuery {
    id: u64,
    filter: WhoIs,
    address: Option<Address>,
    results: Vec<IAm>,
    tx: Option<oneshot::Sender<Vec<IAm>>>,
}

struct WhoHasQuery {
    id: u64,
    object: WhoHasObject,
    low_limit: Option<u32>,
    high_limit: Option<u32>,
    results: Vec<IHave>,
    tx: Option<oneshot::Sender<Vec<IHave>>>,
}

/// A BACnet application: the top of the stack
pub struct Application {
    config: DeviceConfig,
    vendor_registry: Arc<VendorRegistry>,
    nsap: Arc<Nsap>,
    asap: Arc<Asap>,
    device_info: Arc<Mutex<DeviceInfoCache>>,
    objects: Mutex<HashMap<ObjectIdentifier, Arc<Object>>>,
    who_is_queries: Mutex<Vec<WhoIsQuery>>,
    who_has_queries: Mutex<Vec<WhoHasQuery>>,
    query_counter: Mutex<u64>,
    pub(crate) cov_client: CovClient,
    pub(crate) cov_server: CovServer,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Application {
    /// build an application over a fresh NSAP with the standard registry
    pub fn new(config: DeviceConfig) -> Arc<Self> {
        Self::with_registry(config, Arc::new(VendorRegistry::standard()), AsapConfig::default())
    }

    /// build with explicit vendor registry and ASAP tuning
    pub fn with_registry(
        config: DeviceConfig,
        vendor_registry: Arc<VendorRegistry>,
        asap_config: AsapConfig,
    ) -> Arc<Self> {
        let nsap = Arc::new(Nsap::new());
        let device_info = Arc::new(Mutex::new(DeviceInfoCache::new()));
        let asap = Asap::new(asap_config, nsap.clone(), device_info.clone());
        let app = Arc::new(Application {
            config,
            vendor_registry,
            nsap,
            asap,
            device_info,
            objects: Mutex::new(HashMap::new()),
            who_is_queries: Mutex::new(Vec::new()),
            who_has_queries: Mutex::new(Vec::new()),
            query_counter: Mutex::new(0),
            cov_client: CovClient::new(),
            cov_server: CovServer::new(),
            pump: Mutex::new(None),
        });
        app.add_device_object();
        app
    }

    fn add_device_object(&self) {
        let class = self
            .vendor_registry
            .vendor_info(self.config.vendor_identifier)
            .object_class(crate::object::ObjectType::Device)
            .expect("device class always registered");
        let id = ObjectIdentifier::device(self.config.device_instance);
        let object = Object::new(id, class)
            .with_value(
                PropertyIdentifier::ObjectName,
                PropertyValue::CharacterString(self.config.device_name.clone()),
            )
            .with_value(
                PropertyIdentifier::VendorIdentifier,
                PropertyValue::Unsigned(self.config.vendor_identifier.into()),
            )
            .with_value(
                PropertyIdentifier::VendorName,
                PropertyValue::CharacterString("bacproto".into()),
            )
            .with_value(
                PropertyIdentifier::ModelName,
                PropertyValue::CharacterString(self.config.model_name.clone()),
            )
            .with_value(
                PropertyIdentifier::FirmwareRevision,
                PropertyValue::CharacterString(self.config.firmware_revision.clone()),
            )
            .with_value(
                PropertyIdentifier::ApplicationSoftwareVersion,
                PropertyValue::CharacterString(self.config.application_software_version.clone()),
            )
            .with_value(
                PropertyIdentifier::SystemStatus,
                PropertyValue::Enumerated(Enumerated(0)),
            )
            .with_value(PropertyIdentifier::ProtocolVersion, PropertyValue::Unsigned(1))
            .with_value(PropertyIdentifier::ProtocolRevision, PropertyValue::Unsigned(22))
            .with_value(
                PropertyIdentifier::MaxApduLengthAccepted,
                PropertyValue::Unsigned(1476),
            )
            .with_value(
                PropertyIdentifier::SegmentationSupported,
                PropertyValue::Enumerated(Segmentation::SegmentedBoth.to_enumerated()),
            )
            .with_value(PropertyIdentifier::ApduTimeout, PropertyValue::Unsigned(3000))
            .with_value(
                PropertyIdentifier::ApduSegmentTimeout,
                PropertyValue::Unsigned(2000),
            )
            .with_value(
                PropertyIdentifier::NumberOfApduRetries,
                PropertyValue::Unsigned(3),
            )
            .with_value(PropertyIdentifier::DatabaseRevision, PropertyValue::Unsigned(1))
            .with_value(
                PropertyIdentifier::DeviceAddressBinding,
                PropertyValue::List(vec![]),
            );
        self.objects.lock().expect("poisoned").insert(id, Arc::new(object));
    }

    /// attach a data link as the adapter for `net`
    pub fn bind_link(&self, net: Option<u16>, link: Arc<dyn DataLink>) -> Result<()> {
        self.nsap.bind(net, link)
    }

    /// the network layer, for routing-table queries and diagnostics
    pub fn nsap(&self) -> &Arc<Nsap> {
        &self.nsap
    }

    /// the device-info cache
    pub fn device_info(&self) -> &Arc<Mutex<DeviceInfoCache>> {
        &self.device_info
    }

    /// the vendor registry
    pub fn vendor_registry(&self) -> &Arc<VendorRegistry> {
        &self.vendor_registry
    }

    /// our device object identifier
    pub fn device_id(&self) -> ObjectIdentifier {
        ObjectIdentifier::device(self.config.device_instance)
    }

    /// start the stack: ASAP pump below, dispatch pump here
    pub fn start(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<IncomingApdu>(64);
        self.asap.start(tx);
        let app = self.clone();
        *self.pump.lock().expect("poisoned") = Some(tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                app.dispatch(incoming).await;
            }
        }));
    }

    /// stop pumps and fail outstanding requests
    pub fn stop(&self) {
        if let Some(pump) = self.pump.lock().expect("poisoned").take() {
            pump.abort();
        }
        self.asap.stop();
        self.nsap.stop();
    }

    // ---- objects ------------------------------------------------------

    /// add an object; replaces any object with the same identifier
    pub fn add_object(&self, object: Object) -> Arc<Object> {
        let object = Arc::new(object);
        self.objects
            .lock()
            .expect("poisoned")
            .insert(object.id(), object.clone());
        object
    }

    /// look up an object
    pub fn object(&self, id: ObjectIdentifier) -> Option<Arc<Object>> {
        self.objects.lock().expect("poisoned").get(&id).cloned()
    }

    /// object identifiers, sorted
    pub fn object_list(&self) -> Vec<ObjectIdentifier> {
        let mut ids: Vec<_> = self.objects.lock().expect("poisoned").keys().copied().collect();
        ids.sort();
        ids
    }

    /// Update a property from the device's own process and run COV
    /// detection; peer writes come in through WriteProperty instead
    pub async fn local_write(
        self: &Arc<Self>,
        id: ObjectIdentifier,
        property: PropertyIdentifier,
        value: PropertyValue,
    ) -> Result<()> {
        let object = self.object(id).ok_or_else(|| {
            Error::execution(ErrorClass::Object, ErrorCode::UnknownObject)
        })?;
        object.set_value(property, value);
        self.property_changed(id, property).await;
        Ok(())
    }

    /// fan COV notifications out after a property change
    pub(crate) async fn property_changed(
        self: &Arc<Self>,
        id: ObjectIdentifier,
        property: PropertyIdentifier,
    ) {
        if !matches!(
            property,
            PropertyIdentifier::PresentValue | PropertyIdentifier::StatusFlags
        ) {
            return;
        }
        let Some(object) = self.object(id) else { return };
        let present = object
            .read_property(PropertyIdentifier::PresentValue, None)
            .await
            .ok();
        let flags = object
            .read_property(PropertyIdentifier::StatusFlags, None)
            .await
            .unwrap_or(PropertyValue::BitString(status_flags(
                false, false, false, false,
            )));
        if let Some(present) = present {
            self.cov_server
                .notify_subscribers(self, id, present, flags)
                .await;
        }
    }

    // ---- discovery ----------------------------------------------------

    fn next_query_id(&self) -> u64 {
        let mut counter = self.query_counter.lock().expect("poisoned");
        *counter += 1;
        *counter
    }

    /// Send Who-Is and collect I-Ams for the discovery window. A
    /// single-instance query (low == high) resolves on the first match.
    pub async fn who_is(
        self: &Arc<Self>,
        low: Option<u32>,
        high: Option<u32>,
        address: Option<Address>,
    ) -> Result<Vec<IAm>> {
        let filter = WhoIs {
            low_limit: low,
            high_limit: high,
        };
        let destination = address.clone().unwrap_or_else(Address::global_broadcast);
        let id = self.next_query_id();
        let (tx, rx) = oneshot::channel();
        self.who_is_queries.lock().expect("poisoned").push(WhoIsQuery {
            id,
            filter: filter.clone(),
            address,
            results: Vec::new(),
            tx: Some(tx),
        });

        self.asap
            .send_unconfirmed(&destination, UnconfirmedService::WhoIs, filter.to_bytes()?)
            .await?;

        let app = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCOVERY_TIMEOUT).await;
            let mut queries = app.who_is_queries.lock().expect("poisoned");
            if let Some(pos) = queries.iter().position(|q| q.id == id) {
                let mut query = queries.remove(pos);
                if let Some(tx) = query.tx.take() {
                    let _ = tx.send(std::mem::take(&mut query.results));
                }
            }
        });

        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Send Who-Has and collect I-Haves for the discovery window
    pub async fn who_has(
        self: &Arc<Self>,
        low: Option<u32>,
        high: Option<u32>,
        object: WhoHasObject,
        address: Option<Address>,
    ) -> Result<Vec<IHave>> {
        let destination = address.unwrap_or_else(Address::global_broadcast);
        let id = self.next_query_id();
        let (tx, rx) = oneshot::channel();
        self.who_has_queries
            .lock()
            .expect("poisoned")
            .push(WhoHasQuery {
                id,
                object: object.clone(),
                low_limit: low,
                high_limit: high,
                results: Vec::new(),
                tx: Some(tx),
            });

        let request = WhoHas {
            low_limit: low,
            high_limit: high,
            object,
        };
        self.asap
            .send_unconfirmed(&destination, UnconfirmedService::WhoHas, request.to_bytes()?)
            .await?;

        let app = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISCOVERY_TIMEOUT).await;
            let mut queries = app.who_has_queries.lock().expect("poisoned");
            if let Some(pos) = queries.iter().position(|q| q.id == id) {
                let mut query = queries.remove(pos);
                if let Some(tx) = query.tx.take() {
                    let _ = tx.send(std::mem::take(&mut query.results));
                }
            }
        });

        rx.await.map_err(|_| Error::Cancelled)
    }

    // ---- confirmed client services -------------------------------------

    async fn confirmed(
        self: &Arc<Self>,
        peer: &Address,
        service: ConfirmedService,
        parameters: Vec<u8>,
    ) -> Result<Option<Vec<u8>>> {
        let rx = self
            .asap
            .request(peer.clone(), service, parameters)
            .await?;
        match rx.await.map_err(|_| Error::Cancelled)?? {
            Some(ack) => Ok(Some(ack.parameters)),
            None => Ok(None),
        }
    }

    /// the declared type for a peer's property, from its vendor's tables
    pub(crate) fn declared_type(
        &self,
        peer: &Address,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        index: Option<u32>,
    ) -> Option<TypeSpec> {
        let vendor_id = self
            .device_info
            .lock()
            .expect("poisoned")
            .get_by_address(peer)
            .map(|info| info.vendor_identifier)
            .unwrap_or(0);
        let class = self
            .vendor_registry
            .vendor_info(vendor_id)
            .object_class(object.object_type)?;
        let declared = class.get_property_type(property)?.clone();
        match index {
            None => Some(declared),
            Some(i) => declared.at_index(i),
        }
    }

    /// ReadProperty: returns the value decoded against the declared type,
    /// or the raw construction when the type is unknown
    pub async fn read_property(
        self: &Arc<Self>,
        peer: &Address,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        index: Option<u32>,
    ) -> Result<PropertyValue> {
        let mut request = ReadProperty::new(object, property);
        request.property_array_index = index;
        let parameters = self
            .confirmed(peer, ConfirmedService::ReadProperty, request.to_bytes()?)
            .await?
            .ok_or(Error::Reject(RejectReason::MissingRequiredParameter))?;
        let ack = ReadPropertyAck::from_bytes(&parameters)?;
        let spec = self
            .declared_type(peer, ack.object_identifier, ack.property_identifier, ack.property_array_index)
            .unwrap_or(TypeSpec::Opaque);
        Ok(ack.property_value.decode_as(&spec)?)
    }

    /// WriteProperty; `Null` relinquishes and needs a priority
    pub async fn write_property(
        self: &Arc<Self>,
        peer: &Address,
        object: ObjectIdentifier,
        property: PropertyIdentifier,
        value: PropertyValue,
        index: Option<u32>,
        priority: Option<u8>,
    ) -> Result<()> {
        if matches!(value, PropertyValue::Null) && priority.is_none() {
            return Err(Error::Reject(RejectReason::InvalidParameterDataType));
        }
        let request = WriteProperty {
            object_identifier: object,
            property_identifier: property,
            property_array_index: index,
            property_value: Any::from_value(&value)?,
            priority,
        };
        self.confirmed(peer, ConfirmedService::WriteProperty, request.to_bytes()?)
            .await?;
        Ok(())
    }

    /// ReadPropertyMultiple
    pub async fn read_property_multiple(
        self: &Arc<Self>,
        peer: &Address,
        request: ReadPropertyMultiple,
    ) -> Result<ReadPropertyMultipleAck> {
        let parameters = self
            .confirmed(
                peer,
                ConfirmedService::ReadPropertyMultiple,
                request.to_bytes()?,
            )
            .await?
            .ok_or(Error::Reject(RejectReason::MissingRequiredParameter))?;
        Ok(ReadPropertyMultipleAck::from_bytes(&parameters)?)
    }

    /// WritePropertyMultiple
    pub async fn write_property_multiple(
        self: &Arc<Self>,
        peer: &Address,
        request: WritePropertyMultiple,
    ) -> Result<()> {
        self.confirmed(
            peer,
            ConfirmedService::WritePropertyMultiple,
            request.to_bytes()?,
        )
        .await?;
        Ok(())
    }

    /// ReadRange
    pub async fn read_range(
        self: &Arc<Self>,
        peer: &Address,
        request: ReadRange,
    ) -> Result<ReadRangeAck> {
        let parameters = self
            .confirmed(peer, ConfirmedService::ReadRange, request.to_bytes()?)
            .await?
            .ok_or(Error::Reject(RejectReason::MissingRequiredParameter))?;
        Ok(ReadRangeAck::from_bytes(&parameters)?)
    }

    /// the ASAP, used by the COV machinery
    pub(crate) fn asap(&self) -> &Arc<Asap> {
        &self.asap
    }

    // ---- dispatch -----------------------------------------------------

    async fn dispatch(self: &Arc<Self>, incoming: IncomingApdu) {
        match incoming {
            IncomingApdu::Unconfirmed(request) => self.dispatch_unconfirmed(request).await,
            IncomingApdu::Confirmed(request) => {
                let peer = request.source.clone();
                let invoke_id = request.invoke_id;
                let response = self.dispatch_confirmed(request).await;
                if let Err(e) = self.asap.respond(&peer, invoke_id, response).await {
                    warn!("response to {peer:?} failed: {e}");
                }
            }
        }
    }

    async fn dispatch_unconfirmed(self: &Arc<Self>, request: IncomingUnconfirmed) {
        let result = match request.service {
            UnconfirmedService::WhoIs => self.do_who_is(&request).await,
            UnconfirmedService::IAm => self.do_i_am(&request),
            UnconfirmedService::WhoHas => self.do_who_has(&request).await,
            UnconfirmedService::IHave => self.do_i_have(&request),
            UnconfirmedService::UnconfirmedCovNotification => {
                self.do_cov_notification(&request, false).await
            }
            UnconfirmedService::TimeSynchronization
            | UnconfirmedService::UtcTimeSynchronization => Ok(()),
            other => {
                debug!("no handler for unconfirmed service {other:?}");
                Ok(())
            }
        };
        // unconfirmed handler failures are logged and swallowed
        if let Err(e) = result {
            debug!("unconfirmed {:?} from {:?}: {e}", request.service, request.source);
        }
    }

    async fn dispatch_confirmed(self: &Arc<Self>, request: IncomingRequest) -> Response {
        let result = match request.service {
            ConfirmedService::ReadProperty => self.do_read_property(&request).await,
            ConfirmedService::ReadPropertyMultiple => {
                self.do_read_property_multiple(&request).await
            }
            ConfirmedService::WriteProperty => self.do_write_property(&request).await,
            ConfirmedService::WritePropertyMultiple => {
                self.do_write_property_multiple(&request).await
            }
            ConfirmedService::SubscribeCov => self.do_subscribe_cov(&request).await,
            ConfirmedService::ConfirmedCovNotification => {
                self.do_confirmed_cov_notification(&request).await
            }
            ConfirmedService::ReadRange => self.do_read_range(&request).await,
            _ => Ok(Response::Reject(RejectReason::UnrecognizedService)),
        };
        match result {
            Ok(response) => response,
            Err(Error::Execution { class, code }) => Response::Error(class, code),
            Err(Error::Reject(reason)) => Response::Reject(reason),
            Err(Error::Abort(reason)) => Response::Abort(reason),
            Err(Error::Decode(e)) => {
                debug!("decode failure in confirmed request: {e}");
                Response::Reject(RejectReason::InvalidTag)
            }
            Err(e) => {
                warn!("handler failure: {e}");
                Response::Error(ErrorClass::Device, ErrorCode::OperationalProblem)
            }
        }
    }

    // ---- unconfirmed handlers ------------------------------------------

    async fn do_who_is(self: &Arc<Self>, request: &IncomingUnconfirmed) -> Result<()> {
        let who_is = WhoIs::from_bytes(&request.parameters)?;
        if !who_is.matches(self.config.device_instance) {
            return Ok(());
        }
        let i_am = IAm {
            device_identifier: self.device_id(),
            max_apdu_length_accepted: 1476,
            segmentation_supported: Segmentation::SegmentedBoth,
            vendor_identifier: self.config.vendor_identifier,
        };
        self.asap
            .send_unconfirmed(&request.source, UnconfirmedService::IAm, i_am.to_bytes()?)
            .await
    }

    fn do_i_am(self: &Arc<Self>, request: &IncomingUnconfirmed) -> Result<()> {
        let i_am = IAm::from_bytes(&request.parameters)?;
        self.device_info
            .lock()
            .expect("poisoned")
            .update_from_i_am(request.source.clone(), &i_am);

        let mut queries = self.who_is_queries.lock().expect("poisoned");
        let mut index = 0;
        while index < queries.len() {
            let query = &mut queries[index];
            let instance = i_am.device_identifier.instance;
            let address_match = query
                .address
                .as_ref()
                .map(|a| !a.is_broadcast() && *a == request.source || a.is_broadcast())
                .unwrap_or(true);
            if query.filter.matches(instance) && address_match {
                query.results.push(i_am.clone());
                // a single-instance query resolves on first match
                let single = query.filter.low_limit.is_some()
                    && query.filter.low_limit == query.filter.high_limit;
                if single {
                    let mut query = queries.remove(index);
                    if let Some(tx) = query.tx.take() {
                        let _ = tx.send(std::mem::take(&mut query.results));
                    }
                    continue;
                }
            }
            index += 1;
        }
        Ok(())
    }

    async fn do_who_has(self: &Arc<Self>, request: &IncomingUnconfirmed) -> Result<()> {
        let who_has = WhoHas::from_bytes(&request.parameters)?;
        if let (Some(low), Some(high)) = (who_has.low_limit, who_has.high_limit)
            && !(low..=high).contains(&self.config.device_instance)
        {
            return Ok(());
        }
        let matched = {
            let objects = self.objects.lock().expect("poisoned");
            match &who_has.object {
                WhoHasObject::Identifier(id) => objects.get(&id).cloned(),
                WhoHasObject::Name(name) => objects
                    .values()
                    .find(|o| o.object_name().as_deref() == Some(&name))
                    .cloned(),
            }
        };
        let Some(object) = matched else { return Ok(()) };
        let i_have = IHave {
            device_identifier: self.device_id(),
            object_identifier: object.id(),
            object_name: object.object_name().unwrap_or_default(),
        };
        self.asap
            .send_unconfirmed(&request.source, UnconfirmedService::IHave, i_have.to_bytes()?)
            .await
    }

    fn do_i_have(self: &Arc<Self>, request: &IncomingUnconfirmed) -> Result<()> {
        let i_have = IHave::from_bytes(&request.parameters)?;
        let mut queries = self.who_has_queries.lock().expect("poisoned");
        let mut index = 0;
        while index < queries.len() {
            let query = &mut queries[index];
            let device_instance = i_have.device_identifier.instance;
            let in_range = match (query.low_limit, query.high_limit) {
                (Some(low), Some(high)) => (low..=high).contains(&device_instance),
                _ => true,
            };
            let object_match = match &query.object {
                WhoHasObject::Identifier(id) => *id == i_have.object_identifier,
                WhoHasObject::Name(name) => *name == i_have.object_name,
            };
            if in_range && object_match {
                query.results.push(i_have.clone());
                let mut query = queries.remove(index);
                if let Some(tx) = query.tx.take() {
                    let _ = tx.send(std::mem::take(&mut query.results));
                }
                continue;
            }
            index += 1;
        }
        Ok(())
    }

    async fn do_cov_notification(
        self: &Arc<Self>,
        request: &IncomingUnconfirmed,
        _confirmed: bool,
    ) -> Result<()> {
        let notification =
            crate::service::CovNotification::from_bytes(&request.parameters)?;
        self.cov_client.deliver(&request.source, notification);
        Ok(())
    }

    // ---- confirmed handlers --------------------------------------------

    fn lookup_object(&self, id: ObjectIdentifier) -> Result<Arc<Object>> {
        self.object(id)
            .ok_or_else(|| Error::execution(ErrorClass::Object, ErrorCode::UnknownObject))
    }

    /// read one property into an Any, including the synthesized ones
    async fn read_to_any(
        self: &Arc<Self>,
        object: &Arc<Object>,
        property: PropertyIdentifier,
        index: Option<u32>,
    ) -> Result<Any> {
        if property == PropertyIdentifier::ObjectList
            && object.id() == self.device_id()
        {
            let list = PropertyValue::Array(
                self.object_list()
                    .into_iter()
                    .map(PropertyValue::ObjectIdentifier)
                    .collect(),
            );
            let value = match index {
                None => list,
                Some(0) => PropertyValue::Unsigned(self.object_list().len() as u64),
                Some(i) => match list {
                    PropertyValue::Array(elems) => elems
                        .get(i as usize - 1)
                        .cloned()
                        .ok_or_else(|| {
                            Error::execution(ErrorClass::Property, ErrorCode::InvalidArrayIndex)
                        })?,
                    _ => unreachable!(),
                },
            };
            return Ok(Any::from_value(&value)?);
        }
        let value = object.read_property(property, index).await?;
        Ok(Any::from_value(&value)?)
    }

    async fn do_read_property(self: &Arc<Self>, request: &IncomingRequest) -> Result<Response> {
        let read = ReadProperty::from_bytes(&request.parameters)?;
        if read.property_identifier.is_special() {
            return Err(Error::Reject(RejectReason::ParameterOutOfRange));
        }
        let object = self.lookup_object(read.object_identifier)?;
        let value = self
            .read_to_any(&object, read.property_identifier, read.property_array_index)
            .await?;
        let ack = ReadPropertyAck {
            object_identifier: read.object_identifier,
            property_identifier: read.property_identifier,
            property_array_index: read.property_array_index,
            property_value: value,
        };
        Ok(Response::Complex(ack.to_bytes()?))
    }

    async fn do_read_property_multiple(
        self: &Arc<Self>,
        request: &IncomingRequest,
    ) -> Result<Response> {
        let rpm = ReadPropertyMultiple::from_bytes(&request.parameters)?;
        let mut results = Vec::new();
        for spec in rpm.specifications {
            let object = self.object(spec.object_identifier);
            let mut object_results = Vec::new();
            for reference in spec.property_references {
                let pid = reference.property_identifier;
                match &object {
                    None => object_results.push(PropertyResult {
                        property_identifier: pid,
                        property_array_index: reference.property_array_index,
                        result: ReadResult::Error(crate::service::ErrorResult {
                            error_class: ErrorClass::Object,
                            error_code: ErrorCode::UnknownObject,
                        }),
                    }),
                    Some(object) => {
                        // the special identifiers expand server-side
                        let expanded: Vec<PropertyIdentifier> = if pid.is_special() {
                            object.class().expand_special(pid)
                        } else {
                            vec![pid]
                        };
                        for pid in expanded {
                            let result = match self
                                .read_to_any(object, pid, reference.property_array_index)
                                .await
                            {
                                Ok(value) => ReadResult::Value(value),
                                Err(Error::Execution { class, code }) => {
                                    ReadResult::Error(crate::service::ErrorResult {
                                        error_class: class,
                                        error_code: code,
                                    })
                                }
                                Err(e) => return Err(e),
                            };
                            object_results.push(PropertyResult {
                                property_identifier: pid,
                                property_array_index: reference.property_array_index,
                                result,
                            });
                        }
                    }
                }
            }
            results.push(ReadAccessResult {
                object_identifier: spec.object_identifier,
                results: object_results,
            });
        }
        let ack = ReadPropertyMultipleAck { results };
        Ok(Response::Complex(ack.to_bytes()?))
    }

    async fn do_write_property(self: &Arc<Self>, request: &IncomingRequest) -> Result<Response> {
        let write = WriteProperty::from_bytes(&request.parameters)?;
        let object = self.lookup_object(write.object_identifier)?;
        let declared = object
            .class()
            .get_property_type(write.property_identifier)
            .cloned()
            .unwrap_or(TypeSpec::Opaque);
        let spec = match write.property_array_index {
            None => declared,
            Some(i) => declared
                .at_index(i)
                .ok_or_else(|| {
                    Error::execution(ErrorClass::Property, ErrorCode::PropertyIsNotAnArray)
                })?,
        };
        // a lone Null is the relinquish form, admissible regardless of the
        // declared type
        let value = match write.property_value.cast_out::<crate::primitives::Null>() {
            Ok(_) => PropertyValue::Null,
            Err(_) => write.property_value.decode_as(&spec)?,
        };
        object
            .write_property(
                write.property_identifier,
                write.property_array_index,
                value,
                write.priority,
            )
            .await?;
        self.property_changed(write.object_identifier, write.property_identifier)
            .await;
        Ok(Response::Simple)
    }

    async fn do_write_property_multiple(
        self: &Arc<Self>,
        request: &IncomingRequest,
    ) -> Result<Response> {
        let wpm = WritePropertyMultiple::from_bytes(&request.parameters)?;
        for spec in wpm.specifications {
            let object = self.lookup_object(spec.object_identifier)?;
            for write in spec.properties {
                let declared = object
                    .class()
                    .get_property_type(write.property_identifier)
                    .cloned()
                    .unwrap_or(TypeSpec::Opaque);
                let value = match write.value.cast_out::<crate::primitives::Null>() {
                    Ok(_) => PropertyValue::Null,
                    Err(_) => write.value.decode_as(&declared)?,
                };
                object
                    .write_property(
                        write.property_identifier,
                        write.property_array_index,
                        value,
                        write.priority,
                    )
                    .await?;
                self.property_changed(spec.object_identifier, write.property_identifier)
                    .await;
            }
        }
        Ok(Response::Simple)
    }

    async fn do_subscribe_cov(self: &Arc<Self>, request: &IncomingRequest) -> Result<Response> {
        let subscribe = SubscribeCov::from_bytes(&request.parameters)?;
        // the monitored object must exist
        self.lookup_object(subscribe.monitored_object_identifier)?;
        self.cov_server.subscribe(&request.source, &subscribe)?;
        Ok(Response::Simple)
    }

    async fn do_confirmed_cov_notification(
        self: &Arc<Self>,
        request: &IncomingRequest,
    ) -> Result<Response> {
        let notification =
            crate::service::CovNotification::from_bytes(&request.parameters)?;
        self.cov_client.deliver(&request.source, notification);
        Ok(Response::Simple)
    }

    async fn do_read_range(self: &Arc<Self>, request: &IncomingRequest) -> Result<Response> {
        let read = ReadRange::from_bytes(&request.parameters)?;
        let object = self.lookup_object(read.object_identifier)?;
        let value = object
            .read_property(read.property_identifier, read.property_array_index)
            .await?;
        let items = match value {
            PropertyValue::List(items) | PropertyValue::Array(items) => items,
            _ => {
                return Err(Error::execution(
                    ErrorClass::Property,
                    ErrorCode::PropertyIsNotAnArray,
                ));
            }
        };

        let total = items.len();
        let (start, count) = match read.range {
            ReadRangeSpec::All => (0usize, total),
            ReadRangeSpec::ByPosition {
                reference_index,
                count,
            } => {
                if reference_index == 0 {
                    return Err(Error::Reject(RejectReason::ParameterOutOfRange));
                }
                let reference = reference_index as usize - 1;
                if count >= 0 {
                    (reference.min(total), (count as usize).min(total.saturating_sub(reference)))
                } else {
                    let count = count.unsigned_abs() as usize;
                    let start = reference.saturating_sub(count - 1);
                    (start, (reference + 1 - start).min(total))
                }
            }
            // sequence numbers index this in-memory list from one
            ReadRangeSpec::BySequenceNumber {
                reference_sequence,
                count,
            } => {
                let reference = (reference_sequence as usize).saturating_sub(1);
                if count >= 0 {
                    (reference.min(total), (count as usize).min(total.saturating_sub(reference)))
                } else {
                    let count = count.unsigned_abs() as usize;
                    let start = reference.saturating_sub(count - 1);
                    (start, (reference + 1 - start).min(total))
                }
            }
            ReadRangeSpec::ByTime { .. } => (0, 0),
        };

        let slice: Vec<PropertyValue> = items.iter().skip(start).take(count).cloned().collect();
        let item_count = slice.len();
        let first = start == 0 && item_count > 0;
        let last = start + item_count >= total;
        let more = start + item_count < total;
        let ack = ReadRangeAck {
            object_identifier: read.object_identifier,
            property_identifier: read.property_identifier,
            property_array_index: read.property_array_index,
            result_flags: ReadRangeAck::flags(first, last, more),
            item_count: item_count as u32,
            item_data: Any::from_value(&PropertyValue::List(slice))?,
            first_sequence_number: matches!(
                read.range,
                ReadRangeSpec::BySequenceNumber { .. }
            )
            .then_some(start as u32 + 1),
        };
        Ok(Response::Complex(ack.to_bytes()?))
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().expect("poisoned").take() {
            pump.abort();
        }
    }
}

/// look up an object class in the standard registry, for object construction
pub fn standard_class(
    registry: &VendorRegistry,
    object_type: crate::object::ObjectType,
) -> Option<Arc<ObjectClass>> {
    registry.vendor_info(0).object_class(object_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_i_am(instance: u32) -> IAm {
        IAm {
            device_identifier: ObjectIdentifier::device(instance),
            max_apdu_length_accepted: 1476,
            segmentation_supported: Segmentation::SegmentedBoth,
            vendor_identifier: 260,
        }
    }

    #[test]
    fn cache_indexes_both_ways() {
        let mut cache = DeviceInfoCache::new();
        let addr: Address = "10.0.0.9".parse().unwrap();
        cache.update_from_i_am(addr.clone(), &sample_i_am(150));
        assert_eq!(cache.get_by_instance(150).unwrap().address, addr);
        assert_eq!(cache.get_by_address(&addr).unwrap().device_instance, 150);
    }

    #[test]
    fn cache_conflicting_i_am_replaces() {
        let mut cache = DeviceInfoCache::new();
        let old: Address = "10.0.0.9".parse().unwrap();
        let new: Address = "10.0.0.10".parse().unwrap();
        cache.update_from_i_am(old.clone(), &sample_i_am(150));
        cache.update_from_i_am(new.clone(), &sample_i_am(150));
        assert_eq!(cache.get_by_instance(150).unwrap().address, new);
        assert!(cache.get_by_address(&old).is_none());
    }

    #[test]
    fn cache_held_record_survives_conflict() {
        let mut cache = DeviceInfoCache::new();
        let old: Address = "10.0.0.9".parse().unwrap();
        let new: Address = "10.0.0.10".parse().unwrap();
        cache.update_from_i_am(old.clone(), &sample_i_am(150));
        let _held = cache.acquire_by_address(&old).unwrap();
        cache.update_from_i_am(new.clone(), &sample_i_am(150));
        // the held record stays addressable until released
        assert!(cache.get_by_address(&old).is_some());
        cache.release(&old);
        assert_eq!(cache.get_by_address(&old).unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn device_object_present() {
        let app = Application::new(DeviceConfig {
            device_instance: 99,
            ..DeviceConfig::default()
        });
        let device = app.object(ObjectIdentifier::device(99)).expect("device object");
        let name = device
            .read_property(PropertyIdentifier::ObjectName, None)
            .await
            .unwrap();
        assert_eq!(name, PropertyValue::CharacterString("bacproto".into()));
        assert_eq!(app.object_list(), vec![ObjectIdentifier::device(99)]);
    }

    // end-to-end scenarios: two stacks wired through a virtual network

    use crate::{
        link::VirtualNetwork,
        object::ObjectType,
        pdu::Mac,
        service::{PropertyReference, ReadAccessSpecification},
        tsm::AsapConfig,
    };

    fn app_on(
        vlan: &Arc<VirtualNetwork>,
        station: u8,
        instance: u32,
        asap: AsapConfig,
    ) -> Arc<Application> {
        let app = Application::with_registry(
            DeviceConfig {
                device_instance: instance,
                device_name: format!("device-{instance}"),
                vendor_identifier: 260,
                ..DeviceConfig::default()
            },
            Arc::new(VendorRegistry::standard()),
            asap,
        );
        app.bind_link(Some(1), Arc::new(vlan.attach(Mac::station(station))))
            .unwrap();
        app.start();
        app
    }

    fn analog_input(
        app: &Arc<Application>,
        instance: u32,
        name: &str,
        value: f32,
    ) -> ObjectIdentifier {
        let class = app
            .vendor_registry()
            .vendor_info(0)
            .object_class(ObjectType::AnalogInput)
            .unwrap();
        let id = ObjectIdentifier::new(ObjectType::AnalogInput, instance);
        app.add_object(
            Object::new(id, class)
                .with_value(
                    PropertyIdentifier::ObjectName,
                    PropertyValue::CharacterString(name.into()),
                )
                .with_value(PropertyIdentifier::PresentValue, PropertyValue::Real(value))
                .with_value(
                    PropertyIdentifier::StatusFlags,
                    PropertyValue::BitString(status_flags(false, false, false, false)),
                )
                .with_value(
                    PropertyIdentifier::Units,
                    PropertyValue::Enumerated(Enumerated(62)),
                ),
        );
        id
    }

    #[tokio::test(start_paused = true)]
    async fn who_is_resolves_and_fills_the_cache() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        let _ = &b;

        let found = a.who_is(Some(100), Some(200), None).await.unwrap();
        assert_eq!(found.len(), 1);
        let i_am = &found[0];
        assert_eq!(i_am.device_identifier, ObjectIdentifier::device(150));
        assert_eq!(i_am.max_apdu_length_accepted, 1476);
        assert_eq!(i_am.segmentation_supported, Segmentation::SegmentedBoth);
        assert_eq!(i_am.vendor_identifier, 260);

        // the cache answers by instance and by address
        let cache = a.device_info().lock().unwrap();
        let by_instance = cache.get_by_instance(150).unwrap();
        assert_eq!(by_instance.vendor_identifier, 260);
        let by_address = cache
            .get_by_address(&Address::local_station(Mac::station(2)))
            .unwrap();
        assert_eq!(by_address.device_instance, 150);
    }

    #[tokio::test(start_paused = true)]
    async fn who_is_out_of_range_is_silent() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let _b = app_on(&vlan, 2, 150, AsapConfig::default());

        let found = a.who_is(Some(300), Some(400), None).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn who_has_finds_by_name() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        analog_input(&b, 1, "zone-temp", 21.5);

        let found = a
            .who_has(None, None, WhoHasObject::Name("zone-temp".into()), None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_identifier, ObjectIdentifier::device(150));
        assert_eq!(
            found[0].object_identifier,
            ObjectIdentifier::new(ObjectType::AnalogInput, 1)
        );
        assert_eq!(found[0].object_name, "zone-temp");
    }

    #[tokio::test(start_paused = true)]
    async fn read_property_atomic_value() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let _b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));

        let value = a
            .read_property(
                &peer,
                ObjectIdentifier::device(150),
                PropertyIdentifier::ObjectName,
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::CharacterString("device-150".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn read_property_unknown_object_is_an_error() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let _b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));

        let err = a
            .read_property(
                &peer,
                ObjectIdentifier::new(ObjectType::AnalogInput, 99),
                PropertyIdentifier::PresentValue,
                None,
            )
            .await
            .unwrap_err();
        match err {
            Error::Execution { class, code } => {
                assert_eq!(class, ErrorClass::Object);
                assert_eq!(code, ErrorCode::UnknownObject);
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn write_property_with_priority_and_relinquish() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));

        let class = b
            .vendor_registry()
            .vendor_info(0)
            .object_class(ObjectType::AnalogValue)
            .unwrap();
        let av = ObjectIdentifier::new(ObjectType::AnalogValue, 1);
        b.add_object(
            Object::new(av, class)
                .with_value(
                    PropertyIdentifier::ObjectName,
                    PropertyValue::CharacterString("setpoint".into()),
                )
                .with_value(PropertyIdentifier::PresentValue, PropertyValue::Real(20.0))
                .with_value(
                    PropertyIdentifier::StatusFlags,
                    PropertyValue::BitString(status_flags(false, false, false, false)),
                )
                .with_value(
                    PropertyIdentifier::RelinquishDefault,
                    PropertyValue::Real(20.0),
                ),
        );

        a.write_property(
            &peer,
            av,
            PropertyIdentifier::PresentValue,
            PropertyValue::Real(23.5),
            None,
            Some(8),
        )
        .await
        .unwrap();
        let value = a
            .read_property(&peer, av, PropertyIdentifier::PresentValue, None)
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::Real(23.5));

        // relinquish: null at the same priority falls back to the default
        a.write_property(
            &peer,
            av,
            PropertyIdentifier::PresentValue,
            PropertyValue::Null,
            None,
            Some(8),
        )
        .await
        .unwrap();
        let value = a
            .read_property(&peer, av, PropertyIdentifier::PresentValue, None)
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::Real(20.0));

        // a null write without priority is refused locally
        assert!(
            a.write_property(
                &peer,
                av,
                PropertyIdentifier::PresentValue,
                PropertyValue::Null,
                None,
                None,
            )
            .await
            .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn priority_on_non_commandable_property_rejected() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));
        let ai = analog_input(&b, 1, "zone-temp", 21.5);

        let err = a
            .write_property(
                &peer,
                ai,
                PropertyIdentifier::OutOfService,
                PropertyValue::Boolean(true),
                None,
                Some(8),
            )
            .await
            .unwrap_err();
        match err {
            Error::Execution { class, code } => {
                assert_eq!(class, ErrorClass::Property);
                assert_eq!(code, ErrorCode::WriteAccessDenied);
            }
            other => panic!("expected write-access-denied, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rpm_expands_all_and_reports_per_property_errors() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));
        let ai = analog_input(&b, 1, "zone-temp", 21.5);

        let ack = a
            .read_property_multiple(
                &peer,
                ReadPropertyMultiple {
                    specifications: vec![ReadAccessSpecification {
                        object_identifier: ai,
                        property_references: vec![PropertyReference::new(
                            PropertyIdentifier::All,
                        )],
                    }],
                },
            )
            .await
            .unwrap();

        assert_eq!(ack.results.len(), 1);
        let results = &ack.results[0].results;
        // expansion excludes property-list itself
        assert!(
            results
                .iter()
                .all(|r| r.property_identifier != PropertyIdentifier::PropertyList)
        );
        let present = results
            .iter()
            .find(|r| r.property_identifier == PropertyIdentifier::PresentValue)
            .unwrap();
        match &present.result {
            ReadResult::Value(any) => assert_eq!(any.cast_out::<f32>().unwrap(), 21.5),
            other => panic!("expected value, got {other:?}"),
        }
        // declared-but-unset properties come back as per-property errors
        let missing = results
            .iter()
            .find(|r| matches!(r.result, ReadResult::Error(_)));
        assert!(missing.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn segmented_response_reassembles() {
        let vlan = VirtualNetwork::new("lab");
        // a small APDU limit on the requester forces the responder to segment
        let a = app_on(
            &vlan,
            1,
            100,
            AsapConfig {
                max_apdu: 480,
                ..AsapConfig::default()
            },
        );
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));

        let big = "pump room ".repeat(300);
        assert!(big.len() > 2000);
        let class = b
            .vendor_registry()
            .vendor_info(0)
            .object_class(ObjectType::AnalogInput)
            .unwrap();
        let ai = ObjectIdentifier::new(ObjectType::AnalogInput, 1);
        b.add_object(
            Object::new(ai, class)
                .with_value(
                    PropertyIdentifier::ObjectName,
                    PropertyValue::CharacterString("zone-temp".into()),
                )
                .with_value(PropertyIdentifier::PresentValue, PropertyValue::Real(21.5))
                .with_value(
                    PropertyIdentifier::StatusFlags,
                    PropertyValue::BitString(status_flags(false, false, false, false)),
                )
                .with_value(
                    PropertyIdentifier::Description,
                    PropertyValue::CharacterString(big.clone()),
                ),
        );

        let value = a
            .read_property(&peer, ai, PropertyIdentifier::Description, None)
            .await
            .unwrap();
        assert_eq!(value, PropertyValue::CharacterString(big));
    }

    #[tokio::test(start_paused = true)]
    async fn cov_lifecycle() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));
        let ai = analog_input(&b, 1, "zone-temp", 21.5);

        let mut subscription = a
            .change_of_value(peer.clone(), ai, 1, true, 60)
            .await
            .unwrap();
        assert!(subscription.is_confirmed());

        b.local_write(ai, PropertyIdentifier::PresentValue, PropertyValue::Real(22.5))
            .await
            .unwrap();

        let value = subscription.get_value().await.unwrap();
        assert_eq!(value, PropertyValue::Real(22.5));

        subscription.unsubscribe().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_cov_notification() {
        let vlan = VirtualNetwork::new("lab");
        let a = app_on(&vlan, 1, 100, AsapConfig::default());
        let b = app_on(&vlan, 2, 150, AsapConfig::default());
        let peer = Address::local_station(Mac::station(2));
        let ai = analog_input(&b, 1, "zone-temp", 21.5);

        let mut subscription = a
            .change_of_value(peer.clone(), ai, 7, false, 0)
            .await
            .unwrap();

        b.local_write(ai, PropertyIdentifier::PresentValue, PropertyValue::Real(19.0))
            .await
            .unwrap();

        let notification = subscription.notification().await.unwrap();
        assert_eq!(notification.subscriber_process_identifier, 7);
        assert_eq!(notification.monitored_object_identifier, ai);
        // indefinite subscriptions report zero time remaining
        assert_eq!(notification.time_remaining, 0);
    }
}
