use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType as BtleWriteType,
};
use btleplug::api::{Characteristic as BtleCharacteristic, Descriptor as BtleDescriptor};
use btleplug::platform::{Adapter, Manager, Peripheral as BtlePeripheral, PeripheralId};
use tokio::runtime::Handle as RuntimeHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::advertisement::Advertisement;
use crate::central::EventSink;
use crate::error::TransportError;
use crate::identifier::Identifier;
use crate::transport::{
    CharacteristicProperties, ConnectOptions, ConnectionState, Handle, ManagerState, ScanOptions,
    Transport, TransportEvent, WriteType,
};

const MAXIMUM_WRITE_WITH_RESPONSE: usize = 512;
const MAXIMUM_WRITE_WITHOUT_RESPONSE: usize = 20;

/// Handle for a remote device at one connection generation.
#[derive(Clone)]
pub struct PeripheralHandle {
    inner: BtlePeripheral,
    identifier: Identifier,
    generation: u64,
}

impl fmt::Debug for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralHandle")
            .field("identifier", &self.identifier)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PartialEq for PeripheralHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id() == other.inner.id() && self.generation == other.generation
    }
}

impl Eq for PeripheralHandle {}

impl Handle for PeripheralHandle {
    fn identifier(&self) -> Identifier {
        self.identifier
    }
}

/// One service entry of the adapter's database. It carries its own
/// characteristics because two services may share a UUID.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceHandle {
    peripheral: PeripheralId,
    generation: u64,
    uuid: Uuid,
    primary: bool,
    characteristics: BTreeSet<BtleCharacteristic>,
}

impl Handle for ServiceHandle {
    fn identifier(&self) -> Identifier {
        identifier_for(self.uuid)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicHandle {
    peripheral: PeripheralId,
    generation: u64,
    inner: BtleCharacteristic,
}

impl Handle for CharacteristicHandle {
    fn identifier(&self) -> Identifier {
        identifier_for(self.inner.uuid)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DescriptorHandle {
    peripheral: PeripheralId,
    generation: u64,
    inner: BtleDescriptor,
}

impl Handle for DescriptorHandle {
    fn identifier(&self) -> Identifier {
        identifier_for(self.inner.uuid)
    }
}

/// btleplug has no L2CAP support; this type is never constructed.
#[derive(Debug)]
pub enum UnsupportedChannel {}

#[derive(Debug)]
struct Tracked {
    peripheral: BtlePeripheral,
    identifier: Identifier,
    generation: u64,
    connection: ConnectionState,
    listening: bool,
}

impl Tracked {
    fn handle(&self) -> PeripheralHandle {
        PeripheralHandle {
            inner: self.peripheral.clone(),
            identifier: self.identifier,
            generation: self.generation,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    radio: ManagerState,
    scanning: bool,
    allow_duplicates: bool,
    peripherals: HashMap<PeripheralId, Tracked>,
}

impl Shared {
    fn track(&mut self, peripheral: BtlePeripheral) -> &mut Tracked {
        self.peripherals
            .entry(peripheral.id())
            .or_insert_with(|| Tracked {
                identifier: peripheral_identifier(&peripheral),
                peripheral,
                generation: 0,
                connection: ConnectionState::Disconnected,
                listening: false,
            })
    }

    fn current(&self, peripheral: &PeripheralId, generation: u64) -> Option<&Tracked> {
        self.peripherals
            .get(peripheral)
            .filter(|tracked| tracked.generation == generation)
    }

    /// Marks `peripheral` disconnected, returning its handle only on the transition.
    fn mark_disconnected(&mut self, peripheral: &PeripheralId) -> Option<PeripheralHandle> {
        let tracked = self.peripherals.get_mut(peripheral)?;
        if tracked.connection == ConnectionState::Disconnected {
            return None;
        }
        tracked.connection = ConnectionState::Disconnected;
        Some(tracked.handle())
    }
}

/// Transport over the host's Bluetooth adapter.
///
/// Commands are spawned onto the current tokio runtime. Characteristic and
/// descriptor discovery complete from the database btleplug cached on
/// connect; included services and L2CAP channels are not available.
pub struct BtleplugTransport {
    adapter: Adapter,
    sink: EventSink<BtleplugTransport>,
    runtime: RuntimeHandle,
    shared: Arc<Mutex<Shared>>,
}

impl fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

impl BtleplugTransport {
    /// Returns the host's first Bluetooth adapter.
    #[instrument(level = "debug")]
    pub async fn default_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await.map_err(transport_error)?;
        let adapters = manager.adapters().await.map_err(transport_error)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::new(2, "no Bluetooth adapters found"))?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "using Bluetooth adapter");
        }
        Ok(adapter)
    }

    /// Wraps `adapter` and starts forwarding its events to `sink`. Must be
    /// called from within a tokio runtime.
    pub fn new(adapter: Adapter, sink: EventSink<BtleplugTransport>) -> Self {
        let transport = Self {
            adapter,
            sink,
            runtime: RuntimeHandle::current(),
            shared: Arc::new(Mutex::new(Shared {
                radio: ManagerState::PoweredOn,
                ..Shared::default()
            })),
        };
        transport.listen_to_adapter();
        transport
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    /// Spawns `command` and posts the event it produces, if any.
    fn spawn<F>(&self, command: F)
    where
        F: Future<Output = Option<TransportEvent<BtleplugTransport>>> + Send + 'static,
    {
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            if let Some(event) = command.await {
                sink.post(event);
            }
        });
    }

    fn listen_to_adapter(&self) {
        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(error) => {
                    warn!(%error, "adapter event stream unavailable");
                    lock_shared(&shared).radio = ManagerState::Unsupported;
                    sink.post(TransportEvent::StateChanged(ManagerState::Unsupported));
                    return;
                }
            };
            while let Some(event) = events.next().await {
                let (id, fresh) = match event {
                    CentralEvent::DeviceDisconnected(id) => {
                        let handle = lock_shared(&shared).mark_disconnected(&id);
                        if let Some(peripheral) = handle {
                            sink.post(TransportEvent::Disconnected {
                                peripheral,
                                error: None,
                            });
                        }
                        continue;
                    }
                    CentralEvent::DeviceDiscovered(id) => (id, true),
                    CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServiceDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => (id, false),
                    other => {
                        trace!(event = ?other, "ignoring adapter event");
                        continue;
                    }
                };
                {
                    let state = lock_shared(&shared);
                    if !state.scanning || (!fresh && !state.allow_duplicates) {
                        continue;
                    }
                }
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let handle = lock_shared(&shared).track(peripheral).handle();
                sink.post(TransportEvent::Discovered {
                    peripheral: handle,
                    rssi: properties.rssi.unwrap_or_default(),
                    advertisement: advertisement_from(properties),
                });
            }
            debug!("adapter event stream ended");
        });
    }

    fn start_notification_listener(&self, peripheral: &PeripheralHandle) {
        {
            let mut state = self.lock();
            let Some(tracked) = state.peripherals.get_mut(&peripheral.inner.id()) else {
                return;
            };
            if tracked.listening {
                return;
            }
            tracked.listening = true;
        }
        let inner = peripheral.inner.clone();
        let shared = Arc::clone(&self.shared);
        let sink = self.sink.clone();
        self.runtime.spawn(async move {
            let id = inner.id();
            if let Ok(mut notifications) = inner.notifications().await {
                while let Some(notification) = notifications.next().await {
                    let Some(tracked) = lock_shared(&shared).peripherals.get(&id).map(Tracked::handle)
                    else {
                        break;
                    };
                    let Some(characteristic) = inner
                        .characteristics()
                        .into_iter()
                        .find(|characteristic| characteristic.uuid == notification.uuid)
                    else {
                        continue;
                    };
                    sink.post(TransportEvent::CharacteristicValueUpdated {
                        characteristic: CharacteristicHandle {
                            peripheral: id.clone(),
                            generation: tracked.generation,
                            inner: characteristic,
                        },
                        peripheral: tracked,
                        value: Ok(notification.value),
                    });
                }
            }
            if let Some(tracked) = lock_shared(&shared).peripherals.get_mut(&id) {
                tracked.listening = false;
            }
        });
    }

    fn live_peripheral(&self, peripheral: &PeripheralId, generation: u64) -> Option<BtlePeripheral> {
        self.lock()
            .current(peripheral, generation)
            .map(|tracked| tracked.peripheral.clone())
    }
}

impl Transport for BtleplugTransport {
    type Peripheral = PeripheralHandle;
    type Service = ServiceHandle;
    type Characteristic = CharacteristicHandle;
    type Descriptor = DescriptorHandle;
    type L2capChannel = UnsupportedChannel;

    fn state(&self) -> ManagerState {
        self.lock().radio
    }

    fn scan(&mut self, services: Option<&[Identifier]>, options: &ScanOptions) {
        {
            let mut state = self.lock();
            state.scanning = true;
            state.allow_duplicates = options.allow_duplicates;
        }
        let filter = ScanFilter {
            services: services
                .unwrap_or_default()
                .iter()
                .map(|identifier| Uuid::from_u128(identifier.as_u128()))
                .collect(),
        };
        let adapter = self.adapter.clone();
        self.spawn(async move {
            if let Err(error) = adapter.start_scan(filter).await {
                warn!(%error, "failed to start scan");
            }
            None
        });
    }

    fn stop_scan(&mut self) {
        self.lock().scanning = false;
        let adapter = self.adapter.clone();
        self.spawn(async move {
            if let Err(error) = adapter.stop_scan().await {
                debug!(%error, "failed to stop adapter scan cleanly");
            }
            None
        });
    }

    fn connect(&mut self, peripheral: &PeripheralHandle, _options: &ConnectOptions) {
        self.lock().track(peripheral.inner.clone()).connection = ConnectionState::Connecting;
        let inner = peripheral.inner.clone();
        let shared = Arc::clone(&self.shared);
        let attempted = peripheral.clone();
        self.spawn(async move {
            match inner.connect().await {
                Ok(()) => {
                    let mut state = lock_shared(&shared);
                    let tracked = state.track(inner);
                    tracked.generation += 1;
                    tracked.connection = ConnectionState::Connected;
                    Some(TransportEvent::Connected {
                        peripheral: tracked.handle(),
                    })
                }
                Err(error) => {
                    if let Some(tracked) = lock_shared(&shared).peripherals.get_mut(&inner.id()) {
                        tracked.connection = ConnectionState::Disconnected;
                    }
                    Some(TransportEvent::FailedToConnect {
                        peripheral: attempted,
                        error: transport_error(error),
                    })
                }
            }
        });
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralHandle) {
        let inner = peripheral.inner.clone();
        let shared = Arc::clone(&self.shared);
        self.spawn(async move {
            if let Err(error) = inner.disconnect().await {
                debug!(%error, "disconnect failed");
            }
            lock_shared(&shared)
                .mark_disconnected(&inner.id())
                .map(|peripheral| TransportEvent::Disconnected {
                    peripheral,
                    error: None,
                })
        });
    }

    fn retrieve_peripherals(&self, identifiers: &[Identifier]) -> Vec<PeripheralHandle> {
        let state = self.lock();
        identifiers
            .iter()
            .filter_map(|identifier| {
                state
                    .peripherals
                    .values()
                    .find(|tracked| tracked.identifier == *identifier)
            })
            .map(Tracked::handle)
            .collect()
    }

    fn retrieve_connected_peripherals(&self, services: &[Identifier]) -> Vec<PeripheralHandle> {
        let state = self.lock();
        state
            .peripherals
            .values()
            .filter(|tracked| tracked.connection == ConnectionState::Connected)
            .filter(|tracked| {
                tracked
                    .peripheral
                    .services()
                    .iter()
                    .any(|service| services.contains(&identifier_for(service.uuid)))
            })
            .map(Tracked::handle)
            .collect()
    }

    fn peripheral_state(&self, peripheral: &PeripheralHandle) -> ConnectionState {
        self.lock()
            .current(&peripheral.inner.id(), peripheral.generation)
            .map_or(ConnectionState::Disconnected, |tracked| tracked.connection)
    }

    fn peripheral_name(&self, _peripheral: &PeripheralHandle) -> Option<String> {
        None
    }

    #[instrument(skip_all, level = "trace", fields(peripheral = %peripheral.identifier))]
    fn discover_services(&mut self, peripheral: &PeripheralHandle, _services: Option<&[Identifier]>) {
        let handle = peripheral.clone();
        self.spawn(async move {
            let error = handle.inner.discover_services().await.err().map(transport_error);
            Some(TransportEvent::ServicesDiscovered {
                peripheral: handle,
                error,
            })
        });
    }

    fn discover_included_services(
        &mut self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        _services: Option<&[Identifier]>,
    ) {
        self.sink.post(TransportEvent::IncludedServicesDiscovered {
            peripheral: peripheral.clone(),
            service: service.clone(),
            error: None,
        });
    }

    fn discover_characteristics(
        &mut self,
        peripheral: &PeripheralHandle,
        service: &ServiceHandle,
        _characteristics: Option<&[Identifier]>,
    ) {
        self.sink.post(TransportEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service: service.clone(),
            error: None,
        });
    }

    fn discover_descriptors(
        &mut self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) {
        self.sink.post(TransportEvent::DescriptorsDiscovered {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            error: None,
        });
    }

    fn read_characteristic(
        &mut self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
    ) {
        let (peripheral, characteristic) = (peripheral.clone(), characteristic.clone());
        self.spawn(async move {
            let value = peripheral
                .inner
                .read(&characteristic.inner)
                .await
                .map_err(transport_error);
            Some(TransportEvent::CharacteristicValueUpdated {
                peripheral,
                characteristic,
                value,
            })
        });
    }

    fn write_characteristic(
        &mut self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        value: &[u8],
        write_type: WriteType,
    ) {
        let (peripheral, characteristic) = (peripheral.clone(), characteristic.clone());
        let value = value.to_vec();
        self.spawn(async move {
            let mode = match write_type {
                WriteType::WithResponse => BtleWriteType::WithResponse,
                WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
            };
            let result = peripheral
                .inner
                .write(&characteristic.inner, &value, mode)
                .await;
            match write_type {
                WriteType::WithResponse => Some(TransportEvent::CharacteristicWritten {
                    peripheral,
                    characteristic,
                    error: result.err().map(transport_error),
                }),
                WriteType::WithoutResponse => {
                    if let Err(error) = result {
                        debug!(%error, "write without response failed");
                    }
                    None
                }
            }
        });
    }

    fn set_notify(
        &mut self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicHandle,
        enabled: bool,
    ) {
        if enabled {
            self.start_notification_listener(peripheral);
        }
        let (peripheral, characteristic) = (peripheral.clone(), characteristic.clone());
        self.spawn(async move {
            let result = if enabled {
                peripheral.inner.subscribe(&characteristic.inner).await
            } else {
                peripheral.inner.unsubscribe(&characteristic.inner).await
            };
            Some(TransportEvent::NotificationStateUpdated {
                peripheral,
                characteristic,
                result: result.map(|()| enabled).map_err(transport_error),
            })
        });
    }

    fn read_descriptor(&mut self, peripheral: &PeripheralHandle, descriptor: &DescriptorHandle) {
        let (peripheral, descriptor) = (peripheral.clone(), descriptor.clone());
        self.spawn(async move {
            let value = peripheral
                .inner
                .read_descriptor(&descriptor.inner)
                .await
                .map_err(transport_error);
            Some(TransportEvent::DescriptorValueUpdated {
                peripheral,
                descriptor,
                value,
            })
        });
    }

    fn write_descriptor(
        &mut self,
        peripheral: &PeripheralHandle,
        descriptor: &DescriptorHandle,
        value: &[u8],
    ) {
        let (peripheral, descriptor) = (peripheral.clone(), descriptor.clone());
        let value = value.to_vec();
        self.spawn(async move {
            let error = peripheral
                .inner
                .write_descriptor(&descriptor.inner, &value)
                .await
                .err()
                .map(transport_error);
            Some(TransportEvent::DescriptorWritten {
                peripheral,
                descriptor,
                error,
            })
        });
    }

    fn read_rssi(&mut self, peripheral: &PeripheralHandle) {
        let peripheral = peripheral.clone();
        self.spawn(async move {
            let rssi = match peripheral.inner.properties().await {
                Ok(Some(PeripheralProperties { rssi: Some(rssi), .. })) => Ok(rssi),
                Ok(_) => Err(TransportError::new(4, "RSSI is not available")),
                Err(error) => Err(transport_error(error)),
            };
            Some(TransportEvent::RssiRead { peripheral, rssi })
        });
    }

    fn open_l2cap_channel(&mut self, peripheral: &PeripheralHandle, psm: u16) {
        self.sink.post(TransportEvent::L2capChannelOpened {
            peripheral: peripheral.clone(),
            psm,
            channel: Err(TransportError::new(4, "L2CAP channels are not supported")),
        });
    }

    fn maximum_write_length(&self, _peripheral: &PeripheralHandle, write_type: WriteType) -> usize {
        match write_type {
            WriteType::WithResponse => MAXIMUM_WRITE_WITH_RESPONSE,
            WriteType::WithoutResponse => MAXIMUM_WRITE_WITHOUT_RESPONSE,
        }
    }

    fn can_send_write_without_response(&self, peripheral: &PeripheralHandle) -> bool {
        self.peripheral_state(peripheral) == ConnectionState::Connected
    }

    fn services(&self, peripheral: &PeripheralHandle) -> Vec<ServiceHandle> {
        let id = peripheral.inner.id();
        let Some(live) = self.live_peripheral(&id, peripheral.generation) else {
            return Vec::new();
        };
        live.services()
            .into_iter()
            .map(|service| ServiceHandle {
                peripheral: id.clone(),
                generation: peripheral.generation,
                uuid: service.uuid,
                primary: service.primary,
                characteristics: service.characteristics,
            })
            .collect()
    }

    fn included_services(&self, _service: &ServiceHandle) -> Vec<ServiceHandle> {
        Vec::new()
    }

    fn characteristics(&self, service: &ServiceHandle) -> Vec<CharacteristicHandle> {
        if self
            .live_peripheral(&service.peripheral, service.generation)
            .is_none()
        {
            return Vec::new();
        }
        service
            .characteristics
            .iter()
            .map(|characteristic| CharacteristicHandle {
                peripheral: service.peripheral.clone(),
                generation: service.generation,
                inner: characteristic.clone(),
            })
            .collect()
    }

    fn descriptors(&self, characteristic: &CharacteristicHandle) -> Vec<DescriptorHandle> {
        if self
            .live_peripheral(&characteristic.peripheral, characteristic.generation)
            .is_none()
        {
            return Vec::new();
        }
        characteristic
            .inner
            .descriptors
            .iter()
            .map(|descriptor| DescriptorHandle {
                peripheral: characteristic.peripheral.clone(),
                generation: characteristic.generation,
                inner: descriptor.clone(),
            })
            .collect()
    }

    fn is_primary(&self, service: &ServiceHandle) -> bool {
        service.primary
    }

    fn characteristic_properties(
        &self,
        characteristic: &CharacteristicHandle,
    ) -> CharacteristicProperties {
        properties_from(characteristic.inner.properties)
    }
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn identifier_for(uuid: Uuid) -> Identifier {
    Identifier::from_u128(uuid.as_u128())
}

/// Platform ids are UUIDs on some hosts and addresses on others.
fn peripheral_identifier(peripheral: &BtlePeripheral) -> Identifier {
    if let Ok(identifier) = peripheral.id().to_string().parse::<Identifier>() {
        return identifier;
    }
    let mut bytes = [0u8; 16];
    bytes[10..].copy_from_slice(&peripheral.address().into_inner());
    Identifier::from_bytes(bytes)
}

fn advertisement_from(properties: PeripheralProperties) -> Advertisement {
    let manufacturer_data = properties
        .manufacturer_data
        .into_iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .next()
        .map(|(company, payload)| {
            let mut data = company.to_le_bytes().to_vec();
            data.extend(payload);
            data
        });
    Advertisement::builder()
        .maybe_local_name(properties.local_name)
        .maybe_manufacturer_data(manufacturer_data)
        .service_data(
            properties
                .service_data
                .into_iter()
                .map(|(uuid, data)| (identifier_for(uuid), data))
                .collect(),
        )
        .service_identifiers(properties.services.into_iter().map(identifier_for).collect())
        .maybe_tx_power_level(properties.tx_power_level)
        .build()
}

fn properties_from(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties::from_bits_truncate(u16::from(flags.bits()))
}

fn transport_error(error: btleplug::Error) -> TransportError {
    let code = match &error {
        btleplug::Error::PermissionDenied => 1,
        btleplug::Error::DeviceNotFound => 2,
        btleplug::Error::NotConnected => 3,
        btleplug::Error::NotSupported(_) => 4,
        btleplug::Error::TimedOut(_) => 5,
        _ => 0,
    };
    TransportError::new(code, error.to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn property_bits_match_gatt_declaration() {
        let flags = CharPropFlags::READ | CharPropFlags::NOTIFY;
        assert_eq!(
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            properties_from(flags)
        );
    }

    #[test]
    fn advertisement_prefixes_manufacturer_company_id() {
        let properties = PeripheralProperties {
            local_name: Some("Cube".to_string()),
            manufacturer_data: HashMap::from([(0x004c, vec![0x02, 0x15])]),
            ..PeripheralProperties::default()
        };
        let advertisement = advertisement_from(properties);
        assert_eq!(Some("Cube"), advertisement.local_name());
        assert_eq!(Some(&[0x4c, 0x00, 0x02, 0x15][..]), advertisement.manufacturer_data());
    }
}
