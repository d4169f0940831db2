use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use bon::Builder;

use crate::advertisement::Advertisement;
use crate::central::{CentralManagerCore, EventSink};
use crate::error::{FixtureError, TransportError};
use crate::identifier::Identifier;
use crate::transport::{
    CharacteristicProperties, ConnectOptions, ConnectionState, Handle, ManagerState,
    RestoredState, ScanOptions, Transport, TransportEvent, WriteType,
};

const DEFAULT_RSSI: i16 = -50;
const MAXIMUM_WRITE_WITH_RESPONSE: usize = 512;
const MAXIMUM_WRITE_WITHOUT_RESPONSE: usize = 182;

/// Parsed fake scan fixture records.
///
/// Records are `;`-separated, each `identifier|name|rssi|services` where
/// `name` may be `-` and `services` is a `,`-separated identifier list or `-`.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<FakeDevice>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let devices = parse_scan_fixture(value)?;
        Ok(Self { devices })
    }
}

/// Parsed fake hex payload.
#[derive(Debug, Clone, derive_more::Into)]
pub struct HexPayload {
    payload: Vec<u8>,
}

impl FromStr for HexPayload {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Self {
            payload: hex::decode(cleaned)?,
        })
    }
}

/// A simulated remote device.
#[derive(Debug, Clone, Builder)]
pub struct FakeDevice {
    identifier: Identifier,
    #[builder(into)]
    name: Option<String>,
    #[builder(default)]
    advertisement: Advertisement,
    #[builder(default = DEFAULT_RSSI)]
    rssi: i16,
    #[builder(default)]
    services: Vec<FakeService>,
    #[builder(default = true)]
    connectable: bool,
}

impl FakeDevice {
    #[must_use]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    fn matches_scan(&self, services: Option<&[Identifier]>) -> bool {
        match services {
            None | Some([]) => true,
            Some(services) => services.iter().any(|service| {
                self.advertisement.advertises(*service)
                    || self.services.iter().any(|own| own.identifier == *service)
            }),
        }
    }

    fn service_at(&self, path: &[usize]) -> Option<&FakeService> {
        let (first, rest) = path.split_first()?;
        let mut service = self.services.get(*first)?;
        for index in rest {
            service = service.included.get(*index)?;
        }
        Some(service)
    }

    fn service_at_mut(&mut self, path: &[usize]) -> Option<&mut FakeService> {
        let (first, rest) = path.split_first()?;
        let mut service = self.services.get_mut(*first)?;
        for index in rest {
            service = service.included.get_mut(*index)?;
        }
        Some(service)
    }

    fn characteristic_at(&self, path: &[usize], index: usize) -> Option<&FakeCharacteristic> {
        self.service_at(path)?.characteristics.get(index)
    }

    fn characteristic_at_mut(
        &mut self,
        path: &[usize],
        index: usize,
    ) -> Option<&mut FakeCharacteristic> {
        self.service_at_mut(path)?.characteristics.get_mut(index)
    }

    /// Every location in the device's database, parents before children.
    fn all_locations(&self) -> Vec<Location> {
        fn walk(service: &FakeService, path: Vec<usize>, out: &mut Vec<Location>) {
            out.push(Location::Service(path.clone()));
            for (index, characteristic) in service.characteristics.iter().enumerate() {
                out.push(Location::Characteristic(path.clone(), index));
                for descriptor in 0..characteristic.descriptors.len() {
                    out.push(Location::Descriptor(path.clone(), index, descriptor));
                }
            }
            for (index, included) in service.included.iter().enumerate() {
                let mut child = path.clone();
                child.push(index);
                walk(included, child, out);
            }
        }

        let mut out = Vec::new();
        for (index, service) in self.services.iter().enumerate() {
            walk(service, vec![index], &mut out);
        }
        out
    }
}

/// A simulated service.
#[derive(Debug, Clone)]
pub struct FakeService {
    identifier: Identifier,
    primary: bool,
    characteristics: Vec<FakeCharacteristic>,
    included: Vec<FakeService>,
}

impl FakeService {
    #[must_use]
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            primary: true,
            characteristics: Vec::new(),
            included: Vec::new(),
        }
    }

    #[must_use]
    pub fn secondary(mut self) -> Self {
        self.primary = false;
        self
    }

    #[must_use]
    pub fn characteristic(mut self, characteristic: FakeCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    #[must_use]
    pub fn included(mut self, service: FakeService) -> Self {
        self.included.push(service);
        self
    }
}

/// A simulated characteristic and its current value.
#[derive(Debug, Clone)]
pub struct FakeCharacteristic {
    identifier: Identifier,
    properties: CharacteristicProperties,
    value: Vec<u8>,
    descriptors: Vec<FakeDescriptor>,
}

impl FakeCharacteristic {
    #[must_use]
    pub fn new(identifier: Identifier, properties: CharacteristicProperties) -> Self {
        Self {
            identifier,
            properties,
            value: Vec::new(),
            descriptors: Vec::new(),
        }
    }

    #[must_use]
    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    #[must_use]
    pub fn descriptor(mut self, descriptor: FakeDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// A simulated descriptor.
#[derive(Debug, Clone)]
pub struct FakeDescriptor {
    identifier: Identifier,
    value: Vec<u8>,
}

impl FakeDescriptor {
    #[must_use]
    pub fn new(identifier: Identifier, value: impl Into<Vec<u8>>) -> Self {
        Self {
            identifier,
            value: value.into(),
        }
    }
}

/// Position of an attribute inside a device database.
///
/// A service path walks top-level services then included services.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
enum Location {
    Peripheral,
    Service(Vec<usize>),
    Characteristic(Vec<usize>, usize),
    Descriptor(Vec<usize>, usize, usize),
}

impl Location {
    fn is_within_service(&self, path: &[usize]) -> bool {
        match self {
            Self::Peripheral => false,
            Self::Service(own) | Self::Characteristic(own, _) | Self::Descriptor(own, _, _) => {
                own.starts_with(path)
            }
        }
    }
}

/// Handle vended by [`FakeTransport`] for every attribute kind.
///
/// Each connection bumps the device's generation, so handles from an earlier
/// connection compare unequal to current ones.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct FakeHandle {
    device: Identifier,
    generation: u64,
    location: Location,
    identifier: Identifier,
}

impl FakeHandle {
    /// Identifier of the device this handle belongs to.
    #[must_use]
    pub fn device(&self) -> Identifier {
        self.device
    }

    /// Connection generation this handle was issued for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Handle for FakeHandle {
    fn identifier(&self) -> Identifier {
        self.identifier
    }
}

/// Channel returned when a fake L2CAP channel opens.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FakeL2capChannel {
    pub psm: u16,
}

/// Command recorded by the fake, identified by device and attribute identifiers.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FakeCommand {
    Scan {
        services: Option<Vec<Identifier>>,
    },
    StopScan,
    Connect {
        device: Identifier,
    },
    CancelConnection {
        device: Identifier,
    },
    DiscoverServices {
        device: Identifier,
        filter: Option<Vec<Identifier>>,
    },
    DiscoverIncludedServices {
        device: Identifier,
        service: Identifier,
        filter: Option<Vec<Identifier>>,
    },
    DiscoverCharacteristics {
        device: Identifier,
        service: Identifier,
        filter: Option<Vec<Identifier>>,
    },
    DiscoverDescriptors {
        device: Identifier,
        characteristic: Identifier,
    },
    ReadCharacteristic {
        device: Identifier,
        characteristic: Identifier,
    },
    WriteCharacteristic {
        device: Identifier,
        characteristic: Identifier,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        device: Identifier,
        characteristic: Identifier,
        enabled: bool,
    },
    ReadDescriptor {
        device: Identifier,
        descriptor: Identifier,
    },
    WriteDescriptor {
        device: Identifier,
        descriptor: Identifier,
        value: Vec<u8>,
    },
    ReadRssi {
        device: Identifier,
    },
    OpenL2capChannel {
        device: Identifier,
        psm: u16,
    },
}

impl FakeCommand {
    /// Returns whether the command is any kind of discovery.
    #[must_use]
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            Self::DiscoverServices { .. }
                | Self::DiscoverIncludedServices { .. }
                | Self::DiscoverCharacteristics { .. }
                | Self::DiscoverDescriptors { .. }
        )
    }
}

/// Commands whose next completion can be scripted to fail.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FakeOperation {
    Connect,
    DiscoverServices,
    DiscoverIncludedServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    ReadCharacteristic,
    WriteCharacteristic,
    SetNotify,
    ReadDescriptor,
    WriteDescriptor,
    ReadRssi,
    OpenL2capChannel,
}

#[derive(Debug)]
struct DeviceState {
    device: FakeDevice,
    generation: u64,
    connection: ConnectionState,
    discovered: HashSet<Location>,
}

impl DeviceState {
    fn handle(&self, location: Location, identifier: Identifier) -> FakeHandle {
        FakeHandle {
            device: self.device.identifier,
            generation: self.generation,
            location,
            identifier,
        }
    }

    fn peripheral_handle(&self) -> FakeHandle {
        self.handle(Location::Peripheral, self.device.identifier)
    }

    fn is_current(&self, handle: &FakeHandle) -> bool {
        handle.generation == self.generation
    }

    fn is_live(&self, handle: &FakeHandle) -> bool {
        self.is_current(handle) && self.connection == ConnectionState::Connected
    }

    /// Handle for a discovered location, reissued at the current generation.
    fn handle_at(&self, location: &Location) -> Option<FakeHandle> {
        let identifier = match location {
            Location::Peripheral => self.device.identifier,
            Location::Service(path) => self.device.service_at(path)?.identifier,
            Location::Characteristic(path, index) => {
                self.device.characteristic_at(path, *index)?.identifier
            }
            Location::Descriptor(path, index, descriptor) => {
                self.device
                    .characteristic_at(path, *index)?
                    .descriptors
                    .get(*descriptor)?
                    .identifier
            }
        };
        Some(self.handle(location.clone(), identifier))
    }
}

struct FakeState {
    radio: ManagerState,
    devices: Vec<DeviceState>,
    commands: Vec<FakeCommand>,
    pending: VecDeque<TransportEvent<FakeTransport>>,
    sink: Option<EventSink<FakeTransport>>,
    auto_respond: bool,
    failures: HashMap<FakeOperation, TransportError>,
    scanning: bool,
}

impl FakeState {
    fn emit(&mut self, event: TransportEvent<FakeTransport>) {
        match &self.sink {
            Some(sink) => {
                sink.post(event);
            }
            None => self.pending.push_back(event),
        }
    }

    fn device(&self, identifier: Identifier) -> Option<&DeviceState> {
        self.devices
            .iter()
            .find(|state| state.device.identifier == identifier)
    }

    fn device_mut(&mut self, identifier: Identifier) -> Option<&mut DeviceState> {
        self.devices
            .iter_mut()
            .find(|state| state.device.identifier == identifier)
    }

    /// Device behind `handle` when the handle belongs to the live connection.
    fn live_device_mut(&mut self, handle: &FakeHandle) -> Option<&mut DeviceState> {
        self.device_mut(handle.device)
            .filter(|state| state.is_live(handle))
    }

    fn take_failure(&mut self, operation: FakeOperation) -> Option<TransportError> {
        self.failures.remove(&operation)
    }

    fn complete_connection(&mut self, device: Identifier) {
        let failure = self.take_failure(FakeOperation::Connect);
        let Some(state) = self.device_mut(device) else {
            return;
        };
        let event = match failure {
            Some(error) => {
                state.connection = ConnectionState::Disconnected;
                TransportEvent::FailedToConnect {
                    peripheral: state.peripheral_handle(),
                    error,
                }
            }
            None if !state.device.connectable => {
                state.connection = ConnectionState::Disconnected;
                TransportEvent::FailedToConnect {
                    peripheral: state.peripheral_handle(),
                    error: TransportError::new(0x3e, "connection failed to be established"),
                }
            }
            None => {
                state.generation += 1;
                state.connection = ConnectionState::Connected;
                TransportEvent::Connected {
                    peripheral: state.peripheral_handle(),
                }
            }
        };
        self.emit(event);
    }

    fn complete_service_discovery(&mut self, peripheral: &FakeHandle, filter: Option<&[Identifier]>) {
        let failure = self.take_failure(FakeOperation::DiscoverServices);
        let Some(state) = self.live_device_mut(peripheral) else {
            return;
        };
        if failure.is_none() {
            for (index, service) in state.device.services.iter().enumerate() {
                if filter.is_none_or(|filter| filter.contains(&service.identifier)) {
                    state.discovered.insert(Location::Service(vec![index]));
                }
            }
        }
        self.emit(TransportEvent::ServicesDiscovered {
            peripheral: peripheral.clone(),
            error: failure,
        });
    }
}

/// In-memory transport. Clones share the same simulated radio.
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("FakeTransport")
            .field("radio", &state.radio)
            .field("devices", &state.devices.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl FakeTransport {
    /// Creates a powered-on fake with no devices that answers every command.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                radio: ManagerState::PoweredOn,
                devices: Vec::new(),
                commands: Vec::new(),
                pending: VecDeque::new(),
                sink: None,
                auto_respond: true,
                failures: HashMap::new(),
                scanning: false,
            })),
        }
    }

    /// Creates a fake seeded with the devices of a scan fixture.
    #[must_use]
    pub fn from_fixture(fixture: ScanFixture) -> Self {
        let fake = Self::new();
        let devices: Vec<FakeDevice> = fixture.into();
        for device in devices {
            fake.add_device(device);
        }
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record(&self, command: FakeCommand) -> MutexGuard<'_, FakeState> {
        let mut state = self.lock();
        state.commands.push(command);
        state
    }

    /// Routes future events to `sink` instead of the internal queue.
    pub fn attach_sink(&self, sink: EventSink<FakeTransport>) {
        let mut state = self.lock();
        while let Some(event) = state.pending.pop_front() {
            sink.post(event);
        }
        state.sink = Some(sink);
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.lock().devices.push(DeviceState {
            device,
            generation: 0,
            connection: ConnectionState::Disconnected,
            discovered: HashSet::new(),
        });
    }

    /// When disabled, commands are only recorded and completions must be
    /// triggered explicitly.
    pub fn set_auto_respond(&self, enabled: bool) {
        self.lock().auto_respond = enabled;
    }

    /// Makes the next completion of `operation` carry `error`.
    pub fn fail_next(&self, operation: FakeOperation, error: TransportError) {
        self.lock().failures.insert(operation, error);
    }

    /// Commands issued so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<FakeCommand> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    /// Pops the oldest queued event.
    #[must_use]
    pub fn next_event(&self) -> Option<TransportEvent<FakeTransport>> {
        self.lock().pending.pop_front()
    }

    /// Feeds queued events into `core` until none remain, including events
    /// emitted while handling earlier ones. Returns how many were delivered.
    pub fn pump(&self, core: &mut CentralManagerCore<FakeTransport>) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.next_event() {
            core.handle_event(event);
            delivered += 1;
        }
        delivered
    }

    /// Changes the radio state and announces it.
    pub fn set_radio_state(&self, radio: ManagerState) {
        let mut state = self.lock();
        state.radio = radio;
        if radio != ManagerState::PoweredOn {
            state.scanning = false;
            for device in &mut state.devices {
                device.connection = ConnectionState::Disconnected;
            }
        }
        state.emit(TransportEvent::StateChanged(radio));
    }

    /// Connects `device` without going through a command or emitting events.
    pub fn simulate_connection(&self, device: Identifier) -> FakeHandle {
        let mut state = self.lock();
        match state.device_mut(device) {
            Some(device) => {
                device.generation += 1;
                device.connection = ConnectionState::Connected;
                device.peripheral_handle()
            }
            None => FakeHandle {
                device,
                generation: 0,
                location: Location::Peripheral,
                identifier: device,
            },
        }
    }

    /// Marks every attribute of `device` as discovered, as a platform cache would.
    pub fn mark_all_discovered(&self, device: Identifier) {
        let mut state = self.lock();
        if let Some(device) = state.device_mut(device) {
            let locations = device.device.all_locations();
            device.discovered.extend(locations);
        }
    }

    /// Drops the platform's discovery cache for `device`.
    pub fn forget_cache(&self, device: Identifier) {
        if let Some(device) = self.lock().device_mut(device) {
            device.discovered.clear();
        }
    }

    /// Completes a connect issued while auto-respond was off.
    pub fn complete_connection(&self, device: Identifier) {
        self.lock().complete_connection(device);
    }

    /// Completes a service discovery issued while auto-respond was off.
    pub fn complete_service_discovery(&self, device: Identifier) {
        let mut state = self.lock();
        let Some(handle) = state.device(device).map(DeviceState::peripheral_handle) else {
            return;
        };
        state.complete_service_discovery(&handle, None);
    }

    /// Drops the connection from the remote side.
    pub fn disconnect_remote(&self, device: Identifier, error: Option<TransportError>) {
        let mut state = self.lock();
        let Some(device) = state.device_mut(device) else {
            return;
        };
        if device.connection == ConnectionState::Disconnected {
            return;
        }
        device.connection = ConnectionState::Disconnected;
        let peripheral = device.peripheral_handle();
        state.emit(TransportEvent::Disconnected { peripheral, error });
    }

    /// Changes a characteristic value and emits it as a notification.
    pub fn notify(&self, device: Identifier, characteristic: Identifier, value: &[u8]) {
        let mut state = self.lock();
        let Some(device) = state.device_mut(device) else {
            return;
        };
        if device.connection != ConnectionState::Connected {
            return;
        }
        let location = device.discovered.iter().find_map(|location| match location {
            Location::Characteristic(path, index)
                if device
                    .device
                    .characteristic_at(path, *index)
                    .is_some_and(|found| found.identifier == characteristic) =>
            {
                Some((path.clone(), *index))
            }
            _ => None,
        });
        let Some((path, index)) = location else {
            return;
        };
        if let Some(model) = device.device.characteristic_at_mut(&path, index) {
            model.value = value.to_vec();
        }
        let peripheral = device.peripheral_handle();
        let handle = device.handle(Location::Characteristic(path, index), characteristic);
        state.emit(TransportEvent::CharacteristicValueUpdated {
            peripheral,
            characteristic: handle,
            value: Ok(value.to_vec()),
        });
    }

    /// Invalidates the top-level services named by `services` and announces it.
    pub fn modify_services(&self, device: Identifier, services: &[Identifier]) {
        let mut state = self.lock();
        let Some(device) = state.device_mut(device) else {
            return;
        };
        let mut invalidated = Vec::new();
        for (index, service) in device.device.services.iter().enumerate() {
            let path = vec![index];
            if services.contains(&service.identifier)
                && device.discovered.contains(&Location::Service(path.clone()))
            {
                invalidated.push(device.handle(Location::Service(path.clone()), service.identifier));
                device
                    .discovered
                    .retain(|location| !location.is_within_service(&path));
            }
        }
        let peripheral = device.peripheral_handle();
        state.emit(TransportEvent::ServicesModified {
            peripheral,
            invalidated,
        });
    }

    /// Changes the advertised name and announces it to connected observers.
    pub fn rename(&self, device: Identifier, name: Option<String>) {
        let mut state = self.lock();
        let Some(device) = state.device_mut(device) else {
            return;
        };
        device.device.name.clone_from(&name);
        let peripheral = device.peripheral_handle();
        state.emit(TransportEvent::NameUpdated { peripheral, name });
    }

    /// Signals that the write-without-response buffer has drained.
    pub fn ready_to_send(&self, device: Identifier) {
        let mut state = self.lock();
        let Some(peripheral) = state.device(device).map(DeviceState::peripheral_handle) else {
            return;
        };
        state.emit(TransportEvent::ReadyToSendWriteWithoutResponse { peripheral });
    }

    /// Hands back connected devices as a platform relaunch would.
    pub fn restore_state(&self, devices: &[Identifier], scan_services: Option<Vec<Identifier>>) {
        let mut state = self.lock();
        let peripherals = devices
            .iter()
            .filter_map(|device| state.device(*device).map(DeviceState::peripheral_handle))
            .collect();
        state.emit(TransportEvent::WillRestoreState(RestoredState {
            peripherals,
            scan_options: scan_services.as_ref().map(|_| ScanOptions::default()),
            scan_services,
        }));
    }

    /// Current value of a characteristic in the simulated database.
    #[must_use]
    pub fn stored_value(&self, device: Identifier, characteristic: Identifier) -> Option<Vec<u8>> {
        let state = self.lock();
        let device = state.device(device)?;
        device.device.all_locations().into_iter().find_map(|location| match location {
            Location::Characteristic(path, index) => device
                .device
                .characteristic_at(&path, index)
                .filter(|found| found.identifier == characteristic)
                .map(|found| found.value.clone()),
            _ => None,
        })
    }

    /// Handle for `device` at its current generation.
    #[must_use]
    pub fn handle_for(&self, device: Identifier) -> Option<FakeHandle> {
        self.lock().device(device).map(DeviceState::peripheral_handle)
    }

    fn children(&self, parent: &FakeHandle, select: impl Fn(&Location) -> bool) -> Vec<FakeHandle> {
        let state = self.lock();
        let Some(device) = state.device(parent.device) else {
            return Vec::new();
        };
        if !device.is_current(parent) {
            return Vec::new();
        }
        device
            .device
            .all_locations()
            .into_iter()
            .filter(|location| device.discovered.contains(location) && select(location))
            .filter_map(|location| device.handle_at(&location))
            .collect()
    }
}

impl Transport for FakeTransport {
    type Peripheral = FakeHandle;
    type Service = FakeHandle;
    type Characteristic = FakeHandle;
    type Descriptor = FakeHandle;
    type L2capChannel = FakeL2capChannel;

    fn state(&self) -> ManagerState {
        self.lock().radio
    }

    fn scan(&mut self, services: Option<&[Identifier]>, _options: &ScanOptions) {
        let mut state = self.record(FakeCommand::Scan {
            services: services.map(<[Identifier]>::to_vec),
        });
        state.scanning = true;
        if !state.auto_respond {
            return;
        }
        let found: Vec<_> = state
            .devices
            .iter()
            .filter(|device| device.device.matches_scan(services))
            .map(|device| {
                (
                    device.peripheral_handle(),
                    device.device.advertisement.clone(),
                    device.device.rssi,
                )
            })
            .collect();
        for (peripheral, advertisement, rssi) in found {
            state.emit(TransportEvent::Discovered {
                peripheral,
                advertisement,
                rssi,
            });
        }
    }

    fn stop_scan(&mut self) {
        self.record(FakeCommand::StopScan).scanning = false;
    }

    fn connect(&mut self, peripheral: &FakeHandle, _options: &ConnectOptions) {
        let mut state = self.record(FakeCommand::Connect {
            device: peripheral.device,
        });
        if let Some(device) = state.device_mut(peripheral.device) {
            device.connection = ConnectionState::Connecting;
        }
        if state.auto_respond {
            state.complete_connection(peripheral.device);
        }
    }

    fn cancel_connection(&mut self, peripheral: &FakeHandle) {
        let mut state = self.record(FakeCommand::CancelConnection {
            device: peripheral.device,
        });
        let Some(device) = state.device_mut(peripheral.device) else {
            return;
        };
        if device.connection == ConnectionState::Disconnected {
            return;
        }
        device.connection = ConnectionState::Disconnected;
        let handle = device.peripheral_handle();
        state.emit(TransportEvent::Disconnected {
            peripheral: handle,
            error: None,
        });
    }

    fn retrieve_peripherals(&self, identifiers: &[Identifier]) -> Vec<FakeHandle> {
        let state = self.lock();
        identifiers
            .iter()
            .filter_map(|identifier| state.device(*identifier))
            .map(DeviceState::peripheral_handle)
            .collect()
    }

    fn retrieve_connected_peripherals(&self, services: &[Identifier]) -> Vec<FakeHandle> {
        let state = self.lock();
        state
            .devices
            .iter()
            .filter(|device| device.connection == ConnectionState::Connected)
            .filter(|device| {
                device
                    .device
                    .services
                    .iter()
                    .any(|service| services.contains(&service.identifier))
            })
            .map(DeviceState::peripheral_handle)
            .collect()
    }

    fn peripheral_state(&self, peripheral: &FakeHandle) -> ConnectionState {
        self.lock()
            .device(peripheral.device)
            .filter(|device| device.is_current(peripheral))
            .map_or(ConnectionState::Disconnected, |device| device.connection)
    }

    fn peripheral_name(&self, peripheral: &FakeHandle) -> Option<String> {
        self.lock()
            .device(peripheral.device)
            .and_then(|device| device.device.name.clone())
    }

    fn discover_services(&mut self, peripheral: &FakeHandle, services: Option<&[Identifier]>) {
        let mut state = self.record(FakeCommand::DiscoverServices {
            device: peripheral.device,
            filter: services.map(<[Identifier]>::to_vec),
        });
        if state.auto_respond {
            state.complete_service_discovery(peripheral, services);
        }
    }

    fn discover_included_services(
        &mut self,
        peripheral: &FakeHandle,
        service: &FakeHandle,
        services: Option<&[Identifier]>,
    ) {
        let mut state = self.record(FakeCommand::DiscoverIncludedServices {
            device: peripheral.device,
            service: service.identifier,
            filter: services.map(<[Identifier]>::to_vec),
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::DiscoverIncludedServices);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let Location::Service(path) = &service.location else {
            return;
        };
        if failure.is_none()
            && let Some(model) = device.device.service_at(path)
        {
            let found: Vec<_> = model
                .included
                .iter()
                .enumerate()
                .filter(|(_, included)| {
                    services.is_none_or(|filter| filter.contains(&included.identifier))
                })
                .map(|(index, _)| {
                    let mut child = path.clone();
                    child.push(index);
                    Location::Service(child)
                })
                .collect();
            device.discovered.extend(found);
        }
        state.emit(TransportEvent::IncludedServicesDiscovered {
            peripheral: peripheral.clone(),
            service: service.clone(),
            error: failure,
        });
    }

    fn discover_characteristics(
        &mut self,
        peripheral: &FakeHandle,
        service: &FakeHandle,
        characteristics: Option<&[Identifier]>,
    ) {
        let mut state = self.record(FakeCommand::DiscoverCharacteristics {
            device: peripheral.device,
            service: service.identifier,
            filter: characteristics.map(<[Identifier]>::to_vec),
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::DiscoverCharacteristics);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let Location::Service(path) = &service.location else {
            return;
        };
        if failure.is_none()
            && let Some(model) = device.device.service_at(path)
        {
            let found: Vec<_> = model
                .characteristics
                .iter()
                .enumerate()
                .filter(|(_, characteristic)| {
                    characteristics.is_none_or(|filter| filter.contains(&characteristic.identifier))
                })
                .map(|(index, _)| Location::Characteristic(path.clone(), index))
                .collect();
            device.discovered.extend(found);
        }
        state.emit(TransportEvent::CharacteristicsDiscovered {
            peripheral: peripheral.clone(),
            service: service.clone(),
            error: failure,
        });
    }

    fn discover_descriptors(&mut self, peripheral: &FakeHandle, characteristic: &FakeHandle) {
        let mut state = self.record(FakeCommand::DiscoverDescriptors {
            device: peripheral.device,
            characteristic: characteristic.identifier,
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::DiscoverDescriptors);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let Location::Characteristic(path, index) = &characteristic.location else {
            return;
        };
        if failure.is_none()
            && let Some(model) = device.device.characteristic_at(path, *index)
        {
            let found: Vec<_> = (0..model.descriptors.len())
                .map(|descriptor| Location::Descriptor(path.clone(), *index, descriptor))
                .collect();
            device.discovered.extend(found);
        }
        state.emit(TransportEvent::DescriptorsDiscovered {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            error: failure,
        });
    }

    fn read_characteristic(&mut self, peripheral: &FakeHandle, characteristic: &FakeHandle) {
        let mut state = self.record(FakeCommand::ReadCharacteristic {
            device: peripheral.device,
            characteristic: characteristic.identifier,
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::ReadCharacteristic);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let Location::Characteristic(path, index) = &characteristic.location else {
            return;
        };
        let value = match failure {
            Some(error) => Err(error),
            None => device
                .device
                .characteristic_at(path, *index)
                .map(|model| model.value.clone())
                .ok_or_else(|| TransportError::new(0x0a, "attribute not found")),
        };
        state.emit(TransportEvent::CharacteristicValueUpdated {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            value,
        });
    }

    fn write_characteristic(
        &mut self,
        peripheral: &FakeHandle,
        characteristic: &FakeHandle,
        value: &[u8],
        write_type: WriteType,
    ) {
        let mut state = self.record(FakeCommand::WriteCharacteristic {
            device: peripheral.device,
            characteristic: characteristic.identifier,
            value: value.to_vec(),
            write_type,
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::WriteCharacteristic);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let Location::Characteristic(path, index) = &characteristic.location else {
            return;
        };
        if failure.is_none()
            && let Some(model) = device.device.characteristic_at_mut(path, *index)
        {
            model.value = value.to_vec();
        }
        if write_type == WriteType::WithResponse {
            state.emit(TransportEvent::CharacteristicWritten {
                peripheral: peripheral.clone(),
                characteristic: characteristic.clone(),
                error: failure,
            });
        }
    }

    fn set_notify(&mut self, peripheral: &FakeHandle, characteristic: &FakeHandle, enabled: bool) {
        let mut state = self.record(FakeCommand::SetNotify {
            device: peripheral.device,
            characteristic: characteristic.identifier,
            enabled,
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::SetNotify);
        if state.live_device_mut(peripheral).is_none() {
            return;
        }
        state.emit(TransportEvent::NotificationStateUpdated {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            result: failure.map_or(Ok(enabled), Err),
        });
    }

    fn read_descriptor(&mut self, peripheral: &FakeHandle, descriptor: &FakeHandle) {
        let mut state = self.record(FakeCommand::ReadDescriptor {
            device: peripheral.device,
            descriptor: descriptor.identifier,
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::ReadDescriptor);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let Location::Descriptor(path, index, position) = &descriptor.location else {
            return;
        };
        let value = match failure {
            Some(error) => Err(error),
            None => device
                .device
                .characteristic_at(path, *index)
                .and_then(|model| model.descriptors.get(*position))
                .map(|model| model.value.clone())
                .ok_or_else(|| TransportError::new(0x0a, "attribute not found")),
        };
        state.emit(TransportEvent::DescriptorValueUpdated {
            peripheral: peripheral.clone(),
            descriptor: descriptor.clone(),
            value,
        });
    }

    fn write_descriptor(&mut self, peripheral: &FakeHandle, descriptor: &FakeHandle, value: &[u8]) {
        let mut state = self.record(FakeCommand::WriteDescriptor {
            device: peripheral.device,
            descriptor: descriptor.identifier,
            value: value.to_vec(),
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::WriteDescriptor);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let Location::Descriptor(path, index, position) = &descriptor.location else {
            return;
        };
        if failure.is_none()
            && let Some(model) = device
                .device
                .characteristic_at_mut(path, *index)
                .and_then(|model| model.descriptors.get_mut(*position))
        {
            model.value = value.to_vec();
        }
        state.emit(TransportEvent::DescriptorWritten {
            peripheral: peripheral.clone(),
            descriptor: descriptor.clone(),
            error: failure,
        });
    }

    fn read_rssi(&mut self, peripheral: &FakeHandle) {
        let mut state = self.record(FakeCommand::ReadRssi {
            device: peripheral.device,
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::ReadRssi);
        let Some(device) = state.live_device_mut(peripheral) else {
            return;
        };
        let rssi = failure.map_or(Ok(device.device.rssi), Err);
        state.emit(TransportEvent::RssiRead {
            peripheral: peripheral.clone(),
            rssi,
        });
    }

    fn open_l2cap_channel(&mut self, peripheral: &FakeHandle, psm: u16) {
        let mut state = self.record(FakeCommand::OpenL2capChannel {
            device: peripheral.device,
            psm,
        });
        if !state.auto_respond {
            return;
        }
        let failure = state.take_failure(FakeOperation::OpenL2capChannel);
        if state.live_device_mut(peripheral).is_none() {
            return;
        }
        state.emit(TransportEvent::L2capChannelOpened {
            peripheral: peripheral.clone(),
            psm,
            channel: failure.map_or(Ok(FakeL2capChannel { psm }), Err),
        });
    }

    fn maximum_write_length(&self, _peripheral: &FakeHandle, write_type: WriteType) -> usize {
        match write_type {
            WriteType::WithResponse => MAXIMUM_WRITE_WITH_RESPONSE,
            WriteType::WithoutResponse => MAXIMUM_WRITE_WITHOUT_RESPONSE,
        }
    }

    fn can_send_write_without_response(&self, peripheral: &FakeHandle) -> bool {
        self.lock()
            .device(peripheral.device)
            .is_some_and(|device| device.is_live(peripheral))
    }

    fn services(&self, peripheral: &FakeHandle) -> Vec<FakeHandle> {
        self.children(peripheral, |location| {
            matches!(location, Location::Service(path) if path.len() == 1)
        })
    }

    fn included_services(&self, service: &FakeHandle) -> Vec<FakeHandle> {
        let Location::Service(parent) = &service.location else {
            return Vec::new();
        };
        self.children(service, |location| {
            matches!(location, Location::Service(path)
                if path.len() == parent.len() + 1 && path.starts_with(parent))
        })
    }

    fn characteristics(&self, service: &FakeHandle) -> Vec<FakeHandle> {
        let Location::Service(parent) = &service.location else {
            return Vec::new();
        };
        self.children(service, |location| {
            matches!(location, Location::Characteristic(path, _) if path == parent)
        })
    }

    fn descriptors(&self, characteristic: &FakeHandle) -> Vec<FakeHandle> {
        let Location::Characteristic(parent, owner) = &characteristic.location else {
            return Vec::new();
        };
        self.children(characteristic, |location| {
            matches!(location, Location::Descriptor(path, index, _)
                if path == parent && index == owner)
        })
    }

    fn is_primary(&self, service: &FakeHandle) -> bool {
        let Location::Service(path) = &service.location else {
            return false;
        };
        self.lock()
            .device(service.device)
            .and_then(|device| device.device.service_at(path))
            .is_some_and(|model| model.primary)
    }

    fn characteristic_properties(&self, characteristic: &FakeHandle) -> CharacteristicProperties {
        let Location::Characteristic(path, index) = &characteristic.location else {
            return CharacteristicProperties::empty();
        };
        self.lock()
            .device(characteristic.device)
            .and_then(|device| device.device.characteristic_at(path, *index))
            .map_or(CharacteristicProperties::empty(), |model| model.properties)
    }
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<FakeDevice>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_scan_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_scan_record(raw_record: &str) -> Result<FakeDevice, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let identifier = fields[0].parse::<Identifier>()?;
    let name = (fields[1] != "-").then(|| fields[1].to_string());
    let rssi = fields[2].parse::<i16>()?;
    let services = if fields[3] == "-" {
        Vec::new()
    } else {
        fields[3]
            .split(',')
            .map(|raw| raw.trim().parse::<Identifier>())
            .collect::<Result<Vec<_>, _>>()?
    };

    let advertisement = Advertisement::builder()
        .maybe_local_name(name.clone())
        .service_identifiers(services.clone())
        .build();
    Ok(FakeDevice::builder()
        .identifier(identifier)
        .maybe_name(name)
        .advertisement(advertisement)
        .rssi(rssi)
        .services(services.into_iter().map(FakeService::new).collect())
        .build())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("fee0|Cube|-43|180f", 1)]
    #[case("fee0|Cube|-43|180f;fee1|-|-55|-", 2)]
    fn parse_scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let devices = parse_scan_fixture(fixture).expect("fixture should parse");
        assert_eq!(expected_count, devices.len());
    }

    #[test]
    fn parse_scan_fixture_rejects_invalid_field_count() {
        let result = parse_scan_fixture("fee0|Cube|-43");
        assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount));
    }

    #[test]
    fn parse_scan_fixture_rejects_bad_identifier() {
        let result = parse_scan_fixture("xyz|Cube|-43|-");
        assert_matches!(result, Err(FixtureError::InvalidIdentifier(_)));
    }

    #[test]
    fn hex_payload_rejects_odd_length() {
        let result = "A".parse::<HexPayload>();
        assert_matches!(result, Err(FixtureError::InvalidHex(_)));
    }

    #[test]
    fn hex_payload_ignores_whitespace() {
        let payload: Vec<u8> = "05 00 01".parse::<HexPayload>().expect("hex").into();
        assert_eq!(vec![0x05, 0x00, 0x01], payload);
    }

    #[test]
    fn handles_from_earlier_connection_vend_nothing() {
        let device = Identifier::from_u16(0xfee0);
        let fake = FakeTransport::new();
        fake.add_device(
            FakeDevice::builder()
                .identifier(device)
                .services(vec![FakeService::new(Identifier::from_u16(0x180f))])
                .build(),
        );
        let first = fake.simulate_connection(device);
        fake.mark_all_discovered(device);
        assert_eq!(1, fake.services(&first).len());

        let second = fake.simulate_connection(device);
        assert_ne!(first, second);
        assert!(fake.services(&first).is_empty());
        assert_eq!(1, fake.services(&second).len());
    }

    #[test]
    fn scan_reports_matching_devices_only() {
        let fixture: ScanFixture = "fee0|Cube|-43|180f;fee1|Speaker|-55|180d"
            .parse()
            .expect("fixture should parse");
        let mut fake = FakeTransport::from_fixture(fixture);
        fake.scan(Some(&[Identifier::from_u16(0x180d)]), &ScanOptions::default());

        let event = fake.next_event();
        assert_matches!(
            event,
            Some(TransportEvent::Discovered { peripheral, rssi: -55, .. })
                if peripheral.identifier() == Identifier::from_u16(0xfee1)
        );
        assert!(fake.next_event().is_none());
    }
}
