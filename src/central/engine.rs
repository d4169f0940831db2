use std::time::Duration;

use tracing::{debug, info, instrument, trace, warn};

use super::delegate::{CentralDelegate, PeripheralDataSource, PeripheralDelegate};
use super::discovery::DiscoveryPolicy;
use super::request::{Request, ResponderLink};
use crate::advertisement::Advertisement;
use crate::error::{GattError, TransportError};
use crate::gatt::tree::GattTree;
use crate::gatt::{
    Characteristic, CharacteristicInfo, Descriptor, DescriptorInfo, Peripheral, PeripheralInfo,
    PeripheralKey, Service, ServiceInfo,
};
use crate::identifier::Identifier;
use crate::responder::{Dispatch, Message, try_dispatch};
use crate::transport::{
    ConnectOptions, ConnectionState, Handle, ManagerState, ScanOptions, Transport, TransportEvent,
};

/// Receives L2CAP channels opened through
/// [`CentralManagerCore::open_l2cap_channel`].
pub type L2capHandler<T> =
    Box<dyn FnMut(Peripheral, u16, Result<<T as Transport>::L2capChannel, GattError>) + Send>;

/// Ticket for one armed scan timeout.
///
/// Every call to [`CentralManagerCore::start_scanning`] invalidates earlier
/// tickets, so a timer that fires late cannot stop a newer scan.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScanTimer {
    ticket: u64,
    timeout: Duration,
}

impl ScanTimer {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScanSession {
    pub(crate) active: bool,
    pub(crate) services: Option<Vec<Identifier>>,
    pub(crate) options: ScanOptions,
    issued: u64,
    armed: Option<u64>,
}

/// Owns the peripheral table, the proxy arena and the transport. Every
/// mutation takes `&mut self`, so the owner of the core serializes all work.
pub struct CentralManagerCore<T: Transport> {
    pub(crate) transport: T,
    pub(crate) tree: GattTree<T>,
    pub(crate) default_policy: DiscoveryPolicy,
    pub(crate) scan: ScanSession,
    delegate: Option<Box<dyn CentralDelegate>>,
    data_source: Option<Box<dyn PeripheralDataSource>>,
    peripheral_delegate: Option<Box<dyn PeripheralDelegate>>,
    l2cap_handler: Option<L2capHandler<T>>,
}

impl<T: Transport> CentralManagerCore<T> {
    #[must_use]
    pub fn new(transport: T, default_policy: DiscoveryPolicy) -> Self {
        Self {
            transport,
            tree: GattTree::default(),
            default_policy,
            scan: ScanSession::default(),
            delegate: None,
            data_source: None,
            peripheral_delegate: None,
            l2cap_handler: None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Current radio state as reported by the transport.
    pub fn state(&self) -> ManagerState {
        self.transport.state()
    }

    pub fn set_delegate(&mut self, delegate: Option<Box<dyn CentralDelegate>>) {
        self.delegate = delegate;
    }

    pub fn set_data_source(&mut self, data_source: Option<Box<dyn PeripheralDataSource>>) {
        self.data_source = data_source;
    }

    /// Fallback delegate for peripherals without their own.
    pub fn set_default_peripheral_delegate(&mut self, delegate: Option<Box<dyn PeripheralDelegate>>) {
        self.peripheral_delegate = delegate;
    }

    pub fn set_peripheral_delegate(
        &mut self,
        peripheral: Peripheral,
        delegate: Option<Box<dyn PeripheralDelegate>>,
    ) -> Result<(), GattError> {
        let node = self
            .tree
            .peripheral_mut(peripheral.key)
            .ok_or(GattError::UnknownEntity)?;
        node.delegate = delegate;
        Ok(())
    }

    pub fn set_l2cap_handler(&mut self, handler: Option<L2capHandler<T>>) {
        self.l2cap_handler = handler;
    }

    pub fn set_default_policy(&mut self, policy: DiscoveryPolicy) {
        self.default_policy = policy;
    }

    pub(crate) fn dispatch(
        &mut self,
        request: Request<T>,
        start: ResponderLink,
    ) -> Result<(), GattError> {
        match try_dispatch(self, request, start) {
            Dispatch::Handled(result) => result,
            Dispatch::Unhandled(request) => Err(GattError::Unhandled {
                request: request.name(),
            }),
        }
    }

    pub(crate) fn notify_central(&mut self, callback: impl FnOnce(&mut dyn CentralDelegate)) {
        if let Some(delegate) = self.delegate.as_deref_mut() {
            callback(delegate);
        }
    }

    /// Calls the peripheral's own delegate, or the manager fallback.
    pub(crate) fn notify_peripheral(
        &mut self,
        key: PeripheralKey,
        callback: impl FnOnce(&mut dyn PeripheralDelegate),
    ) {
        let own = self
            .tree
            .peripheral_mut(key)
            .and_then(|node| node.delegate.as_deref_mut());
        match own {
            Some(delegate) => callback(delegate),
            None => {
                if let Some(delegate) = self.peripheral_delegate.as_deref_mut() {
                    callback(delegate);
                }
            }
        }
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.scan.active
    }

    /// Starts scanning, or only re-arms the timeout when already scanning.
    ///
    /// Returns a ticket when `timeout` is set; the owner hands it back through
    /// [`on_scan_timeout`](Self::on_scan_timeout) once the timeout elapses.
    ///
    /// # Panics
    ///
    /// Panics when the radio is not powered on.
    #[instrument(skip(self, options), level = "debug")]
    pub fn start_scanning(
        &mut self,
        services: Option<Vec<Identifier>>,
        options: ScanOptions,
        timeout: Option<Duration>,
    ) -> Option<ScanTimer> {
        assert_eq!(
            ManagerState::PoweredOn,
            self.transport.state(),
            "scanning requires a powered-on radio"
        );
        self.scan.issued += 1;
        let timer = timeout.map(|timeout| ScanTimer {
            ticket: self.scan.issued,
            timeout,
        });
        self.scan.armed = timer.map(|timer| timer.ticket);

        if self.scan.active {
            trace!("already scanning; scan timer replaced");
        } else {
            self.transport.scan(services.as_deref(), &options);
            self.scan.active = true;
            self.scan.services = services;
            self.scan.options = options;
            info!("scan started");
        }
        timer
    }

    /// Stops scanning when `timer` is still the current ticket.
    pub fn on_scan_timeout(&mut self, timer: ScanTimer) {
        if self.scan.armed == Some(timer.ticket) {
            debug!(timeout = ?timer.timeout, "scan timer fired");
            self.stop_scanning();
        } else {
            trace!(ticket = timer.ticket, "ignoring stale scan timer");
        }
    }

    pub fn stop_scanning(&mut self) {
        self.scan.armed = None;
        if !self.scan.active {
            return;
        }
        self.transport.stop_scan();
        self.scan.active = false;
        info!("scan stopped");
        self.notify_central(|delegate| delegate.did_stop_scanning());
    }

    /// Returns the record for `handle`, creating it on first sight.
    ///
    /// New records are configured through the data source. Known records fold
    /// the advertisement into what they already have.
    pub(crate) fn register(
        &mut self,
        handle: T::Peripheral,
        advertisement: Advertisement,
        rssi: Option<i16>,
    ) -> (PeripheralKey, bool) {
        let identifier = handle.identifier();
        if let Some(key) = self.tree.lookup(identifier) {
            if let Some(node) = self.tree.peripheral_mut(key) {
                node.advertisement.merge(advertisement);
                if rssi.is_some() {
                    node.rssi = rssi;
                }
                if node.state == ConnectionState::Disconnected || node.platform.is_none() {
                    node.platform = Some(handle);
                }
            }
            return (key, false);
        }

        let setup = self
            .data_source
            .as_mut()
            .map(|source| source.setup(identifier, &advertisement))
            .unwrap_or_default();
        let name = self
            .transport
            .peripheral_name(&handle)
            .or_else(|| advertisement.local_name().map(str::to_owned));
        let key = self.tree.insert_peripheral(identifier, Some(handle));
        if let Some(node) = self.tree.peripheral_mut(key) {
            node.name = name;
            node.advertisement = advertisement;
            node.rssi = rssi;
            node.policy = setup.policy;
            node.delegate = setup.delegate;
        }
        debug!(%identifier, "registered peripheral");
        (key, true)
    }

    fn on_discovered(&mut self, handle: T::Peripheral, advertisement: Advertisement, rssi: i16) {
        let reported = advertisement.clone();
        let (key, created) = self.register(handle, advertisement, Some(rssi));
        if !created && !self.scan.options.allow_duplicates {
            return;
        }
        if let Some(peripheral) = self.tree.peripheral_proxy(key) {
            self.notify_central(|delegate| delegate.did_discover(peripheral, &reported, rssi));
        }
    }

    /// Starts connecting. Connecting an already connected or connecting
    /// peripheral does nothing.
    ///
    /// # Panics
    ///
    /// Panics when the radio is not powered on.
    #[instrument(skip(self, options), level = "debug", fields(peripheral = %peripheral.identifier))]
    pub fn connect(
        &mut self,
        peripheral: Peripheral,
        options: Option<ConnectOptions>,
    ) -> Result<(), GattError> {
        let node = self
            .tree
            .peripheral(peripheral.key)
            .ok_or(GattError::UnknownEntity)?;
        if matches!(
            node.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            trace!(state = %node.state, "connect ignored");
            return Ok(());
        }
        assert_eq!(
            ManagerState::PoweredOn,
            self.transport.state(),
            "connecting requires a powered-on radio"
        );
        let options = options.unwrap_or_else(|| node.connect_options.clone());
        let handle = match node.platform.clone() {
            Some(handle) => handle,
            None => self
                .transport
                .retrieve_peripherals(&[peripheral.identifier])
                .into_iter()
                .next()
                .ok_or(GattError::Unreachable {
                    identifier: peripheral.identifier,
                })?,
        };

        let previous = self.tree.peripheral_mut(peripheral.key).map(|node| {
            node.platform = Some(handle.clone());
            node.connect_options = options.clone();
            std::mem::replace(&mut node.state, ConnectionState::Connecting)
        });
        let result = self.dispatch(
            Request::Connect {
                peripheral: handle,
                options,
            },
            ResponderLink::Peripheral(peripheral.key),
        );
        if result.is_err()
            && let (Some(node), Some(previous)) = (self.tree.peripheral_mut(peripheral.key), previous)
        {
            node.state = previous;
        }
        result
    }

    /// Disconnects, or cancels a pending connection.
    #[instrument(skip(self), level = "debug", fields(peripheral = %peripheral.identifier))]
    pub fn cancel_connection(&mut self, peripheral: Peripheral) -> Result<(), GattError> {
        let node = self
            .tree
            .peripheral_mut(peripheral.key)
            .ok_or(GattError::UnknownEntity)?;
        if matches!(
            node.state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            trace!(state = %node.state, "disconnect ignored");
            return Ok(());
        }
        let handle = node
            .shadow
            .handle()
            .cloned()
            .or_else(|| node.platform.clone())
            .ok_or(GattError::Unreachable {
                identifier: peripheral.identifier,
            })?;
        node.state = ConnectionState::Disconnecting;
        self.dispatch(
            Request::CancelConnection { peripheral: handle },
            ResponderLink::Peripheral(peripheral.key),
        )
    }

    /// Disconnects every connected or connecting peripheral.
    pub fn cancel_all_connections(&mut self) {
        for peripheral in self.peripherals() {
            if let Err(error) = self.cancel_connection(peripheral) {
                warn!(%error, peripheral = %peripheral.identifier, "failed to cancel connection");
            }
        }
    }

    /// Drops a peripheral and its proxies from the table, disconnecting first.
    pub fn forget(&mut self, peripheral: Peripheral) -> Result<(), GattError> {
        self.cancel_connection(peripheral)?;
        self.tree
            .remove_peripheral(peripheral.key)
            .map(|_| ())
            .ok_or(GattError::UnknownEntity)
    }

    /// Known peripherals the platform can still vend, by identifier.
    pub fn retrieve_peripherals(&self, identifiers: &[Identifier]) -> Vec<Peripheral> {
        self.known(self.transport.retrieve_peripherals(identifiers))
    }

    /// Known peripherals currently connected with any of `services`.
    pub fn retrieve_connected_peripherals(&self, services: &[Identifier]) -> Vec<Peripheral> {
        self.known(self.transport.retrieve_connected_peripherals(services))
    }

    fn known(&self, handles: Vec<T::Peripheral>) -> Vec<Peripheral> {
        let mut peripherals: Vec<Peripheral> = Vec::with_capacity(handles.len());
        for handle in handles {
            let Some(peripheral) = self
                .tree
                .lookup(handle.identifier())
                .and_then(|key| self.tree.peripheral_proxy(key))
            else {
                continue;
            };
            if !peripherals.contains(&peripheral) {
                peripherals.push(peripheral);
            }
        }
        peripherals
    }

    /// Every peripheral in the table, in registration order.
    pub fn peripherals(&self) -> Vec<Peripheral> {
        self.tree
            .peripheral_keys()
            .iter()
            .filter_map(|key| self.tree.peripheral_proxy(*key))
            .collect()
    }

    pub fn peripheral(&self, identifier: Identifier) -> Option<Peripheral> {
        self.tree
            .lookup(identifier)
            .and_then(|key| self.tree.peripheral_proxy(key))
    }

    pub fn peripheral_info(&self, peripheral: Peripheral) -> Option<PeripheralInfo> {
        self.tree.peripheral_info(peripheral.key)
    }

    pub fn connection_state(&self, peripheral: Peripheral) -> Option<ConnectionState> {
        self.tree.peripheral(peripheral.key).map(|node| node.state)
    }

    pub fn services(&self, peripheral: Peripheral) -> Vec<Service> {
        self.tree
            .peripheral(peripheral.key)
            .map(|node| {
                node.services
                    .keys()
                    .filter_map(|key| self.tree.service_proxy(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First service with `identifier`.
    pub fn service(&self, peripheral: Peripheral, identifier: Identifier) -> Option<Service> {
        self.tree
            .peripheral(peripheral.key)
            .and_then(|node| node.services.first(identifier))
            .and_then(|key| self.tree.service_proxy(key))
    }

    /// Every service with `identifier`, in discovery order.
    pub fn services_with_identifier(
        &self,
        peripheral: Peripheral,
        identifier: Identifier,
    ) -> Vec<Service> {
        self.tree
            .peripheral(peripheral.key)
            .map(|node| {
                node.services
                    .all(identifier)
                    .filter_map(|key| self.tree.service_proxy(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn included_services(&self, service: Service) -> Vec<Service> {
        self.tree
            .service(service.key)
            .map(|node| {
                node.included
                    .keys()
                    .filter_map(|key| self.tree.service_proxy(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn service_info(&self, service: Service) -> Option<ServiceInfo> {
        self.tree.service_info(service.key)
    }

    pub fn characteristics(&self, service: Service) -> Vec<Characteristic> {
        self.tree
            .service(service.key)
            .map(|node| {
                node.characteristics
                    .keys()
                    .filter_map(|key| self.tree.characteristic_proxy(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn characteristic(&self, service: Service, identifier: Identifier) -> Option<Characteristic> {
        self.tree
            .service(service.key)
            .and_then(|node| node.characteristics.first(identifier))
            .and_then(|key| self.tree.characteristic_proxy(key))
    }

    /// Every characteristic of `service` with `identifier`, in discovery order.
    pub fn characteristics_with_identifier(
        &self,
        service: Service,
        identifier: Identifier,
    ) -> Vec<Characteristic> {
        self.tree
            .service(service.key)
            .map(|node| {
                node.characteristics
                    .all(identifier)
                    .filter_map(|key| self.tree.characteristic_proxy(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn characteristic_info(&self, characteristic: Characteristic) -> Option<CharacteristicInfo> {
        self.tree.characteristic_info(characteristic.key)
    }

    /// Last value read or notified for `characteristic`.
    pub fn value(&self, characteristic: Characteristic) -> Option<Vec<u8>> {
        self.tree
            .characteristic(characteristic.key)
            .and_then(|node| node.value.clone())
    }

    pub fn descriptors(&self, characteristic: Characteristic) -> Vec<Descriptor> {
        self.tree
            .characteristic(characteristic.key)
            .map(|node| {
                node.descriptors
                    .keys()
                    .filter_map(|key| self.tree.descriptor_proxy(key))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn descriptor(&self, characteristic: Characteristic, identifier: Identifier) -> Option<Descriptor> {
        self.tree
            .characteristic(characteristic.key)
            .and_then(|node| node.descriptors.first(identifier))
            .and_then(|key| self.tree.descriptor_proxy(key))
    }

    pub fn descriptor_info(&self, descriptor: Descriptor) -> Option<DescriptorInfo> {
        self.tree.descriptor_info(descriptor.key)
    }

    /// Applies one transport completion.
    #[instrument(skip_all, level = "trace", fields(event = event.name()))]
    pub fn handle_event(&mut self, event: TransportEvent<T>) {
        match event {
            TransportEvent::StateChanged(state) => self.on_state_changed(state),
            TransportEvent::WillRestoreState(restored) => self.on_will_restore_state(restored),
            TransportEvent::Discovered {
                peripheral,
                advertisement,
                rssi,
            } => self.on_discovered(peripheral, advertisement, rssi),
            TransportEvent::Connected { peripheral } => self.on_connected(peripheral),
            TransportEvent::FailedToConnect { peripheral, error } => {
                self.on_failed_to_connect(peripheral, error);
            }
            TransportEvent::Disconnected { peripheral, error } => {
                self.on_disconnected(peripheral, error);
            }
            TransportEvent::ServicesDiscovered { peripheral, error } => {
                self.on_services_discovered(peripheral, error);
            }
            TransportEvent::IncludedServicesDiscovered {
                peripheral,
                service,
                error,
            } => self.on_included_services_discovered(peripheral, service, error),
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                error,
            } => self.on_characteristics_discovered(peripheral, service, error),
            TransportEvent::DescriptorsDiscovered {
                peripheral,
                characteristic,
                error,
            } => self.on_descriptors_discovered(peripheral, characteristic, error),
            TransportEvent::CharacteristicValueUpdated {
                peripheral,
                characteristic,
                value,
            } => self.on_value_updated(peripheral, characteristic, value),
            TransportEvent::CharacteristicWritten {
                peripheral,
                characteristic,
                error,
            } => {
                self.with_characteristic(&peripheral, &characteristic, |core, key, proxy| {
                    let result = error.map_or(Ok(()), |error| Err(error.into()));
                    core.notify_peripheral(key, |delegate| delegate.did_write_value(proxy, result));
                });
            }
            TransportEvent::NotificationStateUpdated {
                peripheral,
                characteristic,
                result,
            } => {
                self.with_characteristic(&peripheral, &characteristic, |core, key, proxy| {
                    if let (Ok(notifying), Some(node)) =
                        (&result, core.tree.characteristic_mut(proxy.key))
                    {
                        node.notifying = *notifying;
                    }
                    let result = result.map_err(GattError::from);
                    core.notify_peripheral(key, |delegate| {
                        delegate.did_update_notification_state(proxy, result);
                    });
                });
            }
            TransportEvent::DescriptorValueUpdated {
                peripheral,
                descriptor,
                value,
            } => {
                self.with_descriptor(&peripheral, &descriptor, |core, key, proxy| {
                    if let (Ok(bytes), Some(node)) = (&value, core.tree.descriptor_mut(proxy.key)) {
                        node.value = Some(bytes.clone());
                    }
                    let value = value.map_err(GattError::from);
                    core.notify_peripheral(key, |delegate| {
                        delegate.did_update_descriptor_value(proxy, value);
                    });
                });
            }
            TransportEvent::DescriptorWritten {
                peripheral,
                descriptor,
                error,
            } => {
                self.with_descriptor(&peripheral, &descriptor, |core, key, proxy| {
                    let result = error.map_or(Ok(()), |error| Err(error.into()));
                    core.notify_peripheral(key, |delegate| {
                        delegate.did_write_descriptor(proxy, result);
                    });
                });
            }
            TransportEvent::RssiRead { peripheral, rssi } => {
                self.with_peripheral(&peripheral, |core, key, proxy| {
                    if let (Ok(rssi), Some(node)) = (&rssi, core.tree.peripheral_mut(key)) {
                        node.rssi = Some(*rssi);
                    }
                    let rssi = rssi.map_err(GattError::from);
                    core.notify_peripheral(key, |delegate| delegate.did_read_rssi(proxy, rssi));
                });
            }
            TransportEvent::NameUpdated { peripheral, name } => {
                self.with_peripheral(&peripheral, |core, key, proxy| {
                    if let Some(node) = core.tree.peripheral_mut(key) {
                        node.name.clone_from(&name);
                    }
                    core.notify_peripheral(key, |delegate| delegate.did_update_name(proxy, name));
                });
            }
            TransportEvent::ServicesModified {
                peripheral,
                invalidated,
            } => self.on_services_modified(peripheral, invalidated),
            TransportEvent::ReadyToSendWriteWithoutResponse { peripheral } => {
                self.with_peripheral(&peripheral, |core, key, proxy| {
                    core.notify_peripheral(key, |delegate| {
                        delegate.is_ready_to_send_write_without_response(proxy);
                    });
                });
            }
            TransportEvent::L2capChannelOpened {
                peripheral,
                psm,
                channel,
            } => {
                self.with_peripheral(&peripheral, |core, _, proxy| {
                    match core.l2cap_handler.as_mut() {
                        Some(handler) => handler(proxy, psm, channel.map_err(GattError::from)),
                        None => debug!(psm, "no l2cap handler installed; dropping channel"),
                    }
                });
            }
        }
    }

    fn with_peripheral(
        &mut self,
        handle: &T::Peripheral,
        apply: impl FnOnce(&mut Self, PeripheralKey, Peripheral),
    ) {
        let Some(key) = self.tree.find_live_peripheral(handle) else {
            trace!("dropping completion for a detached peripheral");
            return;
        };
        if let Some(proxy) = self.tree.peripheral_proxy(key) {
            apply(self, key, proxy);
        }
    }

    fn with_characteristic(
        &mut self,
        handle: &T::Peripheral,
        characteristic: &T::Characteristic,
        apply: impl FnOnce(&mut Self, PeripheralKey, Characteristic),
    ) {
        let Some(key) = self.tree.find_live_peripheral(handle) else {
            trace!("dropping completion for a detached peripheral");
            return;
        };
        let Some(proxy) = self
            .tree
            .find_characteristic(key, characteristic)
            .and_then(|found| self.tree.characteristic_proxy(found))
        else {
            trace!("dropping completion for an unknown characteristic");
            return;
        };
        apply(self, key, proxy);
    }

    fn with_descriptor(
        &mut self,
        handle: &T::Peripheral,
        descriptor: &T::Descriptor,
        apply: impl FnOnce(&mut Self, PeripheralKey, Descriptor),
    ) {
        let Some(key) = self.tree.find_live_peripheral(handle) else {
            trace!("dropping completion for a detached peripheral");
            return;
        };
        let Some(proxy) = self
            .tree
            .find_descriptor(key, descriptor)
            .and_then(|found| self.tree.descriptor_proxy(found))
        else {
            trace!("dropping completion for an unknown descriptor");
            return;
        };
        apply(self, key, proxy);
    }

    fn on_value_updated(
        &mut self,
        handle: T::Peripheral,
        characteristic: T::Characteristic,
        value: Result<Vec<u8>, TransportError>,
    ) {
        self.with_characteristic(&handle, &characteristic, |core, key, proxy| {
            if let (Ok(bytes), Some(node)) = (&value, core.tree.characteristic_mut(proxy.key)) {
                node.value = Some(bytes.clone());
            }
            let value = value.map_err(GattError::from);
            core.notify_peripheral(key, |delegate| delegate.did_update_value(proxy, value));
        });
    }

    fn on_state_changed(&mut self, state: ManagerState) {
        info!(%state, "radio state changed");
        if state != ManagerState::PoweredOn {
            for key in self.tree.peripheral_keys().to_vec() {
                let Some(node) = self.tree.peripheral_mut(key) else {
                    continue;
                };
                if node.state == ConnectionState::Disconnected {
                    continue;
                }
                node.state = ConnectionState::Disconnected;
                self.tree.detach_peripheral(key);
            }
            let was_scanning = self.scan.active;
            self.scan.active = false;
            self.scan.armed = None;
            if was_scanning {
                self.notify_central(|delegate| delegate.did_stop_scanning());
            }
        }
        self.notify_central(|delegate| delegate.did_update_state(state));
    }

    fn on_connected(&mut self, handle: T::Peripheral) {
        let Some(key) = self.tree.lookup(handle.identifier()) else {
            debug!(identifier = %handle.identifier(), "connection for an unknown peripheral");
            return;
        };
        let Some(node) = self.tree.peripheral_mut(key) else {
            return;
        };
        if node.state == ConnectionState::Connected && node.shadow.handle() == Some(&handle) {
            trace!("duplicate connection event");
            return;
        }
        node.state = ConnectionState::Connected;
        node.platform = Some(handle.clone());
        self.tree.attach_peripheral(&self.transport, key, handle);

        let Some(peripheral) = self.tree.peripheral_proxy(key) else {
            return;
        };
        info!(peripheral = %peripheral.identifier, "peripheral connected");
        self.notify_central(|delegate| delegate.did_connect(peripheral));
        self.continue_after_connect(peripheral);
    }

    fn on_failed_to_connect(&mut self, handle: T::Peripheral, error: TransportError) {
        let Some(key) = self.tree.lookup(handle.identifier()) else {
            return;
        };
        let Some(node) = self.tree.peripheral_mut(key) else {
            return;
        };
        if node.state != ConnectionState::Connecting
            || node.shadow.handle().is_some_and(|live| *live != handle)
        {
            trace!(state = %node.state, "connection failure for a superseded attempt");
            return;
        }
        node.state = ConnectionState::Disconnected;
        self.tree.detach_peripheral(key);
        let Some(peripheral) = self.tree.peripheral_proxy(key) else {
            return;
        };
        let error = GattError::from(error);
        warn!(%error, peripheral = %peripheral.identifier, "connection failed");
        self.notify_central(|delegate| delegate.did_fail_to_connect(peripheral, error));
    }

    fn on_disconnected(&mut self, handle: T::Peripheral, error: Option<TransportError>) {
        let Some(key) = self.tree.lookup(handle.identifier()) else {
            return;
        };
        let Some(node) = self.tree.peripheral_mut(key) else {
            return;
        };
        if node.shadow.handle().is_some_and(|live| *live != handle) {
            trace!("disconnection for a superseded connection");
            return;
        }
        if node.state == ConnectionState::Disconnected {
            trace!("duplicate disconnection event");
            return;
        }
        node.state = ConnectionState::Disconnected;
        self.tree.detach_peripheral(key);

        let Some(peripheral) = self.tree.peripheral_proxy(key) else {
            return;
        };
        let error = error.map(GattError::from);
        info!(peripheral = %peripheral.identifier, ?error, "peripheral disconnected");
        self.notify_central(|delegate| delegate.did_disconnect(peripheral, error));
    }
}
