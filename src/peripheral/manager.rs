use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use tracing::{debug, instrument, trace, warn};

use super::attribute::{AdvertisementRequest, AttResult, MutableCharacteristic, MutableService};
use crate::error::{PeripheralError, TransportError};
use crate::identifier::Identifier;
use crate::transport::{Handle, ManagerState};

/// Capability interface for the local GATT server.
pub trait PeripheralTransport: Send + 'static {
    /// Handle for a remote central connected to the local server.
    type Central: Handle;

    fn state(&self) -> ManagerState;
    fn add_service(&mut self, service: &MutableService);
    fn remove_service(&mut self, service: Identifier);
    fn remove_all_services(&mut self);
    fn start_advertising(&mut self, request: &AdvertisementRequest);
    fn stop_advertising(&mut self);
    /// Completes an ATT request. `value` is the payload of a successful read.
    fn respond(&mut self, request: u64, result: AttResult, value: Option<&[u8]>);
    /// Sends a value update to subscribers. Returns `false` when the send
    /// queue is full.
    fn update_value(
        &mut self,
        characteristic: Identifier,
        value: &[u8],
        centrals: Option<&[Self::Central]>,
    ) -> bool;
    fn maximum_update_length(&self, central: &Self::Central) -> usize;
}

/// Completion and request callbacks delivered by a [`PeripheralTransport`].
pub enum PeripheralEvent<P: PeripheralTransport> {
    StateChanged(ManagerState),
    ServiceAdded {
        service: Identifier,
        error: Option<TransportError>,
    },
    AdvertisingStarted {
        error: Option<TransportError>,
    },
    ReadRequest {
        request: u64,
        central: P::Central,
        characteristic: Identifier,
        offset: usize,
    },
    WriteRequest {
        request: u64,
        central: P::Central,
        characteristic: Identifier,
        offset: usize,
        value: Vec<u8>,
    },
    Subscribed {
        central: P::Central,
        characteristic: Identifier,
    },
    Unsubscribed {
        central: P::Central,
        characteristic: Identifier,
    },
    ReadyToUpdateSubscribers,
}

impl<P: PeripheralTransport> PeripheralEvent<P> {
    /// Short event name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "state_changed",
            Self::ServiceAdded { .. } => "service_added",
            Self::AdvertisingStarted { .. } => "advertising_started",
            Self::ReadRequest { .. } => "read_request",
            Self::WriteRequest { .. } => "write_request",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::ReadyToUpdateSubscribers => "ready_to_update_subscribers",
        }
    }
}

impl<P: PeripheralTransport> fmt::Debug for PeripheralEvent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An incoming read or write that must be answered exactly once with
/// [`PeripheralManagerCore::respond`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AttRequest<C> {
    pub id: u64,
    pub central: C,
    pub characteristic: Identifier,
    pub offset: usize,
    /// Payload of a write; `None` for reads.
    pub value: Option<Vec<u8>>,
}

impl<C> AttRequest<C> {
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.value.is_some()
    }
}

/// Server-role callbacks.
#[allow(unused_variables)]
pub trait PeripheralManagerDelegate<C>: Send {
    fn did_update_state(&mut self, state: ManagerState) {}
    fn did_add_service(&mut self, service: Identifier, result: Result<(), TransportError>) {}
    fn did_start_advertising(&mut self, result: Result<(), TransportError>) {}
    fn did_receive_read(&mut self, request: &AttRequest<C>) {}
    fn did_receive_write(&mut self, request: &AttRequest<C>) {}
    fn did_subscribe(&mut self, central: &C, characteristic: Identifier) {}
    fn did_unsubscribe(&mut self, central: &C, characteristic: Identifier) {}
    /// The transport drained its send queue after an update was refused.
    fn ready_to_update_subscribers(&mut self) {}
}

#[derive(Debug)]
struct QueuedUpdate<C> {
    characteristic: Identifier,
    value: Vec<u8>,
    centrals: Option<Vec<C>>,
}

/// Owns the local attribute table and the server-role transport.
pub struct PeripheralManagerCore<P: PeripheralTransport> {
    transport: P,
    services: Vec<MutableService>,
    advertising: bool,
    pending: BTreeMap<u64, AttRequest<P::Central>>,
    subscribers: HashMap<Identifier, Vec<P::Central>>,
    retry: VecDeque<QueuedUpdate<P::Central>>,
    delegate: Option<Box<dyn PeripheralManagerDelegate<P::Central>>>,
}

impl<P: PeripheralTransport> PeripheralManagerCore<P> {
    #[must_use]
    pub fn new(transport: P) -> Self {
        Self {
            transport,
            services: Vec::new(),
            advertising: false,
            pending: BTreeMap::new(),
            subscribers: HashMap::new(),
            retry: VecDeque::new(),
            delegate: None,
        }
    }

    pub fn transport(&self) -> &P {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut P {
        &mut self.transport
    }

    pub fn state(&self) -> ManagerState {
        self.transport.state()
    }

    pub fn set_delegate(&mut self, delegate: Option<Box<dyn PeripheralManagerDelegate<P::Central>>>) {
        self.delegate = delegate;
    }

    /// Services currently in the local table.
    pub fn services(&self) -> &[MutableService] {
        &self.services
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Publishes `service`. Rejects a duplicate identifier and writable
    /// characteristics that carry a cached value.
    #[instrument(skip_all, level = "debug", fields(service = %service.identifier))]
    pub fn add_service(&mut self, service: MutableService) -> Result<(), PeripheralError> {
        if self.published(service.identifier).is_some() {
            return Err(PeripheralError::ServiceAlreadyPublished {
                identifier: service.identifier,
            });
        }
        for characteristic in &service.characteristics {
            characteristic.validate()?;
        }
        self.transport.add_service(&service);
        self.services.push(service);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn remove_service(&mut self, identifier: Identifier) -> Result<(), PeripheralError> {
        let index = self
            .published(identifier)
            .ok_or(PeripheralError::ServiceNotPublished { identifier })?;
        let service = self.services.remove(index);
        self.transport.remove_service(identifier);
        for characteristic in &service.characteristics {
            self.forget_characteristic(characteristic.identifier);
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn remove_all_services(&mut self) {
        self.services.clear();
        self.subscribers.clear();
        self.retry.clear();
        self.transport.remove_all_services();
    }

    /// Starts advertising. The radio must be powered on.
    #[instrument(skip_all, level = "debug")]
    pub fn start_advertising(&mut self, request: AdvertisementRequest) -> Result<(), PeripheralError> {
        assert_eq!(
            ManagerState::PoweredOn,
            self.transport.state(),
            "advertising requires a powered-on radio"
        );
        if self.advertising {
            return Err(PeripheralError::AlreadyAdvertising);
        }
        self.advertising = true;
        self.transport.start_advertising(&request);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn stop_advertising(&mut self) {
        if self.advertising {
            self.advertising = false;
            self.transport.stop_advertising();
        }
    }

    /// Requests still awaiting [`respond`](Self::respond), oldest first.
    pub fn pending_requests(&self) -> Vec<&AttRequest<P::Central>> {
        self.pending.values().collect()
    }

    /// Answers request `id`. A request can be answered once.
    #[instrument(skip(self, value), level = "debug")]
    pub fn respond(
        &mut self,
        id: u64,
        result: AttResult,
        value: Option<&[u8]>,
    ) -> Result<(), PeripheralError> {
        if self.pending.remove(&id).is_none() {
            return Err(PeripheralError::UnknownRequest { request: id });
        }
        self.transport.respond(id, result, value);
        Ok(())
    }

    /// Centrals subscribed to `characteristic`.
    pub fn subscribers(&self, characteristic: Identifier) -> &[P::Central] {
        self.subscribers
            .get(&characteristic)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn maximum_update_length(&self, central: &P::Central) -> usize {
        self.transport.maximum_update_length(central)
    }

    /// Sends `value` to subscribers of `characteristic`, or only to
    /// `centrals`. Returns whether the transport accepted it now; a refused
    /// update is resent once the transport reports it is ready.
    #[instrument(skip(self, value, centrals), level = "trace")]
    pub fn update_value(
        &mut self,
        characteristic: Identifier,
        value: &[u8],
        centrals: Option<&[P::Central]>,
    ) -> bool {
        let accepted = self.retry.is_empty()
            && self.transport.update_value(characteristic, value, centrals);
        if !accepted {
            trace!(%characteristic, queued = self.retry.len() + 1, "update deferred");
            self.retry.push_back(QueuedUpdate {
                characteristic,
                value: value.to_vec(),
                centrals: centrals.map(<[P::Central]>::to_vec),
            });
        }
        accepted
    }

    #[instrument(skip_all, level = "trace", fields(event = event.name()))]
    pub fn handle_event(&mut self, event: PeripheralEvent<P>) {
        match event {
            PeripheralEvent::StateChanged(state) => self.on_state_changed(state),
            PeripheralEvent::ServiceAdded { service, error } => {
                self.on_service_added(service, error);
            }
            PeripheralEvent::AdvertisingStarted { error } => {
                if error.is_some() {
                    self.advertising = false;
                }
                if let Some(delegate) = self.delegate.as_mut() {
                    delegate.did_start_advertising(error.map_or(Ok(()), Err));
                }
            }
            PeripheralEvent::ReadRequest {
                request,
                central,
                characteristic,
                offset,
            } => self.on_read(AttRequest {
                id: request,
                central,
                characteristic,
                offset,
                value: None,
            }),
            PeripheralEvent::WriteRequest {
                request,
                central,
                characteristic,
                offset,
                value,
            } => self.on_write(AttRequest {
                id: request,
                central,
                characteristic,
                offset,
                value: Some(value),
            }),
            PeripheralEvent::Subscribed {
                central,
                characteristic,
            } => {
                let centrals = self.subscribers.entry(characteristic).or_default();
                if !centrals.contains(&central) {
                    centrals.push(central.clone());
                }
                if let Some(delegate) = self.delegate.as_mut() {
                    delegate.did_subscribe(&central, characteristic);
                }
            }
            PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            } => {
                if let Some(centrals) = self.subscribers.get_mut(&characteristic) {
                    centrals.retain(|known| *known != central);
                    if centrals.is_empty() {
                        self.subscribers.remove(&characteristic);
                    }
                }
                if let Some(delegate) = self.delegate.as_mut() {
                    delegate.did_unsubscribe(&central, characteristic);
                }
            }
            PeripheralEvent::ReadyToUpdateSubscribers => self.on_ready_to_update(),
        }
    }

    fn published(&self, identifier: Identifier) -> Option<usize> {
        self.services
            .iter()
            .position(|service| service.identifier == identifier)
    }

    fn find_characteristic(
        &self,
        identifier: Identifier,
    ) -> Option<&MutableCharacteristic> {
        self.services
            .iter()
            .find_map(|service| service.characteristic(identifier))
    }

    fn forget_characteristic(&mut self, characteristic: Identifier) {
        self.subscribers.remove(&characteristic);
        self.retry
            .retain(|update| update.characteristic != characteristic);
    }

    fn on_state_changed(&mut self, state: ManagerState) {
        if state != ManagerState::PoweredOn {
            debug!(%state, "radio unavailable, dropping server session state");
            self.advertising = false;
            self.pending.clear();
            self.subscribers.clear();
            self.retry.clear();
        }
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.did_update_state(state);
        }
    }

    fn on_service_added(&mut self, service: Identifier, error: Option<TransportError>) {
        if let Some(error) = &error {
            warn!(%service, %error, "transport refused service");
            if let Some(index) = self.published(service) {
                self.services.remove(index);
            }
        }
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.did_add_service(service, error.map_or(Ok(()), Err));
        }
    }

    fn on_read(&mut self, request: AttRequest<P::Central>) {
        let Some(characteristic) = self.find_characteristic(request.characteristic) else {
            self.transport
                .respond(request.id, AttResult::AttributeNotFound, None);
            return;
        };
        if let Some(value) = &characteristic.value {
            let (result, payload) = match value.get(request.offset..) {
                Some(payload) => (AttResult::Success, Some(payload.to_vec())),
                None => (AttResult::InvalidOffset, None),
            };
            self.transport.respond(request.id, result, payload.as_deref());
            return;
        }
        if !characteristic.permissions.allows_read() {
            self.transport
                .respond(request.id, AttResult::ReadNotPermitted, None);
            return;
        }
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.did_receive_read(&request);
        }
        self.pending.insert(request.id, request);
    }

    fn on_write(&mut self, request: AttRequest<P::Central>) {
        let Some(characteristic) = self.find_characteristic(request.characteristic) else {
            self.transport
                .respond(request.id, AttResult::AttributeNotFound, None);
            return;
        };
        if characteristic.value.is_some() || !characteristic.permissions.allows_write() {
            self.transport
                .respond(request.id, AttResult::WriteNotPermitted, None);
            return;
        }
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.did_receive_write(&request);
        }
        self.pending.insert(request.id, request);
    }

    fn on_ready_to_update(&mut self) {
        while let Some(update) = self.retry.front() {
            let sent = self.transport.update_value(
                update.characteristic,
                &update.value,
                update.centrals.as_deref(),
            );
            if !sent {
                trace!(remaining = self.retry.len(), "transport still busy");
                break;
            }
            self.retry.pop_front();
        }
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.ready_to_update_subscribers();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::peripheral::attribute::AttributePermissions;
    use crate::transport::CharacteristicProperties;

    #[derive(Debug, Clone, Eq, PartialEq)]
    struct TestCentral(u16);

    impl Handle for TestCentral {
        fn identifier(&self) -> Identifier {
            Identifier::from_u16(self.0)
        }
    }

    #[derive(Debug, Default)]
    struct Recording {
        added: Vec<Identifier>,
        responses: Vec<(u64, AttResult, Option<Vec<u8>>)>,
        sent: Vec<Vec<u8>>,
        capacity: usize,
        advertising: bool,
    }

    #[derive(Debug, Clone, Default)]
    struct RecordingTransport(Arc<Mutex<Recording>>);

    impl RecordingTransport {
        fn with_capacity(capacity: usize) -> Self {
            let transport = Self::default();
            transport.lock().capacity = capacity;
            transport
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Recording> {
            self.0.lock().expect("recording lock")
        }
    }

    impl PeripheralTransport for RecordingTransport {
        type Central = TestCentral;

        fn state(&self) -> ManagerState {
            ManagerState::PoweredOn
        }

        fn add_service(&mut self, service: &MutableService) {
            self.lock().added.push(service.identifier);
        }

        fn remove_service(&mut self, service: Identifier) {
            self.lock().added.retain(|known| *known != service);
        }

        fn remove_all_services(&mut self) {
            self.lock().added.clear();
        }

        fn start_advertising(&mut self, _request: &AdvertisementRequest) {
            self.lock().advertising = true;
        }

        fn stop_advertising(&mut self) {
            self.lock().advertising = false;
        }

        fn respond(&mut self, request: u64, result: AttResult, value: Option<&[u8]>) {
            self.lock()
                .responses
                .push((request, result, value.map(<[u8]>::to_vec)));
        }

        fn update_value(
            &mut self,
            _characteristic: Identifier,
            value: &[u8],
            _centrals: Option<&[TestCentral]>,
        ) -> bool {
            let mut recording = self.lock();
            if recording.capacity == 0 {
                return false;
            }
            recording.capacity -= 1;
            recording.sent.push(value.to_vec());
            true
        }

        fn maximum_update_length(&self, _central: &TestCentral) -> usize {
            20
        }
    }

    const SERVICE: u16 = 0x1800;
    const NAME: u16 = 0x2a00;
    const CONTROL: u16 = 0x2a06;

    fn service() -> MutableService {
        MutableService::builder()
            .identifier(Identifier::from_u16(SERVICE))
            .characteristics(vec![
                MutableCharacteristic::builder()
                    .identifier(Identifier::from_u16(NAME))
                    .properties(CharacteristicProperties::READ)
                    .permissions(AttributePermissions::READABLE)
                    .value(b"gattlink".to_vec())
                    .build(),
                MutableCharacteristic::builder()
                    .identifier(Identifier::from_u16(CONTROL))
                    .properties(CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY)
                    .permissions(AttributePermissions::WRITEABLE | AttributePermissions::READABLE)
                    .build(),
            ])
            .build()
    }

    fn manager(capacity: usize) -> (PeripheralManagerCore<RecordingTransport>, RecordingTransport) {
        let transport = RecordingTransport::with_capacity(capacity);
        let mut manager = PeripheralManagerCore::new(transport.clone());
        manager.add_service(service()).expect("service should publish");
        (manager, transport)
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let (mut manager, transport) = manager(0);
        assert_matches!(
            manager.add_service(service()),
            Err(PeripheralError::ServiceAlreadyPublished { .. })
        );
        assert_eq!(1, transport.lock().added.len());
    }

    #[test]
    fn static_value_read_is_answered_from_table() {
        let (mut manager, transport) = manager(0);
        manager.handle_event(PeripheralEvent::ReadRequest {
            request: 7,
            central: TestCentral(1),
            characteristic: Identifier::from_u16(NAME),
            offset: 4,
        });

        assert!(manager.pending_requests().is_empty());
        assert_eq!(
            vec![(7, AttResult::Success, Some(b"link".to_vec()))],
            transport.lock().responses
        );
    }

    #[test]
    fn dynamic_write_waits_for_exactly_one_response() {
        let (mut manager, transport) = manager(0);
        manager.handle_event(PeripheralEvent::WriteRequest {
            request: 9,
            central: TestCentral(1),
            characteristic: Identifier::from_u16(CONTROL),
            offset: 0,
            value: vec![0x01],
        });
        assert_eq!(1, manager.pending_requests().len());
        assert!(manager.pending_requests()[0].is_write());

        manager
            .respond(9, AttResult::Success, None)
            .expect("first response");
        assert_matches!(
            manager.respond(9, AttResult::Success, None),
            Err(PeripheralError::UnknownRequest { request: 9 })
        );
        assert_eq!(1, transport.lock().responses.len());
    }

    #[test]
    fn write_to_static_value_is_refused() {
        let (mut manager, transport) = manager(0);
        manager.handle_event(PeripheralEvent::WriteRequest {
            request: 3,
            central: TestCentral(1),
            characteristic: Identifier::from_u16(NAME),
            offset: 0,
            value: vec![0x00],
        });
        assert_eq!(
            vec![(3, AttResult::WriteNotPermitted, None)],
            transport.lock().responses
        );
    }

    #[test]
    fn refused_updates_are_retried_in_order() {
        let (mut manager, transport) = manager(1);
        let control = Identifier::from_u16(CONTROL);

        assert!(manager.update_value(control, &[1], None));
        assert!(!manager.update_value(control, &[2], None));
        assert!(!manager.update_value(control, &[3], None));

        transport.lock().capacity = 1;
        manager.handle_event(PeripheralEvent::ReadyToUpdateSubscribers);
        assert_eq!(vec![vec![1], vec![2]], transport.lock().sent);

        transport.lock().capacity = 5;
        manager.handle_event(PeripheralEvent::ReadyToUpdateSubscribers);
        assert_eq!(vec![vec![1], vec![2], vec![3]], transport.lock().sent);
    }

    #[test]
    fn subscriptions_are_tracked_per_characteristic() {
        let (mut manager, _transport) = manager(0);
        let control = Identifier::from_u16(CONTROL);
        for central in [TestCentral(1), TestCentral(2), TestCentral(1)] {
            manager.handle_event(PeripheralEvent::Subscribed {
                central,
                characteristic: control,
            });
        }
        assert_eq!(&[TestCentral(1), TestCentral(2)], manager.subscribers(control));

        manager.handle_event(PeripheralEvent::Unsubscribed {
            central: TestCentral(1),
            characteristic: control,
        });
        assert_eq!(&[TestCentral(2)], manager.subscribers(control));

        manager
            .remove_service(Identifier::from_u16(SERVICE))
            .expect("service should be removed");
        assert!(manager.subscribers(control).is_empty());
    }

    #[test]
    fn advertising_twice_is_rejected() {
        let (mut manager, transport) = manager(0);
        manager
            .start_advertising(AdvertisementRequest::builder().local_name("gattlink").build())
            .expect("first start");
        assert_matches!(
            manager.start_advertising(AdvertisementRequest::default()),
            Err(PeripheralError::AlreadyAdvertising)
        );
        manager.stop_advertising();
        assert!(!transport.lock().advertising);
    }
}
