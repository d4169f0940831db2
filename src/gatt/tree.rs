use std::collections::HashMap;

use tracing::trace;

use super::children::{ChildTable, reconcile};
use super::proxy::{
    Characteristic, CharacteristicKey, Descriptor, DescriptorKey, KeyAllocator, Peripheral,
    PeripheralKey, Service, ServiceKey,
};
use super::shadow::Shadow;
use crate::advertisement::Advertisement;
use crate::central::delegate::PeripheralDelegate;
use crate::central::discovery::{DiscoveryPolicy, DiscoveryState};
use crate::identifier::Identifier;
use crate::transport::{
    CharacteristicProperties, ConnectOptions, ConnectionState, Handle, Transport,
};

pub(crate) struct PeripheralNode<T: Transport> {
    pub(crate) identifier: Identifier,
    /// Latest handle vended by scanning or retrieval; used to connect.
    pub(crate) platform: Option<T::Peripheral>,
    /// Live handle, attached only while connected.
    pub(crate) shadow: Shadow<T::Peripheral>,
    pub(crate) state: ConnectionState,
    pub(crate) name: Option<String>,
    pub(crate) advertisement: Advertisement,
    pub(crate) rssi: Option<i16>,
    pub(crate) connect_options: ConnectOptions,
    pub(crate) services: ChildTable<ServiceKey>,
    pub(crate) discovery: DiscoveryState,
    pub(crate) policy: Option<DiscoveryPolicy>,
    pub(crate) delegate: Option<Box<dyn PeripheralDelegate>>,
}

pub(crate) struct ServiceNode<T: Transport> {
    pub(crate) identifier: Identifier,
    pub(crate) peripheral: PeripheralKey,
    pub(crate) including: Option<ServiceKey>,
    pub(crate) primary: bool,
    pub(crate) shadow: Shadow<T::Service>,
    pub(crate) characteristics: ChildTable<CharacteristicKey>,
    pub(crate) included: ChildTable<ServiceKey>,
    pub(crate) characteristic_discovery: DiscoveryState,
    pub(crate) included_discovery: DiscoveryState,
    pub(crate) policy: Option<DiscoveryPolicy>,
}

pub(crate) struct CharacteristicNode<T: Transport> {
    pub(crate) identifier: Identifier,
    pub(crate) service: ServiceKey,
    pub(crate) peripheral: PeripheralKey,
    pub(crate) shadow: Shadow<T::Characteristic>,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) notifying: bool,
    pub(crate) descriptors: ChildTable<DescriptorKey>,
    pub(crate) descriptor_discovery: DiscoveryState,
    pub(crate) policy: Option<DiscoveryPolicy>,
}

pub(crate) struct DescriptorNode<T: Transport> {
    pub(crate) identifier: Identifier,
    pub(crate) characteristic: CharacteristicKey,
    pub(crate) peripheral: PeripheralKey,
    pub(crate) shadow: Shadow<T::Descriptor>,
    pub(crate) value: Option<Vec<u8>>,
}

pub(crate) struct GattTree<T: Transport> {
    keys: KeyAllocator,
    order: Vec<PeripheralKey>,
    by_identifier: HashMap<Identifier, PeripheralKey>,
    peripherals: HashMap<PeripheralKey, PeripheralNode<T>>,
    services: HashMap<ServiceKey, ServiceNode<T>>,
    characteristics: HashMap<CharacteristicKey, CharacteristicNode<T>>,
    descriptors: HashMap<DescriptorKey, DescriptorNode<T>>,
}

impl<T: Transport> Default for GattTree<T> {
    fn default() -> Self {
        Self {
            keys: KeyAllocator::default(),
            order: Vec::new(),
            by_identifier: HashMap::new(),
            peripherals: HashMap::new(),
            services: HashMap::new(),
            characteristics: HashMap::new(),
            descriptors: HashMap::new(),
        }
    }
}

impl<T: Transport> GattTree<T> {
    /// Creates a disconnected peripheral record.
    pub(crate) fn insert_peripheral(
        &mut self,
        identifier: Identifier,
        platform: Option<T::Peripheral>,
    ) -> PeripheralKey {
        let key = self.keys.peripheral();
        self.peripherals.insert(
            key,
            PeripheralNode {
                identifier,
                platform,
                shadow: Shadow::default(),
                state: ConnectionState::Disconnected,
                name: None,
                advertisement: Advertisement::default(),
                rssi: None,
                connect_options: ConnectOptions::default(),
                services: ChildTable::default(),
                discovery: DiscoveryState::NotDiscovered,
                policy: None,
                delegate: None,
            },
        );
        self.by_identifier.insert(identifier, key);
        self.order.push(key);
        key
    }

    pub(crate) fn insert_service(
        &mut self,
        peripheral: PeripheralKey,
        including: Option<ServiceKey>,
        identifier: Identifier,
        primary: bool,
        shadow: Shadow<T::Service>,
    ) -> ServiceKey {
        let key = self.keys.service();
        let table = match including {
            Some(parent) => self.services.get_mut(&parent).map(|node| &mut node.included),
            None => self
                .peripherals
                .get_mut(&peripheral)
                .map(|node| &mut node.services),
        };
        if let Some(table) = table {
            table.push(identifier, key);
        }
        self.services.insert(
            key,
            ServiceNode {
                identifier,
                peripheral,
                including,
                primary,
                shadow,
                characteristics: ChildTable::default(),
                included: ChildTable::default(),
                characteristic_discovery: DiscoveryState::NotDiscovered,
                included_discovery: DiscoveryState::NotDiscovered,
                policy: None,
            },
        );
        key
    }

    pub(crate) fn insert_characteristic(
        &mut self,
        service: ServiceKey,
        identifier: Identifier,
        properties: CharacteristicProperties,
        shadow: Shadow<T::Characteristic>,
    ) -> Option<CharacteristicKey> {
        let key = self.keys.characteristic();
        let parent = self.services.get_mut(&service)?;
        parent.characteristics.push(identifier, key);
        let peripheral = parent.peripheral;
        self.characteristics.insert(
            key,
            CharacteristicNode {
                identifier,
                service,
                peripheral,
                shadow,
                properties,
                value: None,
                notifying: false,
                descriptors: ChildTable::default(),
                descriptor_discovery: DiscoveryState::NotDiscovered,
                policy: None,
            },
        );
        Some(key)
    }

    pub(crate) fn insert_descriptor(
        &mut self,
        characteristic: CharacteristicKey,
        identifier: Identifier,
        shadow: Shadow<T::Descriptor>,
    ) -> Option<DescriptorKey> {
        let key = self.keys.descriptor();
        let parent = self.characteristics.get_mut(&characteristic)?;
        parent.descriptors.push(identifier, key);
        let peripheral = parent.peripheral;
        self.descriptors.insert(
            key,
            DescriptorNode {
                identifier,
                characteristic,
                peripheral,
                shadow,
                value: None,
            },
        );
        Some(key)
    }

    pub(crate) fn lookup(&self, identifier: Identifier) -> Option<PeripheralKey> {
        self.by_identifier.get(&identifier).copied()
    }

    pub(crate) fn peripheral_keys(&self) -> &[PeripheralKey] {
        &self.order
    }

    pub(crate) fn peripheral(&self, key: PeripheralKey) -> Option<&PeripheralNode<T>> {
        self.peripherals.get(&key)
    }

    pub(crate) fn peripheral_mut(&mut self, key: PeripheralKey) -> Option<&mut PeripheralNode<T>> {
        self.peripherals.get_mut(&key)
    }

    pub(crate) fn service(&self, key: ServiceKey) -> Option<&ServiceNode<T>> {
        self.services.get(&key)
    }

    pub(crate) fn service_mut(&mut self, key: ServiceKey) -> Option<&mut ServiceNode<T>> {
        self.services.get_mut(&key)
    }

    pub(crate) fn characteristic(&self, key: CharacteristicKey) -> Option<&CharacteristicNode<T>> {
        self.characteristics.get(&key)
    }

    pub(crate) fn characteristic_mut(
        &mut self,
        key: CharacteristicKey,
    ) -> Option<&mut CharacteristicNode<T>> {
        self.characteristics.get_mut(&key)
    }

    pub(crate) fn descriptor(&self, key: DescriptorKey) -> Option<&DescriptorNode<T>> {
        self.descriptors.get(&key)
    }

    pub(crate) fn descriptor_mut(&mut self, key: DescriptorKey) -> Option<&mut DescriptorNode<T>> {
        self.descriptors.get_mut(&key)
    }

    pub(crate) fn peripheral_proxy(&self, key: PeripheralKey) -> Option<Peripheral> {
        self.peripherals.get(&key).map(|node| Peripheral {
            key,
            identifier: node.identifier,
        })
    }

    pub(crate) fn service_proxy(&self, key: ServiceKey) -> Option<Service> {
        self.services.get(&key).map(|node| Service {
            key,
            peripheral: node.peripheral,
            identifier: node.identifier,
        })
    }

    pub(crate) fn characteristic_proxy(&self, key: CharacteristicKey) -> Option<Characteristic> {
        self.characteristics.get(&key).map(|node| Characteristic {
            key,
            service: node.service,
            peripheral: node.peripheral,
            identifier: node.identifier,
        })
    }

    pub(crate) fn descriptor_proxy(&self, key: DescriptorKey) -> Option<Descriptor> {
        self.descriptors.get(&key).map(|node| Descriptor {
            key,
            characteristic: node.characteristic,
            peripheral: node.peripheral,
            identifier: node.identifier,
        })
    }

    /// Live peripheral handle, present only while connected.
    pub(crate) fn live_peripheral(&self, key: PeripheralKey) -> Option<T::Peripheral> {
        self.peripherals
            .get(&key)
            .and_then(|node| node.shadow.handle().cloned())
    }

    /// Finds the peripheral record whose live handle is `handle`.
    pub(crate) fn find_live_peripheral(&self, handle: &T::Peripheral) -> Option<PeripheralKey> {
        let key = self.lookup(handle.identifier())?;
        let node = self.peripherals.get(&key)?;
        (node.shadow.handle() == Some(handle)).then_some(key)
    }

    pub(crate) fn find_service(&self, peripheral: PeripheralKey, handle: &T::Service) -> Option<ServiceKey> {
        self.services
            .iter()
            .find(|(_, node)| node.peripheral == peripheral && node.shadow.handle() == Some(handle))
            .map(|(key, _)| *key)
    }

    pub(crate) fn find_characteristic(
        &self,
        peripheral: PeripheralKey,
        handle: &T::Characteristic,
    ) -> Option<CharacteristicKey> {
        self.characteristics
            .iter()
            .find(|(_, node)| node.peripheral == peripheral && node.shadow.handle() == Some(handle))
            .map(|(key, _)| *key)
    }

    pub(crate) fn find_descriptor(
        &self,
        peripheral: PeripheralKey,
        handle: &T::Descriptor,
    ) -> Option<DescriptorKey> {
        self.descriptors
            .iter()
            .find(|(_, node)| node.peripheral == peripheral && node.shadow.handle() == Some(handle))
            .map(|(key, _)| *key)
    }

    /// Attaches `handle` to a peripheral and reattaches every known descendant
    /// the transport still vends beneath it.
    pub(crate) fn attach_peripheral(
        &mut self,
        transport: &T,
        key: PeripheralKey,
        handle: T::Peripheral,
    ) {
        let Some(node) = self.peripherals.get_mut(&key) else {
            return;
        };
        node.shadow.attach(handle.clone());
        let live = transport.services(&handle);
        self.sync_services(transport, key, None, &live, false);
    }

    /// Matches the transport's current service list against known services.
    ///
    /// Known services are reattached and vanished ones detached. Unknown ones
    /// are created only when `create` is set; otherwise a vanished child marks
    /// the container as not discovered. Returns the resulting children in
    /// transport order.
    pub(crate) fn sync_services(
        &mut self,
        transport: &T,
        peripheral: PeripheralKey,
        including: Option<ServiceKey>,
        live: &[T::Service],
        create: bool,
    ) -> Vec<ServiceKey> {
        let known = match including {
            Some(parent) => self.services.get(&parent).map(|node| node.included.clone()),
            None => self
                .peripherals
                .get(&peripheral)
                .map(|node| node.services.clone()),
        };
        let Some(known) = known else {
            return Vec::new();
        };
        let outcome = reconcile(&known, live);
        trace!(
            fresh = outcome.fresh.len(),
            missing = outcome.missing.len(),
            "reconciled services"
        );
        if !create && !outcome.missing.is_empty() {
            match including {
                Some(parent) => {
                    if let Some(node) = self.services.get_mut(&parent) {
                        node.included_discovery.invalidate();
                    }
                }
                None => {
                    if let Some(node) = self.peripherals.get_mut(&peripheral) {
                        node.discovery.invalidate();
                    }
                }
            }
        }
        for key in outcome.missing {
            self.detach_service(key);
        }
        for (key, handle) in outcome.matched {
            self.attach_service(transport, key, handle);
        }

        let mut children = Vec::with_capacity(live.len());
        for (slot, handle) in outcome.order.into_iter().zip(live) {
            match slot {
                Some(key) => children.push(key),
                None if create => {
                    let key = self.insert_service(
                        peripheral,
                        including,
                        handle.identifier(),
                        transport.is_primary(handle),
                        Shadow::attached(handle.clone()),
                    );
                    trace!(%key, identifier = %handle.identifier(), "created service record");
                    children.push(key);
                }
                None => {}
            }
        }
        children
    }

    fn attach_service(&mut self, transport: &T, key: ServiceKey, handle: T::Service) {
        let Some(node) = self.services.get_mut(&key) else {
            return;
        };
        node.shadow.attach(handle.clone());
        let peripheral = node.peripheral;
        let characteristics = transport.characteristics(&handle);
        self.sync_characteristics(transport, key, &characteristics, false);
        let included = transport.included_services(&handle);
        self.sync_services(transport, peripheral, Some(key), &included, false);
    }

    pub(crate) fn sync_characteristics(
        &mut self,
        transport: &T,
        service: ServiceKey,
        live: &[T::Characteristic],
        create: bool,
    ) -> Vec<CharacteristicKey> {
        let Some(known) = self
            .services
            .get(&service)
            .map(|node| node.characteristics.clone())
        else {
            return Vec::new();
        };
        let outcome = reconcile(&known, live);
        trace!(
            fresh = outcome.fresh.len(),
            missing = outcome.missing.len(),
            "reconciled characteristics"
        );
        if !create
            && !outcome.missing.is_empty()
            && let Some(node) = self.services.get_mut(&service)
        {
            node.characteristic_discovery.invalidate();
        }
        for key in outcome.missing {
            self.detach_characteristic(key);
        }
        for (key, handle) in outcome.matched {
            self.attach_characteristic(transport, key, handle);
        }

        let mut children = Vec::with_capacity(live.len());
        for (slot, handle) in outcome.order.into_iter().zip(live) {
            match slot {
                Some(key) => children.push(key),
                None if create => {
                    let properties = transport.characteristic_properties(handle);
                    if let Some(key) = self.insert_characteristic(
                        service,
                        handle.identifier(),
                        properties,
                        Shadow::attached(handle.clone()),
                    ) {
                        children.push(key);
                    }
                }
                None => {}
            }
        }
        children
    }

    fn attach_characteristic(
        &mut self,
        transport: &T,
        key: CharacteristicKey,
        handle: T::Characteristic,
    ) {
        let Some(node) = self.characteristics.get_mut(&key) else {
            return;
        };
        node.properties = transport.characteristic_properties(&handle);
        node.shadow.attach(handle.clone());
        let descriptors = transport.descriptors(&handle);
        self.sync_descriptors(key, &descriptors, false);
    }

    pub(crate) fn sync_descriptors(
        &mut self,
        characteristic: CharacteristicKey,
        live: &[T::Descriptor],
        create: bool,
    ) -> Vec<DescriptorKey> {
        let Some(known) = self
            .characteristics
            .get(&characteristic)
            .map(|node| node.descriptors.clone())
        else {
            return Vec::new();
        };
        let outcome = reconcile(&known, live);
        trace!(
            fresh = outcome.fresh.len(),
            missing = outcome.missing.len(),
            "reconciled descriptors"
        );
        if !create
            && !outcome.missing.is_empty()
            && let Some(node) = self.characteristics.get_mut(&characteristic)
        {
            node.descriptor_discovery.invalidate();
        }
        for key in outcome.missing {
            if let Some(node) = self.descriptors.get_mut(&key) {
                node.shadow.detach();
            }
        }
        for (key, handle) in outcome.matched {
            if let Some(node) = self.descriptors.get_mut(&key) {
                node.shadow.attach(handle);
            }
        }

        let mut children = Vec::with_capacity(live.len());
        for (slot, handle) in outcome.order.into_iter().zip(live) {
            match slot {
                Some(key) => children.push(key),
                None if create => {
                    if let Some(key) = self.insert_descriptor(
                        characteristic,
                        handle.identifier(),
                        Shadow::attached(handle.clone()),
                    ) {
                        children.push(key);
                    }
                }
                None => {}
            }
        }
        children
    }

    /// Clears the live handle of a peripheral and every descendant.
    ///
    /// Any discovery still in flight below the peripheral is abandoned.
    pub(crate) fn detach_peripheral(&mut self, key: PeripheralKey) {
        let Some(node) = self.peripherals.get_mut(&key) else {
            return;
        };
        node.shadow.detach();
        node.discovery.abandon();
        let services: Vec<_> = node.services.keys().collect();
        for service in services {
            self.detach_service(service);
        }
    }

    pub(crate) fn detach_service(&mut self, key: ServiceKey) {
        let Some(node) = self.services.get_mut(&key) else {
            return;
        };
        node.shadow.detach();
        node.characteristic_discovery.abandon();
        node.included_discovery.abandon();
        let characteristics: Vec<_> = node.characteristics.keys().collect();
        let included: Vec<_> = node.included.keys().collect();
        for characteristic in characteristics {
            self.detach_characteristic(characteristic);
        }
        for service in included {
            self.detach_service(service);
        }
    }

    fn detach_characteristic(&mut self, key: CharacteristicKey) {
        let Some(node) = self.characteristics.get_mut(&key) else {
            return;
        };
        node.shadow.detach();
        node.notifying = false;
        node.descriptor_discovery.abandon();
        let descriptors: Vec<_> = node.descriptors.keys().collect();
        for descriptor in descriptors {
            if let Some(node) = self.descriptors.get_mut(&descriptor) {
                node.shadow.detach();
            }
        }
    }

    /// Drops a peripheral record and its whole subtree.
    pub(crate) fn remove_peripheral(&mut self, key: PeripheralKey) -> Option<PeripheralNode<T>> {
        let node = self.peripherals.remove(&key)?;
        self.by_identifier.remove(&node.identifier);
        self.order.retain(|candidate| *candidate != key);
        let services: Vec<ServiceKey> = self
            .services
            .iter()
            .filter(|(_, service)| service.peripheral == key)
            .map(|(key, _)| *key)
            .collect();
        for service in services {
            self.services.remove(&service);
        }
        self.characteristics.retain(|_, node| node.peripheral != key);
        self.descriptors.retain(|_, node| node.peripheral != key);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fake::{FakeCharacteristic, FakeDevice, FakeService, FakeTransport};

    const BATTERY: u16 = 0x180f;
    const LEVEL: u16 = 0x2a19;

    fn transport() -> (FakeTransport, Identifier) {
        let device = Identifier::from_u16(0xfee0);
        let fake = FakeTransport::new();
        fake.add_device(
            FakeDevice::builder()
                .identifier(device)
                .services(vec![
                    FakeService::new(Identifier::from_u16(BATTERY)).characteristic(
                        FakeCharacteristic::new(
                            Identifier::from_u16(LEVEL),
                            CharacteristicProperties::READ,
                        ),
                    ),
                ])
                .build(),
        );
        (fake, device)
    }

    #[test]
    fn detach_then_attach_keeps_records() {
        let (fake, device) = transport();
        let mut tree = GattTree::<FakeTransport>::default();
        let key = tree.insert_peripheral(device, None);

        let first = fake.simulate_connection(device);
        fake.mark_all_discovered(device);
        tree.attach_peripheral(&fake, key, first.clone());
        let services = tree.sync_services(&fake, key, None, &fake.services(&first), true);
        let characteristics = {
            let handle = tree.service(services[0]).and_then(|node| node.shadow.handle().cloned());
            let live = handle.map(|handle| fake.characteristics(&handle)).unwrap_or_default();
            tree.sync_characteristics(&fake, services[0], &live, true)
        };

        tree.detach_peripheral(key);
        assert!(!tree.service(services[0]).is_some_and(|node| node.shadow.is_attached()));

        let second = fake.simulate_connection(device);
        tree.attach_peripheral(&fake, key, second);

        let service = tree.service(services[0]).map(|node| node.shadow.is_attached());
        let characteristic = tree
            .characteristic(characteristics[0])
            .map(|node| node.shadow.is_attached());
        assert_eq!(Some(true), service);
        assert_eq!(Some(true), characteristic);
        assert_eq!(1, tree.peripheral(key).map_or(0, |node| node.services.keys().count()));
    }

    #[test]
    fn remove_peripheral_drops_subtree() {
        let (fake, device) = transport();
        let mut tree = GattTree::<FakeTransport>::default();
        let key = tree.insert_peripheral(device, None);
        let handle = fake.simulate_connection(device);
        fake.mark_all_discovered(device);
        tree.attach_peripheral(&fake, key, handle.clone());
        let services = tree.sync_services(&fake, key, None, &fake.services(&handle), true);

        assert!(tree.remove_peripheral(key).is_some());
        assert!(tree.service(services[0]).is_none());
        assert_eq!(None, tree.lookup(device));
        assert!(tree.peripheral_keys().is_empty());
    }
}
