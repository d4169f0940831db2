use serde::Serialize;

use super::proxy::{
    Characteristic, CharacteristicKey, Descriptor, DescriptorKey, Peripheral, PeripheralKey,
    Service, ServiceKey,
};
use super::tree::GattTree;
use crate::advertisement::Advertisement;
use crate::central::discovery::DiscoveryState;
use crate::identifier::Identifier;
use crate::transport::{CharacteristicProperties, ConnectionState, Transport};

/// Snapshot of one peripheral record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralInfo {
    #[serde(skip)]
    pub peripheral: Peripheral,
    pub identifier: Identifier,
    pub name: Option<String>,
    pub state: ConnectionState,
    pub rssi: Option<i16>,
    pub advertisement: Advertisement,
    pub attached: bool,
    pub discovery: DiscoveryState,
    #[serde(skip)]
    pub services: Vec<Service>,
}

/// Snapshot of one service record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    #[serde(skip)]
    pub service: Service,
    pub identifier: Identifier,
    pub primary: bool,
    pub attached: bool,
    pub characteristic_discovery: DiscoveryState,
    pub included_discovery: DiscoveryState,
    #[serde(skip)]
    pub characteristics: Vec<Characteristic>,
    #[serde(skip)]
    pub included_services: Vec<Service>,
}

/// Snapshot of one characteristic record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    #[serde(skip)]
    pub characteristic: Characteristic,
    pub identifier: Identifier,
    pub properties: CharacteristicProperties,
    pub value: Option<Vec<u8>>,
    pub notifying: bool,
    pub attached: bool,
    pub descriptor_discovery: DiscoveryState,
    #[serde(skip)]
    pub descriptors: Vec<Descriptor>,
}

/// Snapshot of one descriptor record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DescriptorInfo {
    #[serde(skip)]
    pub descriptor: Descriptor,
    pub identifier: Identifier,
    pub value: Option<Vec<u8>>,
    pub attached: bool,
}

impl<T: Transport> GattTree<T> {
    pub(crate) fn peripheral_info(&self, key: PeripheralKey) -> Option<PeripheralInfo> {
        let node = self.peripheral(key)?;
        Some(PeripheralInfo {
            peripheral: self.peripheral_proxy(key)?,
            identifier: node.identifier,
            name: node.name.clone(),
            state: node.state,
            rssi: node.rssi,
            advertisement: node.advertisement.clone(),
            attached: node.shadow.is_attached(),
            discovery: node.discovery.clone(),
            services: node
                .services
                .keys()
                .filter_map(|key| self.service_proxy(key))
                .collect(),
        })
    }

    pub(crate) fn service_info(&self, key: ServiceKey) -> Option<ServiceInfo> {
        let node = self.service(key)?;
        Some(ServiceInfo {
            service: self.service_proxy(key)?,
            identifier: node.identifier,
            primary: node.primary,
            attached: node.shadow.is_attached(),
            characteristic_discovery: node.characteristic_discovery.clone(),
            included_discovery: node.included_discovery.clone(),
            characteristics: node
                .characteristics
                .keys()
                .filter_map(|key| self.characteristic_proxy(key))
                .collect(),
            included_services: node
                .included
                .keys()
                .filter_map(|key| self.service_proxy(key))
                .collect(),
        })
    }

    pub(crate) fn characteristic_info(&self, key: CharacteristicKey) -> Option<CharacteristicInfo> {
        let node = self.characteristic(key)?;
        Some(CharacteristicInfo {
            characteristic: self.characteristic_proxy(key)?,
            identifier: node.identifier,
            properties: node.properties,
            value: node.value.clone(),
            notifying: node.notifying,
            attached: node.shadow.is_attached(),
            descriptor_discovery: node.descriptor_discovery.clone(),
            descriptors: node
                .descriptors
                .keys()
                .filter_map(|key| self.descriptor_proxy(key))
                .collect(),
        })
    }

    pub(crate) fn descriptor_info(&self, key: DescriptorKey) -> Option<DescriptorInfo> {
        let node = self.descriptor(key)?;
        Some(DescriptorInfo {
            descriptor: self.descriptor_proxy(key)?,
            identifier: node.identifier,
            value: node.value.clone(),
            attached: node.shadow.is_attached(),
        })
    }
}
