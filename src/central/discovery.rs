use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::SerializeDisplay;
use tracing::{debug, instrument, trace, warn};

use super::engine::CentralManagerCore;
use super::request::{Request, ResponderLink};
use crate::error::{GattError, TransportError};
use crate::gatt::{
    Characteristic, CharacteristicKey, Peripheral, PeripheralKey, Service, ServiceKey,
};
use crate::identifier::Identifier;
use crate::transport::{CharacteristicProperties, Transport};

/// Discovery progress of one container's children.
#[derive(Debug, Clone, Eq, PartialEq, Default, derive_more::Display, SerializeDisplay)]
pub enum DiscoveryState {
    #[default]
    #[display("not_discovered")]
    NotDiscovered,
    #[display("discovering")]
    Discovering,
    #[display("discovered")]
    Discovered,
    /// Discovery completed with an error. It is not retried automatically.
    #[display("failed: {_0}")]
    Failed(GattError),
}

impl DiscoveryState {
    #[must_use]
    pub fn is_discovering(&self) -> bool {
        matches!(self, Self::Discovering)
    }

    /// Returns whether a completion has been recorded, successful or not.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Discovered | Self::Failed(_))
    }

    /// Drops an in-flight discovery whose completion can no longer arrive.
    pub(crate) fn abandon(&mut self) {
        if self.is_discovering() {
            *self = Self::NotDiscovered;
        }
    }

    /// Forgets a completed discovery whose children the live handle no longer
    /// vends, so the policy runs it again.
    pub(crate) fn invalidate(&mut self) {
        if self.is_settled() {
            *self = Self::NotDiscovered;
        }
    }

    fn settle(&mut self, error: Option<GattError>) {
        *self = match error {
            Some(error) => Self::Failed(error),
            None => Self::Discovered,
        };
    }
}

/// Which discovery steps run automatically.
///
/// Policies are resolved from the most specific record outwards:
/// characteristic, service, peripheral, then the manager default.
#[derive(Debug, Clone, Eq, PartialEq, Default, Builder, Serialize, Deserialize)]
pub struct DiscoveryPolicy {
    /// Discover services as soon as a connection completes.
    #[builder(default)]
    #[serde(default)]
    pub services_on_connect: bool,
    /// Services to discover; `None` discovers all of them.
    #[serde(default)]
    pub service_filter: Option<Vec<Identifier>>,
    /// Discover characteristics of each newly discovered service.
    #[builder(default)]
    #[serde(default)]
    pub characteristics: bool,
    #[serde(default)]
    pub characteristic_filter: Option<Vec<Identifier>>,
    #[builder(default)]
    #[serde(default)]
    pub included_services: bool,
    /// Discover descriptors of each newly discovered characteristic.
    #[builder(default)]
    #[serde(default)]
    pub descriptors: bool,
    /// Enable notifications on characteristics that support them.
    #[builder(default)]
    #[serde(default)]
    pub subscribe: bool,
    /// Read every readable characteristic once discovered.
    #[builder(default)]
    #[serde(default)]
    pub read_values: bool,
}

impl DiscoveryPolicy {
    /// Nothing happens unless the application asks for it.
    #[must_use]
    pub fn manual() -> Self {
        Self::default()
    }

    /// Walks the whole tree on connect.
    #[must_use]
    pub fn full() -> Self {
        Self {
            services_on_connect: true,
            service_filter: None,
            characteristics: true,
            characteristic_filter: None,
            included_services: true,
            descriptors: true,
            subscribe: false,
            read_values: false,
        }
    }
}

fn is_empty_filter(filter: Option<&Vec<Identifier>>) -> bool {
    filter.is_some_and(Vec::is_empty)
}

impl<T: Transport> CentralManagerCore<T> {
    /// Overrides the discovery policy for one peripheral. `None` falls back
    /// to the manager default.
    pub fn set_peripheral_policy(
        &mut self,
        peripheral: Peripheral,
        policy: Option<DiscoveryPolicy>,
    ) -> Result<(), GattError> {
        let node = self
            .tree
            .peripheral_mut(peripheral.key)
            .ok_or(GattError::UnknownEntity)?;
        node.policy = policy;
        Ok(())
    }

    pub fn set_service_policy(
        &mut self,
        service: Service,
        policy: Option<DiscoveryPolicy>,
    ) -> Result<(), GattError> {
        let node = self
            .tree
            .service_mut(service.key)
            .ok_or(GattError::UnknownEntity)?;
        node.policy = policy;
        Ok(())
    }

    pub fn set_characteristic_policy(
        &mut self,
        characteristic: Characteristic,
        policy: Option<DiscoveryPolicy>,
    ) -> Result<(), GattError> {
        let node = self
            .tree
            .characteristic_mut(characteristic.key)
            .ok_or(GattError::UnknownEntity)?;
        node.policy = policy;
        Ok(())
    }

    pub(crate) fn policy_for_peripheral(&self, key: PeripheralKey) -> DiscoveryPolicy {
        self.tree
            .peripheral(key)
            .and_then(|node| node.policy.clone())
            .unwrap_or_else(|| self.default_policy.clone())
    }

    pub(crate) fn policy_for_service(&self, key: ServiceKey) -> DiscoveryPolicy {
        let Some(node) = self.tree.service(key) else {
            return self.default_policy.clone();
        };
        if let Some(policy) = &node.policy {
            return policy.clone();
        }
        match node.including {
            Some(parent) => self.policy_for_service(parent),
            None => self.policy_for_peripheral(node.peripheral),
        }
    }

    pub(crate) fn policy_for_characteristic(&self, key: CharacteristicKey) -> DiscoveryPolicy {
        let Some(node) = self.tree.characteristic(key) else {
            return self.default_policy.clone();
        };
        node.policy
            .clone()
            .unwrap_or_else(|| self.policy_for_service(node.service))
    }

    /// Starts service discovery. An explicitly empty filter does nothing.
    #[instrument(skip(self), level = "debug", fields(peripheral = %peripheral.identifier))]
    pub fn discover_services(
        &mut self,
        peripheral: Peripheral,
        filter: Option<Vec<Identifier>>,
    ) -> Result<(), GattError> {
        if is_empty_filter(filter.as_ref()) {
            trace!("empty service filter, nothing to discover");
            return Ok(());
        }
        let node = self
            .tree
            .peripheral(peripheral.key)
            .ok_or(GattError::UnknownEntity)?;
        if !node.shadow.is_attached() {
            return Err(GattError::Unreachable {
                identifier: peripheral.identifier,
            });
        }
        self.dispatch(
            Request::DiscoverServices { filter },
            ResponderLink::Peripheral(peripheral.key),
        )?;
        if let Some(node) = self.tree.peripheral_mut(peripheral.key) {
            node.discovery = DiscoveryState::Discovering;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(service = %service.identifier))]
    pub fn discover_included_services(
        &mut self,
        service: Service,
        filter: Option<Vec<Identifier>>,
    ) -> Result<(), GattError> {
        if is_empty_filter(filter.as_ref()) {
            trace!("empty included service filter, nothing to discover");
            return Ok(());
        }
        let handle = self.live_service(service)?;
        self.dispatch(
            Request::DiscoverIncludedServices {
                service: handle,
                filter,
            },
            ResponderLink::Service(service.key),
        )?;
        if let Some(node) = self.tree.service_mut(service.key) {
            node.included_discovery = DiscoveryState::Discovering;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(service = %service.identifier))]
    pub fn discover_characteristics(
        &mut self,
        service: Service,
        filter: Option<Vec<Identifier>>,
    ) -> Result<(), GattError> {
        if is_empty_filter(filter.as_ref()) {
            trace!("empty characteristic filter, nothing to discover");
            return Ok(());
        }
        let handle = self.live_service(service)?;
        self.dispatch(
            Request::DiscoverCharacteristics {
                service: handle,
                filter,
            },
            ResponderLink::Service(service.key),
        )?;
        if let Some(node) = self.tree.service_mut(service.key) {
            node.characteristic_discovery = DiscoveryState::Discovering;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(characteristic = %characteristic.identifier))]
    pub fn discover_descriptors(&mut self, characteristic: Characteristic) -> Result<(), GattError> {
        let handle = self.live_characteristic(characteristic)?;
        self.dispatch(
            Request::DiscoverDescriptors {
                characteristic: handle,
            },
            ResponderLink::Characteristic(characteristic.key),
        )?;
        if let Some(node) = self.tree.characteristic_mut(characteristic.key) {
            node.descriptor_discovery = DiscoveryState::Discovering;
        }
        Ok(())
    }

    /// Runs the automatic steps that follow a successful connection.
    pub(crate) fn continue_after_connect(&mut self, peripheral: Peripheral) {
        let policy = self.policy_for_peripheral(peripheral.key);
        let needs_services = self
            .tree
            .peripheral(peripheral.key)
            .is_some_and(|node| node.discovery == DiscoveryState::NotDiscovered);
        if policy.services_on_connect && needs_services {
            if let Err(error) = self.discover_services(peripheral, policy.service_filter) {
                debug!(%error, "automatic service discovery was not started");
            }
        }
    }

    fn continue_service_discovery(&mut self, service: Service) {
        let policy = self.policy_for_service(service.key);
        let Some(node) = self.tree.service(service.key) else {
            return;
        };
        let needs_characteristics = node.characteristic_discovery == DiscoveryState::NotDiscovered;
        let needs_included = node.included_discovery == DiscoveryState::NotDiscovered;

        if policy.characteristics && needs_characteristics {
            if let Err(error) = self.discover_characteristics(service, policy.characteristic_filter)
            {
                debug!(%error, "automatic characteristic discovery was not started");
            }
        }
        if policy.included_services && needs_included {
            if let Err(error) = self.discover_included_services(service, None) {
                debug!(%error, "automatic included service discovery was not started");
            }
        }
    }

    fn continue_characteristic_discovery(&mut self, characteristic: Characteristic) {
        let policy = self.policy_for_characteristic(characteristic.key);
        let Some(node) = self.tree.characteristic(characteristic.key) else {
            return;
        };
        let needs_descriptors = node.descriptor_discovery == DiscoveryState::NotDiscovered;
        let properties = node.properties;
        let notifying = node.notifying;

        if policy.descriptors && needs_descriptors {
            if let Err(error) = self.discover_descriptors(characteristic) {
                debug!(%error, "automatic descriptor discovery was not started");
            }
        }
        if policy.subscribe && properties.can_subscribe() && !notifying {
            if let Err(error) = self.set_notify_value(characteristic, true) {
                debug!(%error, "automatic subscription was not started");
            }
        }
        if policy.read_values && properties.contains(CharacteristicProperties::READ) {
            if let Err(error) = self.read_value(characteristic) {
                debug!(%error, "automatic read was not started");
            }
        }
    }

    pub(crate) fn on_services_discovered(
        &mut self,
        handle: T::Peripheral,
        error: Option<TransportError>,
    ) {
        let Some(key) = self.tree.find_live_peripheral(&handle) else {
            trace!("dropping service discovery for a detached peripheral");
            return;
        };
        let Some(peripheral) = self.tree.peripheral_proxy(key) else {
            return;
        };

        if let Some(error) = error.map(GattError::from) {
            warn!(%error, peripheral = %peripheral.identifier, "service discovery failed");
            if let Some(node) = self.tree.peripheral_mut(key) {
                node.discovery.settle(Some(error.clone()));
            }
            self.notify_peripheral(key, |delegate| {
                delegate.did_discover_services(peripheral, Err(error));
            });
            return;
        }

        let live = self.transport.services(&handle);
        let keys = self
            .tree
            .sync_services(&self.transport, key, None, &live, true);
        if let Some(node) = self.tree.peripheral_mut(key) {
            node.discovery.settle(None);
        }
        let services: Vec<Service> = keys
            .into_iter()
            .filter_map(|key| self.tree.service_proxy(key))
            .collect();
        debug!(
            peripheral = %peripheral.identifier,
            count = services.len(),
            "services discovered"
        );
        let reported = services.clone();
        self.notify_peripheral(key, |delegate| {
            delegate.did_discover_services(peripheral, Ok(reported));
        });
        for service in services {
            self.continue_service_discovery(service);
        }
    }

    pub(crate) fn on_included_services_discovered(
        &mut self,
        handle: T::Peripheral,
        service_handle: T::Service,
        error: Option<TransportError>,
    ) {
        let Some(key) = self.tree.find_live_peripheral(&handle) else {
            trace!("dropping included service discovery for a detached peripheral");
            return;
        };
        let Some(service) = self
            .tree
            .find_service(key, &service_handle)
            .and_then(|service| self.tree.service_proxy(service))
        else {
            trace!("dropping included service discovery for an unknown service");
            return;
        };

        if let Some(error) = error.map(GattError::from) {
            warn!(%error, service = %service.identifier, "included service discovery failed");
            if let Some(node) = self.tree.service_mut(service.key) {
                node.included_discovery.settle(Some(error.clone()));
            }
            self.notify_peripheral(key, |delegate| {
                delegate.did_discover_included_services(service, Err(error));
            });
            return;
        }

        let live = self.transport.included_services(&service_handle);
        let keys = self
            .tree
            .sync_services(&self.transport, key, Some(service.key), &live, true);
        if let Some(node) = self.tree.service_mut(service.key) {
            node.included_discovery.settle(None);
        }
        let included: Vec<Service> = keys
            .into_iter()
            .filter_map(|key| self.tree.service_proxy(key))
            .collect();
        let reported = included.clone();
        self.notify_peripheral(key, |delegate| {
            delegate.did_discover_included_services(service, Ok(reported));
        });
        for service in included {
            self.continue_service_discovery(service);
        }
    }

    pub(crate) fn on_characteristics_discovered(
        &mut self,
        handle: T::Peripheral,
        service_handle: T::Service,
        error: Option<TransportError>,
    ) {
        let Some(key) = self.tree.find_live_peripheral(&handle) else {
            trace!("dropping characteristic discovery for a detached peripheral");
            return;
        };
        let Some(service) = self
            .tree
            .find_service(key, &service_handle)
            .and_then(|service| self.tree.service_proxy(service))
        else {
            trace!("dropping characteristic discovery for an unknown service");
            return;
        };

        if let Some(error) = error.map(GattError::from) {
            warn!(%error, service = %service.identifier, "characteristic discovery failed");
            if let Some(node) = self.tree.service_mut(service.key) {
                node.characteristic_discovery.settle(Some(error.clone()));
            }
            self.notify_peripheral(key, |delegate| {
                delegate.did_discover_characteristics(service, Err(error));
            });
            return;
        }

        let live = self.transport.characteristics(&service_handle);
        let keys = self
            .tree
            .sync_characteristics(&self.transport, service.key, &live, true);
        if let Some(node) = self.tree.service_mut(service.key) {
            node.characteristic_discovery.settle(None);
        }
        let characteristics: Vec<Characteristic> = keys
            .into_iter()
            .filter_map(|key| self.tree.characteristic_proxy(key))
            .collect();
        let reported = characteristics.clone();
        self.notify_peripheral(key, |delegate| {
            delegate.did_discover_characteristics(service, Ok(reported));
        });
        for characteristic in characteristics {
            self.continue_characteristic_discovery(characteristic);
        }
    }

    pub(crate) fn on_descriptors_discovered(
        &mut self,
        handle: T::Peripheral,
        characteristic_handle: T::Characteristic,
        error: Option<TransportError>,
    ) {
        let Some(key) = self.tree.find_live_peripheral(&handle) else {
            trace!("dropping descriptor discovery for a detached peripheral");
            return;
        };
        let Some(characteristic) = self
            .tree
            .find_characteristic(key, &characteristic_handle)
            .and_then(|characteristic| self.tree.characteristic_proxy(characteristic))
        else {
            trace!("dropping descriptor discovery for an unknown characteristic");
            return;
        };

        if let Some(error) = error.map(GattError::from) {
            warn!(%error, characteristic = %characteristic.identifier, "descriptor discovery failed");
            if let Some(node) = self.tree.characteristic_mut(characteristic.key) {
                node.descriptor_discovery.settle(Some(error.clone()));
            }
            self.notify_peripheral(key, |delegate| {
                delegate.did_discover_descriptors(characteristic, Err(error));
            });
            return;
        }

        let live = self.transport.descriptors(&characteristic_handle);
        let keys = self
            .tree
            .sync_descriptors(characteristic.key, &live, true);
        if let Some(node) = self.tree.characteristic_mut(characteristic.key) {
            node.descriptor_discovery.settle(None);
        }
        let descriptors: Vec<_> = keys
            .into_iter()
            .filter_map(|key| self.tree.descriptor_proxy(key))
            .collect();
        self.notify_peripheral(key, |delegate| {
            delegate.did_discover_descriptors(characteristic, Ok(descriptors));
        });
    }

    /// Detaches invalidated services and, when the policy asks for it,
    /// rediscovers them.
    pub(crate) fn on_services_modified(&mut self, handle: T::Peripheral, invalidated: Vec<T::Service>) {
        let Some(key) = self.tree.find_live_peripheral(&handle) else {
            trace!("dropping service change for a detached peripheral");
            return;
        };
        let Some(peripheral) = self.tree.peripheral_proxy(key) else {
            return;
        };

        let mut services = Vec::with_capacity(invalidated.len());
        for service_handle in &invalidated {
            let Some(service) = self.tree.find_service(key, service_handle) else {
                continue;
            };
            self.tree.detach_service(service);
            if let Some(node) = self.tree.service_mut(service) {
                node.characteristic_discovery = DiscoveryState::NotDiscovered;
                node.included_discovery = DiscoveryState::NotDiscovered;
            }
            if let Some(proxy) = self.tree.service_proxy(service) {
                services.push(proxy);
            }
        }
        if let Some(node) = self.tree.peripheral_mut(key) {
            node.discovery = DiscoveryState::NotDiscovered;
        }
        debug!(
            peripheral = %peripheral.identifier,
            count = services.len(),
            "services invalidated"
        );

        self.notify_peripheral(key, |delegate| {
            delegate.did_modify_services(peripheral, services);
        });
        self.continue_after_connect(peripheral);
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn abandon_only_resets_in_flight_discovery() {
        let mut state = DiscoveryState::Discovering;
        state.abandon();
        assert_eq!(DiscoveryState::NotDiscovered, state);

        let mut state = DiscoveryState::Discovered;
        state.abandon();
        assert_eq!(DiscoveryState::Discovered, state);
    }

    #[test]
    fn settle_records_failure() {
        let mut state = DiscoveryState::Discovering;
        state.settle(Some(GattError::from(TransportError::new(14, "busy"))));
        assert_matches!(state, DiscoveryState::Failed(GattError::Transport(_)));
        assert!(state.is_settled());
        assert_eq!(
            "failed: transport error 14: busy",
            state.to_string()
        );
    }

    #[test]
    fn policy_builder_defaults_to_manual() {
        let policy = DiscoveryPolicy::builder().services_on_connect(true).build();
        assert_eq!(
            DiscoveryPolicy {
                services_on_connect: true,
                ..DiscoveryPolicy::manual()
            },
            policy
        );
    }

    #[test]
    fn policy_deserialises_with_missing_fields() -> anyhow::Result<()> {
        let policy: DiscoveryPolicy = serde_json::from_str(r#"{"characteristics": true}"#)?;
        assert!(policy.characteristics);
        assert!(!policy.services_on_connect);
        Ok(())
    }
}
