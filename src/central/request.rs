use tracing::{instrument, trace};

use super::engine::CentralManagerCore;
use crate::codec::ValueCodec;
use crate::error::GattError;
use crate::gatt::{Characteristic, Descriptor, DescriptorKey, Peripheral, PeripheralKey, Service};
use crate::gatt::{CharacteristicKey, ServiceKey};
use crate::identifier::Identifier;
use crate::responder::{Capabilities, Message, ResponderChain};
use crate::transport::{
    CharacteristicProperties, ConnectOptions, ConnectionState, ManagerState, Transport, WriteType,
};

/// One element of a central manager's responder chain.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResponderLink {
    Descriptor(DescriptorKey),
    Characteristic(CharacteristicKey),
    Service(ServiceKey),
    Peripheral(PeripheralKey),
    Central,
}

/// A transport command waiting for a responder able to issue it.
pub enum Request<T: Transport> {
    Connect {
        peripheral: T::Peripheral,
        options: ConnectOptions,
    },
    CancelConnection {
        peripheral: T::Peripheral,
    },
    DiscoverServices {
        filter: Option<Vec<Identifier>>,
    },
    DiscoverIncludedServices {
        service: T::Service,
        filter: Option<Vec<Identifier>>,
    },
    DiscoverCharacteristics {
        service: T::Service,
        filter: Option<Vec<Identifier>>,
    },
    DiscoverDescriptors {
        characteristic: T::Characteristic,
    },
    ReadCharacteristic {
        characteristic: T::Characteristic,
    },
    WriteCharacteristic {
        characteristic: T::Characteristic,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        characteristic: T::Characteristic,
        enabled: bool,
    },
    ReadDescriptor {
        descriptor: T::Descriptor,
    },
    WriteDescriptor {
        descriptor: T::Descriptor,
        value: Vec<u8>,
    },
    ReadRssi,
    OpenL2capChannel {
        psm: u16,
    },
}

impl<T: Transport> Message for Request<T> {
    type Output = Result<(), GattError>;

    fn required(&self) -> Capabilities {
        match self {
            Self::Connect { .. } | Self::CancelConnection { .. } => Capabilities::CENTRAL,
            Self::OpenL2capChannel { .. } => Capabilities::L2CAP,
            _ => Capabilities::GATT_IO,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::CancelConnection { .. } => "cancel_connection",
            Self::DiscoverServices { .. } => "discover_services",
            Self::DiscoverIncludedServices { .. } => "discover_included_services",
            Self::DiscoverCharacteristics { .. } => "discover_characteristics",
            Self::DiscoverDescriptors { .. } => "discover_descriptors",
            Self::ReadCharacteristic { .. } => "read_characteristic",
            Self::WriteCharacteristic { .. } => "write_characteristic",
            Self::SetNotify { .. } => "set_notify",
            Self::ReadDescriptor { .. } => "read_descriptor",
            Self::WriteDescriptor { .. } => "write_descriptor",
            Self::ReadRssi => "read_rssi",
            Self::OpenL2capChannel { .. } => "open_l2cap_channel",
        }
    }
}

impl<T: Transport> ResponderChain<Request<T>> for CentralManagerCore<T> {
    type Link = ResponderLink;

    fn next_responder(&self, link: ResponderLink) -> Option<ResponderLink> {
        match link {
            ResponderLink::Descriptor(key) => self
                .tree
                .descriptor(key)
                .map(|node| ResponderLink::Characteristic(node.characteristic)),
            ResponderLink::Characteristic(key) => self
                .tree
                .characteristic(key)
                .map(|node| ResponderLink::Service(node.service)),
            ResponderLink::Service(key) => self
                .tree
                .service(key)
                .map(|node| ResponderLink::Peripheral(node.peripheral)),
            ResponderLink::Peripheral(_) => Some(ResponderLink::Central),
            ResponderLink::Central => None,
        }
    }

    fn capabilities(&self, link: ResponderLink) -> Capabilities {
        match link {
            ResponderLink::Peripheral(key) => match self.tree.peripheral(key) {
                Some(node)
                    if node.state == ConnectionState::Connected && node.shadow.is_attached() =>
                {
                    Capabilities::GATT_IO | Capabilities::L2CAP
                }
                _ => Capabilities::empty(),
            },
            ResponderLink::Central => Capabilities::CENTRAL,
            ResponderLink::Descriptor(_)
            | ResponderLink::Characteristic(_)
            | ResponderLink::Service(_) => Capabilities::empty(),
        }
    }

    fn respond(&mut self, link: ResponderLink, message: Request<T>) -> Result<(), GattError> {
        match link {
            ResponderLink::Central => self.respond_as_central(message),
            ResponderLink::Peripheral(key) => self.respond_as_peripheral(key, message),
            ResponderLink::Descriptor(_)
            | ResponderLink::Characteristic(_)
            | ResponderLink::Service(_) => Err(GattError::Unhandled {
                request: message.name(),
            }),
        }
    }
}

impl<T: Transport> CentralManagerCore<T> {
    fn respond_as_central(&mut self, message: Request<T>) -> Result<(), GattError> {
        match message {
            Request::Connect {
                peripheral,
                options,
            } => {
                assert_eq!(
                    ManagerState::PoweredOn,
                    self.transport.state(),
                    "connecting requires a powered-on radio"
                );
                self.transport.connect(&peripheral, &options);
                Ok(())
            }
            Request::CancelConnection { peripheral } => {
                self.transport.cancel_connection(&peripheral);
                Ok(())
            }
            other => Err(GattError::Unhandled {
                request: other.name(),
            }),
        }
    }

    fn respond_as_peripheral(
        &mut self,
        key: PeripheralKey,
        message: Request<T>,
    ) -> Result<(), GattError> {
        let Some(peripheral) = self.tree.live_peripheral(key) else {
            let identifier = self
                .tree
                .peripheral(key)
                .map(|node| node.identifier)
                .ok_or(GattError::UnknownEntity)?;
            return Err(GattError::Unreachable { identifier });
        };
        let transport = &mut self.transport;
        match message {
            Request::DiscoverServices { filter } => {
                transport.discover_services(&peripheral, filter.as_deref());
            }
            Request::DiscoverIncludedServices { service, filter } => {
                transport.discover_included_services(&peripheral, &service, filter.as_deref());
            }
            Request::DiscoverCharacteristics { service, filter } => {
                transport.discover_characteristics(&peripheral, &service, filter.as_deref());
            }
            Request::DiscoverDescriptors { characteristic } => {
                transport.discover_descriptors(&peripheral, &characteristic);
            }
            Request::ReadCharacteristic { characteristic } => {
                transport.read_characteristic(&peripheral, &characteristic);
            }
            Request::WriteCharacteristic {
                characteristic,
                value,
                write_type,
            } => {
                transport.write_characteristic(&peripheral, &characteristic, &value, write_type);
            }
            Request::SetNotify {
                characteristic,
                enabled,
            } => transport.set_notify(&peripheral, &characteristic, enabled),
            Request::ReadDescriptor { descriptor } => {
                transport.read_descriptor(&peripheral, &descriptor);
            }
            Request::WriteDescriptor { descriptor, value } => {
                transport.write_descriptor(&peripheral, &descriptor, &value);
            }
            Request::ReadRssi => transport.read_rssi(&peripheral),
            Request::OpenL2capChannel { psm } => transport.open_l2cap_channel(&peripheral, psm),
            other @ (Request::Connect { .. } | Request::CancelConnection { .. }) => {
                return Err(GattError::Unhandled {
                    request: other.name(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn live_service(&self, service: Service) -> Result<T::Service, GattError> {
        let node = self
            .tree
            .service(service.key)
            .ok_or(GattError::UnknownEntity)?;
        node.shadow
            .handle()
            .cloned()
            .ok_or(GattError::Unreachable {
                identifier: service.identifier,
            })
    }

    pub(crate) fn live_characteristic(
        &self,
        characteristic: Characteristic,
    ) -> Result<T::Characteristic, GattError> {
        let node = self
            .tree
            .characteristic(characteristic.key)
            .ok_or(GattError::UnknownEntity)?;
        node.shadow
            .handle()
            .cloned()
            .ok_or(GattError::Unreachable {
                identifier: characteristic.identifier,
            })
    }

    fn live_descriptor(&self, descriptor: Descriptor) -> Result<T::Descriptor, GattError> {
        let node = self
            .tree
            .descriptor(descriptor.key)
            .ok_or(GattError::UnknownEntity)?;
        node.shadow
            .handle()
            .cloned()
            .ok_or(GattError::Unreachable {
                identifier: descriptor.identifier,
            })
    }

    fn require_property(
        &self,
        characteristic: Characteristic,
        required: CharacteristicProperties,
        operation: &'static str,
    ) -> Result<(), GattError> {
        let properties = self
            .tree
            .characteristic(characteristic.key)
            .map(|node| node.properties)
            .ok_or(GattError::UnknownEntity)?;
        if properties.intersects(required) {
            Ok(())
        } else {
            Err(GattError::NotPermitted {
                identifier: characteristic.identifier,
                operation,
            })
        }
    }

    /// Requests the characteristic's value. The value arrives through
    /// [`PeripheralDelegate::did_update_value`](super::PeripheralDelegate::did_update_value).
    #[instrument(skip(self), level = "trace", fields(characteristic = %characteristic.identifier))]
    pub fn read_value(&mut self, characteristic: Characteristic) -> Result<(), GattError> {
        let handle = self.live_characteristic(characteristic)?;
        self.require_property(characteristic, CharacteristicProperties::READ, "read")?;
        self.dispatch(
            Request::ReadCharacteristic {
                characteristic: handle,
            },
            ResponderLink::Characteristic(characteristic.key),
        )
    }

    #[instrument(
        skip(self, value),
        level = "trace",
        fields(characteristic = %characteristic.identifier, len = value.len(), %write_type)
    )]
    pub fn write_value(
        &mut self,
        characteristic: Characteristic,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<(), GattError> {
        let handle = self.live_characteristic(characteristic)?;
        let required = match write_type {
            WriteType::WithResponse => CharacteristicProperties::WRITE,
            WriteType::WithoutResponse => CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        };
        self.require_property(characteristic, required, "write")?;
        self.dispatch(
            Request::WriteCharacteristic {
                characteristic: handle,
                value,
                write_type,
            },
            ResponderLink::Characteristic(characteristic.key),
        )
    }

    /// Encodes `value` with `codec` and writes it.
    pub fn write_typed<C: ValueCodec>(
        &mut self,
        characteristic: Characteristic,
        codec: &C,
        value: &C::Value,
        write_type: WriteType,
    ) -> Result<(), GattError> {
        let bytes = codec.encode(value)?;
        self.write_value(characteristic, bytes, write_type)
    }

    /// Decodes the last value received for `characteristic`.
    pub fn decode_value<C: ValueCodec>(
        &self,
        characteristic: Characteristic,
        codec: &C,
    ) -> Result<C::Value, GattError> {
        let node = self
            .tree
            .characteristic(characteristic.key)
            .ok_or(GattError::UnknownEntity)?;
        let Some(value) = &node.value else {
            return Err(GattError::DecodingFailed {
                reason: format!("`{}` has no value yet", characteristic.identifier),
            });
        };
        codec.decode(value)
    }

    #[instrument(skip(self), level = "trace", fields(characteristic = %characteristic.identifier))]
    pub fn set_notify_value(
        &mut self,
        characteristic: Characteristic,
        enabled: bool,
    ) -> Result<(), GattError> {
        let handle = self.live_characteristic(characteristic)?;
        if enabled {
            self.require_property(
                characteristic,
                CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE,
                "notify",
            )?;
        }
        self.dispatch(
            Request::SetNotify {
                characteristic: handle,
                enabled,
            },
            ResponderLink::Characteristic(characteristic.key),
        )
    }

    #[instrument(skip(self), level = "trace", fields(descriptor = %descriptor.identifier))]
    pub fn read_descriptor(&mut self, descriptor: Descriptor) -> Result<(), GattError> {
        let handle = self.live_descriptor(descriptor)?;
        self.dispatch(
            Request::ReadDescriptor { descriptor: handle },
            ResponderLink::Descriptor(descriptor.key),
        )
    }

    #[instrument(skip(self, value), level = "trace", fields(descriptor = %descriptor.identifier))]
    pub fn write_descriptor(
        &mut self,
        descriptor: Descriptor,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let handle = self.live_descriptor(descriptor)?;
        self.dispatch(
            Request::WriteDescriptor {
                descriptor: handle,
                value,
            },
            ResponderLink::Descriptor(descriptor.key),
        )
    }

    pub fn read_rssi(&mut self, peripheral: Peripheral) -> Result<(), GattError> {
        self.require_live_peripheral(peripheral)?;
        self.dispatch(Request::ReadRssi, ResponderLink::Peripheral(peripheral.key))
    }

    /// Opens an L2CAP channel. The channel is handed to the handler installed
    /// with [`set_l2cap_handler`](Self::set_l2cap_handler).
    pub fn open_l2cap_channel(&mut self, peripheral: Peripheral, psm: u16) -> Result<(), GattError> {
        self.require_live_peripheral(peripheral)?;
        trace!(psm, "opening l2cap channel");
        self.dispatch(
            Request::OpenL2capChannel { psm },
            ResponderLink::Peripheral(peripheral.key),
        )
    }

    /// Largest value a single write of `write_type` can carry.
    pub fn maximum_write_length(
        &self,
        peripheral: Peripheral,
        write_type: WriteType,
    ) -> Result<usize, GattError> {
        let handle = self.require_live_peripheral(peripheral)?;
        Ok(self.transport.maximum_write_length(&handle, write_type))
    }

    pub fn can_send_write_without_response(&self, peripheral: Peripheral) -> Result<bool, GattError> {
        let handle = self.require_live_peripheral(peripheral)?;
        Ok(self.transport.can_send_write_without_response(&handle))
    }

    fn require_live_peripheral(&self, peripheral: Peripheral) -> Result<T::Peripheral, GattError> {
        let node = self
            .tree
            .peripheral(peripheral.key)
            .ok_or(GattError::UnknownEntity)?;
        node.shadow
            .handle()
            .cloned()
            .ok_or(GattError::Unreachable {
                identifier: peripheral.identifier,
            })
    }
}
