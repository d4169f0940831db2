use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use bon::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

use crate::advertisement::Advertisement;
use crate::error::TransportError;
use crate::identifier::Identifier;

/// Power/authorization state of the local radio.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, Default)]
pub enum ManagerState {
    #[default]
    #[strum(to_string = "unknown")]
    Unknown,
    #[strum(to_string = "resetting")]
    Resetting,
    #[strum(to_string = "unsupported")]
    Unsupported,
    #[strum(to_string = "unauthorized")]
    Unauthorized,
    #[strum(to_string = "powered_off")]
    PoweredOff,
    #[strum(to_string = "powered_on")]
    PoweredOn,
}

/// Connection state of one peripheral.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, Default, Serialize, Deserialize,
)]
pub enum ConnectionState {
    #[default]
    #[strum(to_string = "disconnected")]
    Disconnected,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "disconnecting")]
    Disconnecting,
}

/// Acknowledgement mode for characteristic writes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter)]
pub enum WriteType {
    #[strum(to_string = "with_response")]
    WithResponse,
    #[strum(to_string = "without_response")]
    WithoutResponse,
}

bitflags! {
    /// Characteristic properties as declared by the remote GATT server.
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CharacteristicProperties: u16 {
        const BROADCAST = 0x0001;
        const READ = 0x0002;
        const WRITE_WITHOUT_RESPONSE = 0x0004;
        const WRITE = 0x0008;
        const NOTIFY = 0x0010;
        const INDICATE = 0x0020;
        const AUTHENTICATED_SIGNED_WRITES = 0x0040;
        const EXTENDED_PROPERTIES = 0x0080;
        const NOTIFY_ENCRYPTION_REQUIRED = 0x0100;
        const INDICATE_ENCRYPTION_REQUIRED = 0x0200;
    }
}

impl CharacteristicProperties {
    /// Returns whether the characteristic can be subscribed to.
    #[must_use]
    pub fn can_subscribe(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// Returns whether the characteristic accepts writes of the given type.
    #[must_use]
    pub fn permits_write(self, write_type: WriteType) -> bool {
        match write_type {
            WriteType::WithResponse => self.contains(Self::WRITE),
            WriteType::WithoutResponse => self.contains(Self::WRITE_WITHOUT_RESPONSE),
        }
    }
}

/// Options applied when scanning.
#[derive(Debug, Clone, Eq, PartialEq, Default, Builder, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Report every advertisement rather than one per peripheral.
    #[builder(default)]
    #[serde(default)]
    pub allow_duplicates: bool,
    /// Services a peripheral must solicit to be reported.
    #[builder(default)]
    #[serde(default)]
    pub solicited_services: Vec<Identifier>,
}

/// Options applied when connecting.
#[derive(Debug, Clone, Eq, PartialEq, Default, Builder, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[builder(default)]
    #[serde(default)]
    pub notify_on_connection: bool,
    #[builder(default)]
    #[serde(default)]
    pub notify_on_disconnection: bool,
    #[builder(default)]
    #[serde(default)]
    pub notify_on_notification: bool,
    #[builder(default)]
    #[serde(default)]
    pub enable_transport_bridging: bool,
    /// Delay before the platform surfaces a reconnection to the user.
    #[serde(default)]
    pub start_delay: Option<Duration>,
}

/// An opaque, platform-issued handle for one remote attribute or device.
///
/// Handles are reissued on every connection; two handles for the same remote
/// entity from different connections compare unequal.
pub trait Handle: Clone + Eq + fmt::Debug + Send + Sync + 'static {
    /// Identifier of the remote entity behind this handle.
    fn identifier(&self) -> Identifier;
}

/// Capability interface supplied by the radio-stack collaborator.
///
/// Commands never block. Each completion arrives later as a
/// [`TransportEvent`] posted through an
/// [`EventSink`](crate::central::EventSink).
pub trait Transport: Send + 'static {
    type Peripheral: Handle;
    type Service: Handle;
    type Characteristic: Handle;
    type Descriptor: Handle;
    /// Channel object handed through untouched when an L2CAP channel opens.
    type L2capChannel: Send + 'static;

    /// Current radio state.
    fn state(&self) -> ManagerState;

    fn scan(&mut self, services: Option<&[Identifier]>, options: &ScanOptions);
    fn stop_scan(&mut self);
    fn connect(&mut self, peripheral: &Self::Peripheral, options: &ConnectOptions);
    fn cancel_connection(&mut self, peripheral: &Self::Peripheral);

    /// Peripherals the platform still knows, by identifier.
    fn retrieve_peripherals(&self, identifiers: &[Identifier]) -> Vec<Self::Peripheral>;
    /// Connected peripherals exposing any of the given services.
    fn retrieve_connected_peripherals(&self, services: &[Identifier]) -> Vec<Self::Peripheral>;
    /// The platform's view of a peripheral's connection state.
    fn peripheral_state(&self, peripheral: &Self::Peripheral) -> ConnectionState;
    fn peripheral_name(&self, peripheral: &Self::Peripheral) -> Option<String>;

    fn discover_services(&mut self, peripheral: &Self::Peripheral, services: Option<&[Identifier]>);
    fn discover_included_services(
        &mut self,
        peripheral: &Self::Peripheral,
        service: &Self::Service,
        services: Option<&[Identifier]>,
    );
    fn discover_characteristics(
        &mut self,
        peripheral: &Self::Peripheral,
        service: &Self::Service,
        characteristics: Option<&[Identifier]>,
    );
    fn discover_descriptors(
        &mut self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
    );
    fn read_characteristic(
        &mut self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
    );
    fn write_characteristic(
        &mut self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
        value: &[u8],
        write_type: WriteType,
    );
    fn set_notify(
        &mut self,
        peripheral: &Self::Peripheral,
        characteristic: &Self::Characteristic,
        enabled: bool,
    );
    fn read_descriptor(&mut self, peripheral: &Self::Peripheral, descriptor: &Self::Descriptor);
    fn write_descriptor(
        &mut self,
        peripheral: &Self::Peripheral,
        descriptor: &Self::Descriptor,
        value: &[u8],
    );
    fn read_rssi(&mut self, peripheral: &Self::Peripheral);
    fn open_l2cap_channel(&mut self, peripheral: &Self::Peripheral, psm: u16);
    fn maximum_write_length(&self, peripheral: &Self::Peripheral, write_type: WriteType) -> usize;
    fn can_send_write_without_response(&self, peripheral: &Self::Peripheral) -> bool;

    /// Services currently vended beneath a peripheral handle, in discovery order.
    fn services(&self, peripheral: &Self::Peripheral) -> Vec<Self::Service>;
    fn included_services(&self, service: &Self::Service) -> Vec<Self::Service>;
    fn characteristics(&self, service: &Self::Service) -> Vec<Self::Characteristic>;
    fn descriptors(&self, characteristic: &Self::Characteristic) -> Vec<Self::Descriptor>;
    fn is_primary(&self, service: &Self::Service) -> bool;
    fn characteristic_properties(
        &self,
        characteristic: &Self::Characteristic,
    ) -> CharacteristicProperties;
}

/// State handed back by the platform when the process is relaunched mid-session.
pub struct RestoredState<T: Transport> {
    pub peripherals: Vec<T::Peripheral>,
    pub scan_services: Option<Vec<Identifier>>,
    pub scan_options: Option<ScanOptions>,
}

/// Completion and lifecycle callbacks delivered by a transport.
pub enum TransportEvent<T: Transport> {
    StateChanged(ManagerState),
    WillRestoreState(RestoredState<T>),
    Discovered {
        peripheral: T::Peripheral,
        advertisement: Advertisement,
        rssi: i16,
    },
    Connected {
        peripheral: T::Peripheral,
    },
    FailedToConnect {
        peripheral: T::Peripheral,
        error: TransportError,
    },
    Disconnected {
        peripheral: T::Peripheral,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        peripheral: T::Peripheral,
        error: Option<TransportError>,
    },
    IncludedServicesDiscovered {
        peripheral: T::Peripheral,
        service: T::Service,
        error: Option<TransportError>,
    },
    CharacteristicsDiscovered {
        peripheral: T::Peripheral,
        service: T::Service,
        error: Option<TransportError>,
    },
    DescriptorsDiscovered {
        peripheral: T::Peripheral,
        characteristic: T::Characteristic,
        error: Option<TransportError>,
    },
    CharacteristicValueUpdated {
        peripheral: T::Peripheral,
        characteristic: T::Characteristic,
        value: Result<Vec<u8>, TransportError>,
    },
    CharacteristicWritten {
        peripheral: T::Peripheral,
        characteristic: T::Characteristic,
        error: Option<TransportError>,
    },
    NotificationStateUpdated {
        peripheral: T::Peripheral,
        characteristic: T::Characteristic,
        result: Result<bool, TransportError>,
    },
    DescriptorValueUpdated {
        peripheral: T::Peripheral,
        descriptor: T::Descriptor,
        value: Result<Vec<u8>, TransportError>,
    },
    DescriptorWritten {
        peripheral: T::Peripheral,
        descriptor: T::Descriptor,
        error: Option<TransportError>,
    },
    RssiRead {
        peripheral: T::Peripheral,
        rssi: Result<i16, TransportError>,
    },
    NameUpdated {
        peripheral: T::Peripheral,
        name: Option<String>,
    },
    ServicesModified {
        peripheral: T::Peripheral,
        invalidated: Vec<T::Service>,
    },
    ReadyToSendWriteWithoutResponse {
        peripheral: T::Peripheral,
    },
    L2capChannelOpened {
        peripheral: T::Peripheral,
        psm: u16,
        channel: Result<T::L2capChannel, TransportError>,
    },
}

impl<T: Transport> TransportEvent<T> {
    /// Short event name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "state_changed",
            Self::WillRestoreState(_) => "will_restore_state",
            Self::Discovered { .. } => "discovered",
            Self::Connected { .. } => "connected",
            Self::FailedToConnect { .. } => "failed_to_connect",
            Self::Disconnected { .. } => "disconnected",
            Self::ServicesDiscovered { .. } => "services_discovered",
            Self::IncludedServicesDiscovered { .. } => "included_services_discovered",
            Self::CharacteristicsDiscovered { .. } => "characteristics_discovered",
            Self::DescriptorsDiscovered { .. } => "descriptors_discovered",
            Self::CharacteristicValueUpdated { .. } => "characteristic_value_updated",
            Self::CharacteristicWritten { .. } => "characteristic_written",
            Self::NotificationStateUpdated { .. } => "notification_state_updated",
            Self::DescriptorValueUpdated { .. } => "descriptor_value_updated",
            Self::DescriptorWritten { .. } => "descriptor_written",
            Self::RssiRead { .. } => "rssi_read",
            Self::NameUpdated { .. } => "name_updated",
            Self::ServicesModified { .. } => "services_modified",
            Self::ReadyToSendWriteWithoutResponse { .. } => "ready_to_send_write_without_response",
            Self::L2capChannelOpened { .. } => "l2cap_channel_opened",
        }
    }
}

impl<T: Transport> fmt::Debug for TransportEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CharacteristicProperties::WRITE, WriteType::WithResponse, true)]
    #[case(CharacteristicProperties::WRITE, WriteType::WithoutResponse, false)]
    #[case(
        CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        WriteType::WithoutResponse,
        true
    )]
    #[case(CharacteristicProperties::READ, WriteType::WithResponse, false)]
    fn permits_write_follows_property_bits(
        #[case] properties: CharacteristicProperties,
        #[case] write_type: WriteType,
        #[case] expected: bool,
    ) {
        assert_eq!(expected, properties.permits_write(write_type));
    }

    #[test]
    fn indicate_counts_as_subscribable() {
        assert!(CharacteristicProperties::INDICATE.can_subscribe());
        assert!(!CharacteristicProperties::READ.can_subscribe());
    }

    #[test]
    fn scan_options_builder_defaults() {
        let options = ScanOptions::builder().allow_duplicates(true).build();
        assert_eq!(true, options.allow_duplicates);
        assert!(options.solicited_services.is_empty());
    }
}
