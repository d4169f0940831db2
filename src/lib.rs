mod advertisement;
mod central;
mod codec;
mod error;
pub mod fake;
mod gatt;
mod identifier;
mod peripheral;
mod responder;
mod telemetry;
mod transport;

#[cfg(feature = "btleplug")]
pub mod btleplug_transport;

pub use advertisement::{Advertisement, AdvertisementKey, AdvertisementValue};
pub use central::{
    CentralDelegate, CentralManager, CentralManagerCore, CharacteristicRecord, DiscoveryPolicy,
    DiscoveryState, EventForwarder, EventSink, FileRestorationStore, GattEvent, L2capHandler,
    ManagerConfig, MemoryRestorationStore, PeripheralDataSource, PeripheralDelegate,
    PeripheralRecord, PeripheralSetup, Request, ResponderLink, RestorationRecord,
    RestorationStore, ScanTimer, ServiceRecord,
};
pub use codec::{LittleEndian, ReadOnly, Utf8, ValueCodec, WriteOnly};
pub use error::{
    FixtureError, GattError, PeripheralError, RestorationError, TelemetryError, TransportError,
};
pub use gatt::{
    Characteristic, CharacteristicInfo, CharacteristicKey, Descriptor, DescriptorInfo,
    DescriptorKey, Peripheral, PeripheralInfo, PeripheralKey, Service, ServiceInfo, ServiceKey,
};
pub use identifier::{Identifier, IdentifierParseError};
pub use peripheral::{
    AdvertisementRequest, AttRequest, AttResult, AttributePermissions, MutableCharacteristic,
    MutableDescriptor, MutableService, PeripheralEvent, PeripheralManagerCore,
    PeripheralManagerDelegate, PeripheralTransport,
};
pub use responder::{
    Capabilities, Dispatch, Message, ResponderChain, can_dispatch, responder_for, try_dispatch,
};
pub use telemetry::{LogFormat, initialise_tracing};
pub use transport::{
    CharacteristicProperties, ConnectOptions, ConnectionState, Handle, ManagerState,
    RestoredState, ScanOptions, Transport, TransportEvent, WriteType,
};
