mod engine;
pub(crate) mod delegate;
pub(crate) mod discovery;
mod manager;
mod request;
mod restoration;

pub use engine::{CentralManagerCore, L2capHandler, ScanTimer};
pub use delegate::{
    CentralDelegate, EventForwarder, GattEvent, PeripheralDataSource, PeripheralDelegate,
    PeripheralSetup,
};
pub use discovery::{DiscoveryPolicy, DiscoveryState};
pub use manager::{CentralManager, EventSink, ManagerConfig};
pub use request::{Request, ResponderLink};
pub use restoration::{
    CharacteristicRecord, FileRestorationStore, MemoryRestorationStore, PeripheralRecord,
    RestorationRecord, RestorationStore, ServiceRecord,
};
