mod attribute;
mod manager;

pub use attribute::{
    AdvertisementRequest, AttResult, AttributePermissions, MutableCharacteristic,
    MutableDescriptor, MutableService,
};
pub use manager::{
    AttRequest, PeripheralEvent, PeripheralManagerCore, PeripheralManagerDelegate,
    PeripheralTransport,
};
