pub(crate) mod children;
mod proxy;
pub(crate) mod shadow;
mod snapshot;
pub(crate) mod tree;

pub use proxy::{
    Characteristic, CharacteristicKey, Descriptor, DescriptorKey, Peripheral, PeripheralKey,
    Service, ServiceKey,
};
pub use snapshot::{CharacteristicInfo, DescriptorInfo, PeripheralInfo, ServiceInfo};
