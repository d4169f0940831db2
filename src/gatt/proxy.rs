use derive_more::Display;

use crate::identifier::Identifier;

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Display)]
        #[display("{}#{}", $label, _0)]
        pub struct $name(pub(crate) u64);
    };
}

arena_key!(
    /// Arena key of a peripheral record.
    PeripheralKey,
    "peripheral"
);
arena_key!(
    /// Arena key of a service record.
    ServiceKey,
    "service"
);
arena_key!(
    /// Arena key of a characteristic record.
    CharacteristicKey,
    "characteristic"
);
arena_key!(
    /// Arena key of a descriptor record.
    DescriptorKey,
    "descriptor"
);

/// A remote device tracked by a central manager.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Peripheral {
    pub(crate) key: PeripheralKey,
    pub(crate) identifier: Identifier,
}

impl Peripheral {
    #[must_use]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[must_use]
    pub fn key(&self) -> PeripheralKey {
        self.key
    }
}

/// A service of a remote device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Service {
    pub(crate) key: ServiceKey,
    pub(crate) peripheral: PeripheralKey,
    pub(crate) identifier: Identifier,
}

impl Service {
    #[must_use]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[must_use]
    pub fn key(&self) -> ServiceKey {
        self.key
    }

    /// Key of the owning peripheral record.
    #[must_use]
    pub fn peripheral_key(&self) -> PeripheralKey {
        self.peripheral
    }
}

/// A characteristic of a remote service.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Characteristic {
    pub(crate) key: CharacteristicKey,
    pub(crate) service: ServiceKey,
    pub(crate) peripheral: PeripheralKey,
    pub(crate) identifier: Identifier,
}

impl Characteristic {
    #[must_use]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[must_use]
    pub fn key(&self) -> CharacteristicKey {
        self.key
    }

    #[must_use]
    pub fn service_key(&self) -> ServiceKey {
        self.service
    }

    #[must_use]
    pub fn peripheral_key(&self) -> PeripheralKey {
        self.peripheral
    }
}

/// A descriptor of a remote characteristic.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Descriptor {
    pub(crate) key: DescriptorKey,
    pub(crate) characteristic: CharacteristicKey,
    pub(crate) peripheral: PeripheralKey,
    pub(crate) identifier: Identifier,
}

impl Descriptor {
    #[must_use]
    pub fn identifier(&self) -> Identifier {
        self.identifier
    }

    #[must_use]
    pub fn key(&self) -> DescriptorKey {
        self.key
    }

    #[must_use]
    pub fn characteristic_key(&self) -> CharacteristicKey {
        self.characteristic
    }

    #[must_use]
    pub fn peripheral_key(&self) -> PeripheralKey {
        self.peripheral
    }
}

/// Hands out arena keys. Keys are never reused.
#[derive(Debug, Default)]
pub(crate) struct KeyAllocator {
    next: u64,
}

impl KeyAllocator {
    fn bump(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    pub(crate) fn peripheral(&mut self) -> PeripheralKey {
        PeripheralKey(self.bump())
    }

    pub(crate) fn service(&mut self) -> ServiceKey {
        ServiceKey(self.bump())
    }

    pub(crate) fn characteristic(&mut self) -> CharacteristicKey {
        CharacteristicKey(self.bump())
    }

    pub(crate) fn descriptor(&mut self) -> DescriptorKey {
        DescriptorKey(self.bump())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn allocator_never_repeats_keys_across_kinds() {
        let mut keys = KeyAllocator::default();
        let peripheral = keys.peripheral();
        let service = keys.service();
        let characteristic = keys.characteristic();
        assert_eq!(1, peripheral.0);
        assert_eq!(2, service.0);
        assert_eq!(3, characteristic.0);
        assert_eq!("service#2", service.to_string());
    }
}
