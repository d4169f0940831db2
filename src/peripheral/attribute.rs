use bitflags::bitflags;
use bon::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, FromRepr};

use crate::error::PeripheralError;
use crate::identifier::Identifier;
use crate::transport::CharacteristicProperties;

/// ATT status codes a local server answers requests with.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, FromRepr)]
pub enum AttResult {
    #[strum(to_string = "success")]
    Success = 0x00,
    #[strum(to_string = "invalid_handle")]
    InvalidHandle = 0x01,
    #[strum(to_string = "read_not_permitted")]
    ReadNotPermitted = 0x02,
    #[strum(to_string = "write_not_permitted")]
    WriteNotPermitted = 0x03,
    #[strum(to_string = "invalid_pdu")]
    InvalidPdu = 0x04,
    #[strum(to_string = "insufficient_authentication")]
    InsufficientAuthentication = 0x05,
    #[strum(to_string = "request_not_supported")]
    RequestNotSupported = 0x06,
    #[strum(to_string = "invalid_offset")]
    InvalidOffset = 0x07,
    #[strum(to_string = "insufficient_authorization")]
    InsufficientAuthorization = 0x08,
    #[strum(to_string = "prepare_queue_full")]
    PrepareQueueFull = 0x09,
    #[strum(to_string = "attribute_not_found")]
    AttributeNotFound = 0x0a,
    #[strum(to_string = "attribute_not_long")]
    AttributeNotLong = 0x0b,
    #[strum(to_string = "insufficient_encryption_key_size")]
    InsufficientEncryptionKeySize = 0x0c,
    #[strum(to_string = "invalid_attribute_value_length")]
    InvalidAttributeValueLength = 0x0d,
    #[strum(to_string = "unlikely_error")]
    UnlikelyError = 0x0e,
    #[strum(to_string = "insufficient_encryption")]
    InsufficientEncryption = 0x0f,
    #[strum(to_string = "unsupported_group_type")]
    UnsupportedGroupType = 0x10,
    #[strum(to_string = "insufficient_resources")]
    InsufficientResources = 0x11,
}

impl AttResult {
    /// Wire code of the status.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// Access rules for a local attribute value.
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AttributePermissions: u8 {
        const READABLE = 0x01;
        const WRITEABLE = 0x02;
        const READ_ENCRYPTION_REQUIRED = 0x04;
        const WRITE_ENCRYPTION_REQUIRED = 0x08;
    }
}

impl AttributePermissions {
    #[must_use]
    pub fn allows_read(self) -> bool {
        self.intersects(Self::READABLE | Self::READ_ENCRYPTION_REQUIRED)
    }

    #[must_use]
    pub fn allows_write(self) -> bool {
        self.intersects(Self::WRITEABLE | Self::WRITE_ENCRYPTION_REQUIRED)
    }
}

/// A descriptor published under a local characteristic.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct MutableDescriptor {
    pub identifier: Identifier,
    pub value: Vec<u8>,
}

impl MutableDescriptor {
    #[must_use]
    pub fn new(identifier: Identifier, value: impl Into<Vec<u8>>) -> Self {
        Self {
            identifier,
            value: value.into(),
        }
    }
}

/// A characteristic published by the local server.
///
/// A characteristic with a `value` is cached: reads are answered from the
/// table and it must not be writable. Without a value every access is
/// surfaced as an [`AttRequest`](super::AttRequest).
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
pub struct MutableCharacteristic {
    pub identifier: Identifier,
    #[builder(default)]
    pub properties: CharacteristicProperties,
    #[builder(default)]
    pub permissions: AttributePermissions,
    pub value: Option<Vec<u8>>,
    #[builder(default)]
    #[serde(default)]
    pub descriptors: Vec<MutableDescriptor>,
}

impl MutableCharacteristic {
    pub(crate) fn validate(&self) -> Result<(), PeripheralError> {
        let writable = self.properties.intersects(
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ) || self.permissions.allows_write();
        if self.value.is_some() && writable {
            return Err(PeripheralError::CachedValueMustBeReadOnly {
                identifier: self.identifier,
            });
        }
        Ok(())
    }
}

/// A service published by the local server.
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
pub struct MutableService {
    pub identifier: Identifier,
    #[builder(default = true)]
    pub primary: bool,
    #[builder(default)]
    #[serde(default)]
    pub characteristics: Vec<MutableCharacteristic>,
    /// Identifiers of already published services this one includes.
    #[builder(default)]
    #[serde(default)]
    pub included: Vec<Identifier>,
}

impl MutableService {
    pub(crate) fn characteristic(&self, identifier: Identifier) -> Option<&MutableCharacteristic> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.identifier == identifier)
    }
}

/// Contents of a local advertisement.
#[derive(Debug, Clone, Eq, PartialEq, Default, Builder, Serialize, Deserialize)]
pub struct AdvertisementRequest {
    #[builder(into)]
    pub local_name: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub service_identifiers: Vec<Identifier>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn att_codes_round_trip_through_repr() {
        for result in AttResult::iter() {
            assert_eq!(Some(result), AttResult::from_repr(result.code()));
        }
        assert_eq!(None, AttResult::from_repr(0x12));
    }

    #[rstest]
    #[case(CharacteristicProperties::READ, AttributePermissions::READABLE, true)]
    #[case(CharacteristicProperties::WRITE, AttributePermissions::READABLE, false)]
    #[case(CharacteristicProperties::READ, AttributePermissions::WRITEABLE, false)]
    fn cached_value_requires_read_only(
        #[case] properties: CharacteristicProperties,
        #[case] permissions: AttributePermissions,
        #[case] valid: bool,
    ) {
        let characteristic = MutableCharacteristic::builder()
            .identifier(Identifier::from_u16(0x2a00))
            .properties(properties)
            .permissions(permissions)
            .value(b"gattlink".to_vec())
            .build();
        assert_eq!(valid, characteristic.validate().is_ok());
    }

    #[test]
    fn dynamic_characteristic_may_be_writable() {
        let characteristic = MutableCharacteristic::builder()
            .identifier(Identifier::from_u16(0x2a06))
            .properties(CharacteristicProperties::WRITE)
            .permissions(AttributePermissions::WRITEABLE)
            .build();
        assert_matches!(characteristic.validate(), Ok(()));
    }
}
