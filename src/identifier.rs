use std::fmt;
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use uuid::Uuid;

/// The Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Mask selecting every bit of the base UUID outside the 32-bit short-form slot.
const BASE_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;

/// Errors returned when parsing an [`Identifier`] from text.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum IdentifierParseError {
    #[error("identifier `{value}` must contain 4, 8 or 32 hexadecimal digits")]
    InvalidLength { value: String },
    #[error("identifier `{value}` contains non-hexadecimal characters")]
    InvalidDigit { value: String },
}

/// A 128-bit identifier keying every entity in a GATT tree.
///
/// Equality and hashing are bit-wise. SIG-assigned 16-bit and 32-bit short
/// forms are expanded against the Bluetooth base UUID.
///
/// ```
/// use gattlink::Identifier;
///
/// let heart_rate = Identifier::from_u16(0x180D);
/// assert_eq!("0000180d-0000-1000-8000-00805f9b34fb", heart_rate.to_string());
/// assert_eq!(Some(0x180D), heart_rate.as_u16());
/// # Ok::<(), gattlink::IdentifierParseError>(())
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, SerializeDisplay, DeserializeFromStr)]
pub struct Identifier(u128);

impl Identifier {
    /// Creates an identifier from its 16 raw bytes in big-endian order.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    /// Creates an identifier from a 128-bit integer.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Expands a SIG-assigned 16-bit short form.
    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        Self::from_u32(value as u32)
    }

    /// Expands a SIG-assigned 32-bit short form.
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(BASE_UUID | ((value as u128) << 96))
    }

    /// Returns the raw bytes in big-endian order.
    #[must_use]
    pub const fn as_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Returns the identifier as a 128-bit integer.
    #[must_use]
    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Returns the 32-bit short form when the identifier is SIG-assigned.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        if self.0 & BASE_MASK == BASE_UUID {
            Some((self.0 >> 96) as u32)
        } else {
            None
        }
    }

    /// Returns the 16-bit short form when the identifier is SIG-assigned and fits.
    #[must_use]
    pub fn as_u16(&self) -> Option<u16> {
        self.as_u32().and_then(|value| u16::try_from(value).ok())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_u128(self.0).hyphenated(), f)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(short) = self.as_u16() {
            write!(f, "Identifier(0x{short:04X})")
        } else if let Some(short) = self.as_u32() {
            write!(f, "Identifier(0x{short:08X})")
        } else {
            write!(f, "Identifier({self})")
        }
    }
}

impl FromStr for Identifier {
    type Err = IdentifierParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits: String = value.chars().filter(|c| *c != '-').collect();
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdentifierParseError::InvalidDigit {
                value: value.to_string(),
            });
        }

        let invalid_digit = || IdentifierParseError::InvalidDigit {
            value: value.to_string(),
        };
        match digits.len() {
            4 => u16::from_str_radix(&digits, 16)
                .map(Self::from_u16)
                .map_err(|_| invalid_digit()),
            8 => u32::from_str_radix(&digits, 16)
                .map(Self::from_u32)
                .map_err(|_| invalid_digit()),
            32 => u128::from_str_radix(&digits, 16)
                .map(Self)
                .map_err(|_| invalid_digit()),
            _ => Err(IdentifierParseError::InvalidLength {
                value: value.to_string(),
            }),
        }
    }
}

impl From<Uuid> for Identifier {
    fn from(value: Uuid) -> Self {
        Self(value.as_u128())
    }
}

impl From<Identifier> for Uuid {
    fn from(value: Identifier) -> Self {
        Uuid::from_u128(value.0)
    }
}

impl From<u16> for Identifier {
    fn from(value: u16) -> Self {
        Self::from_u16(value)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("180D", Identifier::from_u16(0x180D))]
    #[case("0000180d", Identifier::from_u16(0x180D))]
    #[case("0000180d-0000-1000-8000-00805f9b34fb", Identifier::from_u16(0x180D))]
    #[case(
        "6E400001-B5A3-F393-E0A9-E50E24DCCA9E",
        Identifier::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e)
    )]
    fn parse_accepts_short_and_long_forms(#[case] raw: &str, #[case] expected: Identifier) {
        let parsed: Identifier = raw.parse().expect("identifier should parse");
        assert_eq!(expected, parsed);
    }

    #[test]
    fn parse_rejects_bad_length() {
        assert_matches!(
            "12345".parse::<Identifier>(),
            Err(IdentifierParseError::InvalidLength { .. })
        );
    }

    #[test]
    fn parse_rejects_non_hex() {
        assert_matches!(
            "18zz".parse::<Identifier>(),
            Err(IdentifierParseError::InvalidDigit { .. })
        );
    }

    #[test]
    fn short_forms_only_exist_for_sig_assigned_values() {
        let custom = Identifier::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
        assert_eq!(None, custom.as_u16());
        assert_eq!(None, custom.as_u32());
        assert_eq!(Some(0x1234_5678), Identifier::from_u32(0x1234_5678).as_u32());
        assert_eq!(None, Identifier::from_u32(0x1234_5678).as_u16());
    }

    #[test]
    fn byte_form_round_trips() {
        let identifier = Identifier::from_u16(0x2A37);
        assert_eq!(identifier, Identifier::from_bytes(identifier.as_bytes()));
        assert_eq!(0x00, identifier.as_bytes()[0]);
        assert_eq!(0x2A, identifier.as_bytes()[2]);
    }

    #[test]
    fn display_is_canonical_lowercase() {
        insta::assert_snapshot!(
            Identifier::from_u16(0x2A37).to_string(),
            @"00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn debug_prefers_short_form() {
        assert_eq!("Identifier(0x2A37)", format!("{:?}", Identifier::from_u16(0x2A37)));
    }

    #[test]
    fn serde_uses_canonical_string() {
        let encoded =
            serde_json::to_string(&Identifier::from_u16(0x180F)).expect("identifier serializes");
        assert_eq!("\"0000180f-0000-1000-8000-00805f9b34fb\"", encoded);
    }
}
