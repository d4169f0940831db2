use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;
use strum_macros::{Display, EnumIter, EnumString};
use tracing::trace;

use crate::identifier::Identifier;

/// Keys of the platform's advertisement key/value map.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumString, EnumIter)]
pub enum AdvertisementKey {
    #[strum(serialize = "kCBAdvDataLocalName")]
    LocalName,
    #[strum(serialize = "kCBAdvDataManufacturerData")]
    ManufacturerData,
    #[strum(serialize = "kCBAdvDataServiceData")]
    ServiceData,
    #[strum(serialize = "kCBAdvDataServiceUUIDs")]
    ServiceIdentifiers,
    #[strum(serialize = "kCBAdvDataHashedServiceUUIDs")]
    OverflowServiceIdentifiers,
    #[strum(serialize = "kCBAdvDataSolicitedServiceUUIDs")]
    SolicitedServiceIdentifiers,
    #[strum(serialize = "kCBAdvDataTxPowerLevel")]
    TxPowerLevel,
    #[strum(serialize = "kCBAdvDataIsConnectable")]
    IsConnectable,
}

/// One value of the platform's advertisement key/value map.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AdvertisementValue {
    Text(String),
    Bytes(Vec<u8>),
    Integer(i64),
    Flag(bool),
    Identifiers(Vec<Identifier>),
    ServiceData(HashMap<Identifier, Vec<u8>>),
}

/// Decoded advertisement payload of one peripheral.
///
/// ```
/// use gattlink::{Advertisement, Identifier};
///
/// let advertisement = Advertisement::builder()
///     .local_name("Thermometer".to_string())
///     .service_identifiers(vec![Identifier::from_u16(0x1809)])
///     .build();
/// let bytes = advertisement.to_bytes()?;
/// assert_eq!(advertisement, Advertisement::from_bytes(&bytes)?);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize, bon::Builder)]
pub struct Advertisement {
    #[serde(default)]
    local_name: Option<String>,
    #[serde_as(as = "Option<Hex>")]
    manufacturer_data: Option<Vec<u8>>,
    #[serde_as(as = "BTreeMap<_, Hex>")]
    #[serde(default)]
    #[builder(default)]
    service_data: BTreeMap<Identifier, Vec<u8>>,
    #[serde(default)]
    #[builder(default)]
    service_identifiers: Vec<Identifier>,
    #[serde(default)]
    #[builder(default)]
    overflow_service_identifiers: Vec<Identifier>,
    #[serde(default)]
    #[builder(default)]
    solicited_service_identifiers: Vec<Identifier>,
    #[serde(default)]
    tx_power_level: Option<i16>,
    #[serde(default)]
    is_connectable: Option<bool>,
}

impl Advertisement {
    /// Decodes the platform's key/value map, skipping unknown keys and values
    /// of the wrong shape.
    #[must_use]
    pub fn from_raw(raw: &HashMap<String, AdvertisementValue>) -> Self {
        let mut advertisement = Self::default();
        for (raw_key, value) in raw {
            let Ok(key) = AdvertisementKey::from_str(raw_key) else {
                trace!(key = %raw_key, "ignoring unknown advertisement key");
                continue;
            };
            if !advertisement.apply(key, value.clone()) {
                trace!(%key, ?value, "ignoring advertisement value of unexpected shape");
            }
        }
        advertisement
    }

    fn apply(&mut self, key: AdvertisementKey, value: AdvertisementValue) -> bool {
        match (key, value) {
            (AdvertisementKey::LocalName, AdvertisementValue::Text(name)) => {
                self.local_name = Some(name);
            }
            (AdvertisementKey::ManufacturerData, AdvertisementValue::Bytes(data)) => {
                self.manufacturer_data = Some(data);
            }
            (AdvertisementKey::ServiceData, AdvertisementValue::ServiceData(data)) => {
                self.service_data = data.into_iter().collect();
            }
            (AdvertisementKey::ServiceIdentifiers, AdvertisementValue::Identifiers(ids)) => {
                self.service_identifiers = ids;
            }
            (AdvertisementKey::OverflowServiceIdentifiers, AdvertisementValue::Identifiers(ids)) => {
                self.overflow_service_identifiers = ids;
            }
            (AdvertisementKey::SolicitedServiceIdentifiers, AdvertisementValue::Identifiers(ids)) => {
                self.solicited_service_identifiers = ids;
            }
            (AdvertisementKey::TxPowerLevel, AdvertisementValue::Integer(level)) => {
                let Ok(level) = i16::try_from(level) else {
                    return false;
                };
                self.tx_power_level = Some(level);
            }
            (AdvertisementKey::IsConnectable, AdvertisementValue::Flag(connectable)) => {
                self.is_connectable = Some(connectable);
            }
            (AdvertisementKey::IsConnectable, AdvertisementValue::Integer(connectable)) => {
                self.is_connectable = Some(connectable != 0);
            }
            _ => return false,
        }
        true
    }

    /// Folds a newer advertisement (for example a scan response) into this one.
    /// Fields present in `newer` win; service data maps are merged per key.
    pub fn merge(&mut self, newer: Advertisement) {
        let Advertisement {
            local_name,
            manufacturer_data,
            service_data,
            service_identifiers,
            overflow_service_identifiers,
            solicited_service_identifiers,
            tx_power_level,
            is_connectable,
        } = newer;

        if local_name.is_some() {
            self.local_name = local_name;
        }
        if manufacturer_data.is_some() {
            self.manufacturer_data = manufacturer_data;
        }
        self.service_data.extend(service_data);
        merge_identifiers(&mut self.service_identifiers, service_identifiers);
        merge_identifiers(
            &mut self.overflow_service_identifiers,
            overflow_service_identifiers,
        );
        merge_identifiers(
            &mut self.solicited_service_identifiers,
            solicited_service_identifiers,
        );
        if tx_power_level.is_some() {
            self.tx_power_level = tx_power_level;
        }
        if is_connectable.is_some() {
            self.is_connectable = is_connectable;
        }
    }

    /// Serializes the record for persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Restores a record written by [`Advertisement::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a serialized advertisement.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    #[must_use]
    pub fn manufacturer_data(&self) -> Option<&[u8]> {
        self.manufacturer_data.as_deref()
    }

    /// Returns the service data advertised for one service.
    #[must_use]
    pub fn service_data(&self, service: Identifier) -> Option<&[u8]> {
        self.service_data.get(&service).map(Vec::as_slice)
    }

    /// Returns every service data entry, ordered by identifier.
    #[must_use]
    pub fn all_service_data(&self) -> &BTreeMap<Identifier, Vec<u8>> {
        &self.service_data
    }

    #[must_use]
    pub fn service_identifiers(&self) -> &[Identifier] {
        &self.service_identifiers
    }

    #[must_use]
    pub fn overflow_service_identifiers(&self) -> &[Identifier] {
        &self.overflow_service_identifiers
    }

    #[must_use]
    pub fn solicited_service_identifiers(&self) -> &[Identifier] {
        &self.solicited_service_identifiers
    }

    #[must_use]
    pub fn tx_power_level(&self) -> Option<i16> {
        self.tx_power_level
    }

    #[must_use]
    pub fn is_connectable(&self) -> Option<bool> {
        self.is_connectable
    }

    /// Returns whether the advertisement names `service` in any identifier list.
    #[must_use]
    pub fn advertises(&self, service: Identifier) -> bool {
        self.service_identifiers.contains(&service)
            || self.overflow_service_identifiers.contains(&service)
            || self.service_data.contains_key(&service)
    }
}

fn merge_identifiers(current: &mut Vec<Identifier>, newer: Vec<Identifier>) {
    for identifier in newer {
        if !current.contains(&identifier) {
            current.push(identifier);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn full() -> Advertisement {
        Advertisement::builder()
            .local_name("Sensor".to_string())
            .manufacturer_data(vec![0x4C, 0x00, 0x02])
            .service_data(BTreeMap::from([
                (Identifier::from_u16(0x180F), vec![0x64]),
                (Identifier::from_u16(0xFEAA), vec![0x10, 0x00, 0xFF]),
            ]))
            .service_identifiers(vec![Identifier::from_u16(0x180D)])
            .overflow_service_identifiers(vec![Identifier::from_u16(0x1816)])
            .solicited_service_identifiers(vec![Identifier::from_u16(0x1812)])
            .tx_power_level(-8)
            .is_connectable(true)
            .build()
    }

    #[rstest]
    #[case(Advertisement::default())]
    #[case(full())]
    fn byte_round_trip_preserves_every_field(#[case] advertisement: Advertisement) {
        let bytes = advertisement.to_bytes().expect("advertisement serializes");
        let restored = Advertisement::from_bytes(&bytes).expect("advertisement deserializes");
        assert_eq!(advertisement, restored);
    }

    #[test]
    fn byte_form_encodes_payloads_as_hex() {
        let advertisement = Advertisement::builder()
            .manufacturer_data(vec![0xDE, 0xAD])
            .build();
        let bytes = advertisement.to_bytes().expect("advertisement serializes");
        let text = String::from_utf8(bytes).expect("json is utf-8");
        assert!(text.contains("\"manufacturer_data\":\"dead\""), "{text}");
    }

    #[test]
    fn from_raw_decodes_named_fields_and_skips_unknown() {
        let raw = HashMap::from([
            (
                "kCBAdvDataLocalName".to_string(),
                AdvertisementValue::Text("Kettle".to_string()),
            ),
            (
                "kCBAdvDataTxPowerLevel".to_string(),
                AdvertisementValue::Integer(4),
            ),
            (
                "kCBAdvDataIsConnectable".to_string(),
                AdvertisementValue::Integer(1),
            ),
            (
                "kCBAdvDataServiceUUIDs".to_string(),
                AdvertisementValue::Identifiers(vec![Identifier::from_u16(0x1809)]),
            ),
            ("kCBAdvDataChannel".to_string(), AdvertisementValue::Integer(37)),
            (
                "kCBAdvDataManufacturerData".to_string(),
                AdvertisementValue::Text("not bytes".to_string()),
            ),
        ]);

        let advertisement = Advertisement::from_raw(&raw);

        assert_eq!(Some("Kettle"), advertisement.local_name());
        assert_eq!(Some(4), advertisement.tx_power_level());
        assert_eq!(Some(true), advertisement.is_connectable());
        assert_eq!(None, advertisement.manufacturer_data());
        assert!(advertisement.advertises(Identifier::from_u16(0x1809)));
    }

    #[test]
    fn merge_prefers_newer_fields_and_unions_lists() {
        let mut current = Advertisement::builder()
            .local_name("Old".to_string())
            .service_identifiers(vec![Identifier::from_u16(0x180D)])
            .tx_power_level(0)
            .build();
        let newer = Advertisement::builder()
            .service_identifiers(vec![
                Identifier::from_u16(0x180D),
                Identifier::from_u16(0x180F),
            ])
            .tx_power_level(-4)
            .build();

        current.merge(newer);

        assert_eq!(Some("Old"), current.local_name());
        assert_eq!(Some(-4), current.tx_power_level());
        assert_eq!(
            &[Identifier::from_u16(0x180D), Identifier::from_u16(0x180F)],
            current.service_identifiers()
        );
    }
}
