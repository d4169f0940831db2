use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::engine::CentralManagerCore;
use super::discovery::DiscoveryState;
use crate::error::RestorationError;
use crate::gatt::shadow::Shadow;
use crate::gatt::{PeripheralKey, Peripheral, ServiceKey};
use crate::identifier::Identifier;
use crate::transport::{
    CharacteristicProperties, ConnectionState, RestoredState, ScanOptions, Transport,
};

const RECORD_FILE_NAME: &str = "restoration.json";

/// Persistable snapshot of a central manager's session.
#[derive(Debug, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct RestorationRecord {
    /// Identifier of the manager that saved the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restoration_identifier: Option<String>,
    #[serde(default)]
    pub scan_services: Option<Vec<Identifier>>,
    #[serde(default)]
    pub scan_options: Option<ScanOptions>,
    #[serde(default)]
    pub peripherals: Vec<PeripheralRecord>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeripheralRecord {
    pub identifier: Identifier,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub identifier: Identifier,
    #[serde(default = "primary_by_default")]
    pub primary: bool,
    #[serde(default)]
    pub included: Vec<ServiceRecord>,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicRecord>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicRecord {
    pub identifier: Identifier,
    #[serde(default)]
    pub properties: CharacteristicProperties,
    #[serde(default)]
    pub descriptors: Vec<Identifier>,
}

fn primary_by_default() -> bool {
    true
}

/// Storage for restoration records.
#[async_trait]
pub trait RestorationStore: Send + Sync {
    async fn load(&self) -> Result<Option<RestorationRecord>, RestorationError>;
    async fn save(&self, record: &RestorationRecord) -> Result<(), RestorationError>;
    async fn clear(&self) -> Result<(), RestorationError>;
}

/// Stores one JSON record on disk.
#[derive(Debug, Clone)]
pub struct FileRestorationStore {
    path: PathBuf,
}

impl FileRestorationStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store under the platform's per-user state directory, keyed by
    /// `restoration_identifier`.
    pub fn for_identifier(restoration_identifier: &str) -> Result<Self, RestorationError> {
        let project_dirs = ProjectDirs::from("dev", "gattlink", "gattlink")
            .ok_or(RestorationError::NoProjectDirectory)?;
        let root = project_dirs
            .state_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| project_dirs.data_local_dir().to_path_buf());
        Ok(Self::new(
            root.join(restoration_identifier).join(RECORD_FILE_NAME),
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RestorationStore for FileRestorationStore {
    async fn load(&self) -> Result<Option<RestorationRecord>, RestorationError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn save(&self, record: &RestorationRecord) -> Result<(), RestorationError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialised = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&self.path, serialised).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), RestorationError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Keeps the record in memory. Useful in tests and for short-lived sessions.
#[derive(Debug, Default)]
pub struct MemoryRestorationStore {
    record: Mutex<Option<RestorationRecord>>,
}

impl MemoryRestorationStore {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<RestorationRecord>> {
        self.record
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RestorationStore for MemoryRestorationStore {
    async fn load(&self) -> Result<Option<RestorationRecord>, RestorationError> {
        Ok(self.slot().clone())
    }

    async fn save(&self, record: &RestorationRecord) -> Result<(), RestorationError> {
        *self.slot() = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), RestorationError> {
        *self.slot() = None;
        Ok(())
    }
}

fn discovered_if(non_empty: bool) -> DiscoveryState {
    if non_empty {
        DiscoveryState::Discovered
    } else {
        DiscoveryState::NotDiscovered
    }
}

impl<T: Transport> CentralManagerCore<T> {
    /// Snapshot of the scan and of every connected or connecting peripheral.
    pub fn export_record(&self) -> RestorationRecord {
        let peripherals = self
            .tree
            .peripheral_keys()
            .iter()
            .filter_map(|key| self.peripheral_record(*key))
            .collect();
        RestorationRecord {
            restoration_identifier: None,
            scan_services: self.scan.active.then(|| self.scan.services.clone()).flatten(),
            scan_options: self.scan.active.then(|| self.scan.options.clone()),
            peripherals,
        }
    }

    fn peripheral_record(&self, key: PeripheralKey) -> Option<PeripheralRecord> {
        let node = self.tree.peripheral(key)?;
        if !matches!(
            node.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return None;
        }
        Some(PeripheralRecord {
            identifier: node.identifier,
            name: node.name.clone(),
            services: node
                .services
                .keys()
                .filter_map(|service| self.service_record(service))
                .collect(),
        })
    }

    fn service_record(&self, key: ServiceKey) -> Option<ServiceRecord> {
        let node = self.tree.service(key)?;
        let characteristics = node
            .characteristics
            .keys()
            .filter_map(|key| {
                let characteristic = self.tree.characteristic(key)?;
                Some(CharacteristicRecord {
                    identifier: characteristic.identifier,
                    properties: characteristic.properties,
                    descriptors: characteristic
                        .descriptors
                        .keys()
                        .filter_map(|key| self.tree.descriptor(key).map(|node| node.identifier))
                        .collect(),
                })
            })
            .collect();
        Some(ServiceRecord {
            identifier: node.identifier,
            primary: node.primary,
            included: node
                .included
                .keys()
                .filter_map(|key| self.service_record(key))
                .collect(),
            characteristics,
        })
    }

    /// Pre-creates detached proxies from a persisted record.
    ///
    /// Peripherals already in the table are left untouched. Returns the
    /// proxies for every record entry.
    #[instrument(skip_all, level = "debug", fields(peripherals = record.peripherals.len()))]
    pub fn restore_record(&mut self, record: &RestorationRecord) -> Vec<Peripheral> {
        let mut restored = Vec::with_capacity(record.peripherals.len());
        for entry in &record.peripherals {
            let key = match self.tree.lookup(entry.identifier) {
                Some(key) => key,
                None => {
                    let key = self.tree.insert_peripheral(entry.identifier, None);
                    if let Some(node) = self.tree.peripheral_mut(key) {
                        node.name.clone_from(&entry.name);
                        node.discovery = discovered_if(!entry.services.is_empty());
                    }
                    for service in &entry.services {
                        self.restore_service(key, None, service);
                    }
                    key
                }
            };
            if let Some(peripheral) = self.tree.peripheral_proxy(key) {
                restored.push(peripheral);
            }
        }
        debug!(count = restored.len(), "restored peripherals from record");
        restored
    }

    fn restore_service(
        &mut self,
        peripheral: PeripheralKey,
        including: Option<ServiceKey>,
        record: &ServiceRecord,
    ) {
        let key = self.tree.insert_service(
            peripheral,
            including,
            record.identifier,
            record.primary,
            Shadow::default(),
        );
        if let Some(node) = self.tree.service_mut(key) {
            node.characteristic_discovery = discovered_if(!record.characteristics.is_empty());
            node.included_discovery = discovered_if(!record.included.is_empty());
        }
        for characteristic in &record.characteristics {
            let Some(characteristic_key) = self.tree.insert_characteristic(
                key,
                characteristic.identifier,
                characteristic.properties,
                Shadow::default(),
            ) else {
                continue;
            };
            for descriptor in &characteristic.descriptors {
                self.tree
                    .insert_descriptor(characteristic_key, *descriptor, Shadow::default());
            }
            if let Some(node) = self.tree.characteristic_mut(characteristic_key) {
                node.descriptor_discovery = discovered_if(!characteristic.descriptors.is_empty());
            }
        }
        for included in &record.included {
            self.restore_service(peripheral, Some(key), included);
        }
    }

    /// Rehydrates the platform's hand-back through the ordinary discovery path
    /// and attaches peripherals that are still connected.
    pub(crate) fn on_will_restore_state(&mut self, restored: RestoredState<T>) {
        let RestoredState {
            peripherals,
            scan_services,
            scan_options,
        } = restored;

        let mut proxies = Vec::with_capacity(peripherals.len());
        for handle in peripherals {
            let platform_state = self.transport.peripheral_state(&handle);
            let (key, _) = self.register(handle.clone(), Default::default(), None);
            if let Some(node) = self.tree.peripheral_mut(key) {
                node.state = platform_state;
            }
            if platform_state == ConnectionState::Connected {
                self.tree.attach_peripheral(&self.transport, key, handle);
            }
            if let Some(peripheral) = self.tree.peripheral_proxy(key) {
                proxies.push(peripheral);
            }
        }

        if scan_services.is_some() || scan_options.is_some() {
            self.scan.active = true;
            self.scan.services = scan_services;
            self.scan.options = scan_options.unwrap_or_default();
        }
        info!(count = proxies.len(), "restored platform session");
        self.notify_central(|delegate| delegate.will_restore_state(&proxies));
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use pretty_assertions::assert_eq;

    use super::*;

    fn unique_temp_path(file_name: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("gattlink-{file_name}-{suffix}.json"))
    }

    fn record() -> RestorationRecord {
        RestorationRecord {
            restoration_identifier: Some("strap".to_string()),
            scan_services: Some(vec![Identifier::from_u16(0x180d)]),
            scan_options: Some(ScanOptions::default()),
            peripherals: vec![PeripheralRecord {
                identifier: Identifier::from_u16(0xfee0),
                name: Some("Strap".to_string()),
                services: vec![ServiceRecord {
                    identifier: Identifier::from_u16(0x180d),
                    primary: true,
                    included: Vec::new(),
                    characteristics: vec![CharacteristicRecord {
                        identifier: Identifier::from_u16(0x2a37),
                        properties: CharacteristicProperties::NOTIFY,
                        descriptors: vec![Identifier::from_u16(0x2902)],
                    }],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn file_store_round_trips_record() -> anyhow::Result<()> {
        let path = unique_temp_path("restoration");
        let store = FileRestorationStore::new(path.clone());

        assert_eq!(None, store.load().await?);
        store.save(&record()).await?;
        assert_eq!(Some(record()), store.load().await?);

        store.clear().await?;
        assert_eq!(None, store.load().await?);
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn file_store_rejects_invalid_json() -> anyhow::Result<()> {
        let path = unique_temp_path("restoration-invalid");
        tokio::fs::write(&path, b"not json").await?;

        let loaded = FileRestorationStore::new(path.clone()).load().await;
        assert!(matches!(loaded, Err(RestorationError::Json(_))));

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_round_trips_record() -> anyhow::Result<()> {
        let store = MemoryRestorationStore::default();
        store.save(&record()).await?;
        assert_eq!(Some(record()), store.load().await?);
        store.clear().await?;
        assert_eq!(None, store.load().await?);
        Ok(())
    }

    #[test]
    fn record_deserialises_sparse_json() -> anyhow::Result<()> {
        let record: RestorationRecord = serde_json::from_str(
            r#"{"peripherals":[{"identifier":"0000fee0-0000-1000-8000-00805f9b34fb","services":[{"identifier":"180D"}]}]}"#,
        )?;
        assert_eq!(1, record.peripherals.len());
        assert!(record.peripherals[0].services[0].primary);
        assert_eq!(None, record.scan_options);
        assert_eq!(None, record.restoration_identifier);
        Ok(())
    }
}
