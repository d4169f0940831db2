use assert_matches::assert_matches;
use gattlink::fake::{FakeCharacteristic, FakeCommand, FakeDevice, FakeService, FakeTransport};
use gattlink::{
    CentralManager, CentralManagerCore, CharacteristicProperties, ConnectionState, DiscoveryPolicy,
    EventForwarder, GattError, GattEvent, Identifier, ManagerConfig, MemoryRestorationStore,
    PeripheralRecord, RestorationRecord, RestorationStore, ScanOptions,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

const LOCK: Identifier = Identifier::from_u128(0x3f2c_0001_8b1e_4d4a_9c55_7e0b_d2a4_61f0);
const LOCK_SERVICE: Identifier = Identifier::from_u128(0x3f2c_1000_8b1e_4d4a_9c55_7e0b_d2a4_61f0);
const LOCK_STATE: Identifier = Identifier::from_u128(0x3f2c_1001_8b1e_4d4a_9c55_7e0b_d2a4_61f0);

fn lock() -> FakeDevice {
    FakeDevice::builder()
        .identifier(LOCK)
        .name("Front door")
        .services(vec![FakeService::new(LOCK_SERVICE).characteristic(
            FakeCharacteristic::new(
                LOCK_STATE,
                CharacteristicProperties::READ | CharacteristicProperties::INDICATE,
            )
            .value([0x01]),
        )])
        .build()
}

fn connected_core(fake: &FakeTransport) -> anyhow::Result<CentralManagerCore<FakeTransport>> {
    let mut core = CentralManagerCore::new(fake.clone(), DiscoveryPolicy::full());
    core.start_scanning(None, ScanOptions::default(), None);
    fake.pump(&mut core);
    let peripheral = core.peripheral(LOCK).expect("lock registered by the scan");
    core.connect(peripheral, None)?;
    fake.pump(&mut core);
    Ok(core)
}

fn spawn_with_identifier(
    fake: &FakeTransport,
    identifier: Option<&str>,
) -> CentralManager<FakeTransport> {
    CentralManager::spawn(
        ManagerConfig::builder()
            .maybe_restoration_identifier(identifier.map(str::to_owned))
            .build(),
        |sink| {
            fake.attach_sink(sink);
            fake.clone()
        },
    )
}

#[test]
fn exported_record_describes_connected_tree_and_scan() -> anyhow::Result<()> {
    let fake = FakeTransport::new();
    fake.add_device(lock());
    let core = connected_core(&fake)?;

    let record = core.export_record();

    assert_eq!(None, record.scan_services);
    assert_eq!(Some(ScanOptions::default()), record.scan_options);
    assert_eq!(1, record.peripherals.len());
    let entry = &record.peripherals[0];
    assert_eq!(LOCK, entry.identifier);
    assert_eq!(Some("Front door"), entry.name.as_deref());
    assert_eq!(LOCK_SERVICE, entry.services[0].identifier);
    assert_eq!(
        LOCK_STATE,
        entry.services[0].characteristics[0].identifier
    );

    let serialised = serde_json::to_string(&record)?;
    let parsed: RestorationRecord = serde_json::from_str(&serialised)?;
    assert_eq!(record, parsed);
    Ok(())
}

#[test]
fn restored_proxies_are_detached_until_reconnected() -> anyhow::Result<()> {
    let source = FakeTransport::new();
    source.add_device(lock());
    let record = connected_core(&source)?.export_record();

    let fake = FakeTransport::new();
    fake.add_device(lock());
    fake.mark_all_discovered(LOCK);
    let mut core = CentralManagerCore::new(fake.clone(), DiscoveryPolicy::full());

    let restored = core.restore_record(&record);
    let peripheral = restored[0];
    let service = core
        .service(peripheral, LOCK_SERVICE)
        .expect("service restored from record");
    let state = core
        .characteristic(service, LOCK_STATE)
        .expect("characteristic restored from record");

    assert_eq!(
        Some(ConnectionState::Disconnected),
        core.connection_state(peripheral)
    );
    assert_matches!(core.read_value(state), Err(GattError::Unreachable { .. }));

    core.connect(peripheral, None)?;
    fake.pump(&mut core);

    assert_eq!(vec![service], core.services(peripheral));
    assert_eq!(vec![FakeCommand::Connect { device: LOCK }], fake.commands());
    core.read_value(state)?;
    fake.pump(&mut core);
    assert_eq!(Some(vec![0x01]), core.value(state));
    Ok(())
}

#[test]
fn restored_tree_is_rediscovered_when_platform_cache_is_empty() -> anyhow::Result<()> {
    let source = FakeTransport::new();
    source.add_device(lock());
    let record = connected_core(&source)?.export_record();

    let fake = FakeTransport::new();
    fake.add_device(lock());
    let mut core = CentralManagerCore::new(fake.clone(), DiscoveryPolicy::full());
    let peripheral = core.restore_record(&record)[0];
    let service = core
        .service(peripheral, LOCK_SERVICE)
        .expect("service restored from record");
    let state = core
        .characteristic(service, LOCK_STATE)
        .expect("characteristic restored from record");

    core.connect(peripheral, None)?;
    fake.pump(&mut core);

    assert_eq!(vec![service], core.services(peripheral));
    assert_eq!(vec![state], core.characteristics(service));
    assert_eq!(
        true,
        fake.commands()
            .iter()
            .any(|command| matches!(command, FakeCommand::DiscoverServices { .. }))
    );
    core.read_value(state)?;
    fake.pump(&mut core);
    assert_eq!(Some(vec![0x01]), core.value(state));
    Ok(())
}

#[test]
fn restoring_a_known_peripheral_keeps_existing_record() -> anyhow::Result<()> {
    let fake = FakeTransport::new();
    fake.add_device(lock());
    let mut core = connected_core(&fake)?;
    let record = core.export_record();
    let before = core.peripherals();

    let restored = core.restore_record(&record);

    assert_eq!(before, restored);
    assert_eq!(before, core.peripherals());
    Ok(())
}

#[test]
fn platform_hand_back_attaches_connected_peripherals() -> anyhow::Result<()> {
    let fake = FakeTransport::new();
    fake.add_device(lock());
    fake.simulate_connection(LOCK);
    fake.mark_all_discovered(LOCK);
    fake.restore_state(&[LOCK], Some(vec![LOCK_SERVICE]));

    let mut core = CentralManagerCore::new(fake.clone(), DiscoveryPolicy::manual());
    let (sender, mut events) = mpsc::unbounded_channel();
    core.set_delegate(Some(Box::new(EventForwarder::new(sender))));
    fake.pump(&mut core);

    let peripheral = core.peripheral(LOCK).expect("lock restored by the platform");
    assert_eq!(
        Some(GattEvent::WillRestoreState(vec![peripheral])),
        events.try_recv().ok()
    );
    assert_eq!(
        Some(ConnectionState::Connected),
        core.connection_state(peripheral)
    );
    assert_eq!(true, core.is_scanning());

    core.discover_services(peripheral, None)?;
    fake.pump(&mut core);
    assert_eq!(
        vec![LOCK_SERVICE],
        core.services(peripheral)
            .iter()
            .map(|service| service.identifier())
            .collect::<Vec<_>>()
    );
    Ok(())
}

#[tokio::test]
async fn manager_saves_and_restores_session_through_store() -> anyhow::Result<()> {
    let fake = FakeTransport::new();
    fake.add_device(lock());
    let store = MemoryRestorationStore::default();

    let manager = CentralManager::spawn(
        ManagerConfig::builder()
            .default_policy(DiscoveryPolicy::full())
            .restoration_identifier("front-door".to_owned())
            .build(),
        |sink| {
            fake.attach_sink(sink);
            fake.clone()
        },
    );
    assert_eq!(Some("front-door"), manager.restoration_identifier());
    manager
        .start_scanning(None, ScanOptions::default(), None)
        .await?;
    let peripheral = manager
        .peripheral(LOCK)
        .await?
        .expect("lock registered by the scan");
    manager.connect(peripheral, None).await?;
    manager.save_session(&store).await?;
    manager.shutdown().await;

    let saved = store.load().await?.expect("session saved");
    assert_eq!(Some("front-door"), saved.restoration_identifier.as_deref());
    assert_eq!(LOCK, saved.peripherals[0].identifier);

    let fresh = FakeTransport::new();
    fresh.add_device(lock());
    let restored_manager = spawn_with_identifier(&fresh, Some("front-door"));
    let restored = restored_manager.restore_session(&store).await?;

    assert_eq!(1, restored.len());
    assert_eq!(LOCK, restored[0].identifier());
    assert_eq!(
        Some(ConnectionState::Disconnected),
        restored_manager.connection_state(restored[0]).await?
    );
    restored_manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn record_saved_under_another_identifier_is_ignored() -> anyhow::Result<()> {
    let store = MemoryRestorationStore::default();
    store
        .save(&RestorationRecord {
            restoration_identifier: Some("back-door".to_owned()),
            peripherals: vec![PeripheralRecord {
                identifier: LOCK,
                name: None,
                services: Vec::new(),
            }],
            ..RestorationRecord::default()
        })
        .await?;
    let fake = FakeTransport::new();
    let manager = spawn_with_identifier(&fake, Some("front-door"));

    let restored = manager.restore_session(&store).await?;

    assert_eq!(Vec::<gattlink::Peripheral>::new(), restored);
    assert_eq!(Vec::<gattlink::Peripheral>::new(), manager.peripherals().await?);
    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn manager_without_identifier_neither_saves_nor_restores() -> anyhow::Result<()> {
    let fake = FakeTransport::new();
    fake.add_device(lock());
    let store = MemoryRestorationStore::default();
    let saved = RestorationRecord {
        peripherals: vec![PeripheralRecord {
            identifier: LOCK,
            name: None,
            services: Vec::new(),
        }],
        ..RestorationRecord::default()
    };
    store.save(&saved).await?;
    let manager = spawn_with_identifier(&fake, None);
    assert_eq!(None, manager.restoration_store()?.map(|store| store.path().to_owned()));

    assert_eq!(
        Vec::<gattlink::Peripheral>::new(),
        manager.restore_session(&store).await?
    );
    manager
        .start_scanning(None, ScanOptions::default(), None)
        .await?;
    manager.save_session(&store).await?;

    assert_eq!(Some(saved), store.load().await?);
    manager.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn restoring_from_empty_store_yields_nothing() -> anyhow::Result<()> {
    let fake = FakeTransport::new();
    let manager = spawn_with_identifier(&fake, Some("front-door"));

    let restored = manager
        .restore_session(&MemoryRestorationStore::default())
        .await?;

    assert_eq!(Vec::<gattlink::Peripheral>::new(), restored);
    manager.shutdown().await;
    Ok(())
}
