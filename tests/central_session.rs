use assert_matches::assert_matches;
use gattlink::fake::{
    FakeCharacteristic, FakeCommand, FakeDescriptor, FakeDevice, FakeOperation, FakeService,
    FakeTransport,
};
use gattlink::{
    Advertisement, CentralManagerCore, CharacteristicProperties, ConnectionState, DiscoveryPolicy,
    DiscoveryState, EventForwarder, GattError, GattEvent, Identifier, ManagerState, Peripheral, ScanOptions,
    TransportError, WriteType,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::mpsc::{self, UnboundedReceiver};

const MONITOR: Identifier = Identifier::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
const HEART_RATE: Identifier = Identifier::from_u16(0x180D);
const BATTERY: Identifier = Identifier::from_u16(0x180F);
const MEASUREMENT: Identifier = Identifier::from_u16(0x2A37);
const CONTROL_POINT: Identifier = Identifier::from_u16(0x2A39);
const BATTERY_LEVEL: Identifier = Identifier::from_u16(0x2A19);
const CLIENT_CONFIGURATION: Identifier = Identifier::from_u16(0x2902);

fn monitor() -> FakeDevice {
    FakeDevice::builder()
        .identifier(MONITOR)
        .name("Pulse")
        .advertisement(
            Advertisement::builder()
                .local_name("Pulse".to_owned())
                .service_identifiers(vec![HEART_RATE])
                .build(),
        )
        .services(vec![
            FakeService::new(HEART_RATE)
                .characteristic(
                    FakeCharacteristic::new(
                        MEASUREMENT,
                        CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                    )
                    .value([0x06, 0x48])
                    .descriptor(FakeDescriptor::new(CLIENT_CONFIGURATION, [0x00, 0x00])),
                )
                .characteristic(FakeCharacteristic::new(
                    CONTROL_POINT,
                    CharacteristicProperties::WRITE,
                )),
            FakeService::new(BATTERY).characteristic(
                FakeCharacteristic::new(BATTERY_LEVEL, CharacteristicProperties::READ).value([0x5a]),
            ),
        ])
        .build()
}

struct Session {
    fake: FakeTransport,
    core: CentralManagerCore<FakeTransport>,
    events: UnboundedReceiver<GattEvent>,
}

impl Session {
    fn new(policy: DiscoveryPolicy) -> Self {
        let fake = FakeTransport::new();
        fake.add_device(monitor());
        let mut core = CentralManagerCore::new(fake.clone(), policy);
        let (sender, events) = mpsc::unbounded_channel();
        let forwarder = EventForwarder::new(sender);
        core.set_delegate(Some(Box::new(forwarder.clone())));
        core.set_default_peripheral_delegate(Some(Box::new(forwarder)));
        Self { fake, core, events }
    }

    fn pump(&mut self) -> usize {
        self.fake.pump(&mut self.core)
    }

    fn drain(&mut self) -> Vec<GattEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn discover(&mut self) -> Peripheral {
        self.core.start_scanning(None, ScanOptions::default(), None);
        self.pump();
        self.core.stop_scanning();
        self.core
            .peripheral(MONITOR)
            .expect("monitor should be registered by the scan")
    }

    fn connect(&mut self) -> anyhow::Result<Peripheral> {
        let peripheral = self.discover();
        self.core.connect(peripheral, None)?;
        self.pump();
        Ok(peripheral)
    }

    fn connect_and_walk(&mut self) -> anyhow::Result<Peripheral> {
        let peripheral = self.connect()?;
        self.core.discover_services(peripheral, None)?;
        self.pump();
        for service in self.core.services(peripheral) {
            self.core.discover_characteristics(service, None)?;
            self.pump();
            for characteristic in self.core.characteristics(service) {
                self.core.discover_descriptors(characteristic)?;
                self.pump();
            }
        }
        self.drain();
        self.fake.clear_commands();
        Ok(peripheral)
    }
}

#[test]
fn scan_registers_advertising_peripherals_with_name() {
    let mut session = Session::new(DiscoveryPolicy::manual());

    let peripheral = session.discover();
    let info = session
        .core
        .peripheral_info(peripheral)
        .expect("registered peripheral has a snapshot");

    assert_eq!(Some("Pulse"), info.name.as_deref());
    assert_eq!(Some(-50), info.rssi);
    assert_matches!(
        session.drain().as_slice(),
        [GattEvent::Discovered { rssi: -50, .. }, GattEvent::ScanStopped]
    );
}

#[test]
fn connect_is_a_no_op_while_connecting_or_connected() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.discover();
    session.drain();
    session.fake.clear_commands();
    session.fake.set_auto_respond(false);

    session.core.connect(peripheral, None)?;
    session.core.connect(peripheral, None)?;
    assert_eq!(
        Some(ConnectionState::Connecting),
        session.core.connection_state(peripheral)
    );

    session.fake.complete_connection(MONITOR);
    session.pump();
    session.core.connect(peripheral, None)?;
    session.pump();

    assert_eq!(
        vec![FakeCommand::Connect { device: MONITOR }],
        session.fake.commands()
    );
    assert_eq!(vec![GattEvent::Connected(peripheral)], session.drain());
    assert_eq!(
        Some(ConnectionState::Connected),
        session.core.connection_state(peripheral)
    );

    Ok(())
}

#[test]
fn late_connection_failure_leaves_live_connection_alone() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect()?;
    let handle = session
        .fake
        .handle_for(MONITOR)
        .expect("monitor handle available");
    session.drain();

    session
        .core
        .handle_event(gattlink::TransportEvent::FailedToConnect {
            peripheral: handle,
            error: TransportError::new(0x3e, "timeout"),
        });

    assert_eq!(
        Some(ConnectionState::Connected),
        session.core.connection_state(peripheral)
    );
    assert_eq!(Vec::<GattEvent>::new(), session.drain());
    Ok(())
}

#[test]
fn failed_connection_leaves_peripheral_disconnected() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    session
        .fake
        .fail_next(FakeOperation::Connect, TransportError::new(0x3e, "timeout"));
    let peripheral = session.discover();
    session.drain();

    session.core.connect(peripheral, None)?;
    session.pump();

    assert_eq!(
        Some(ConnectionState::Disconnected),
        session.core.connection_state(peripheral)
    );
    assert_matches!(
        session.drain().as_slice(),
        [GattEvent::FailedToConnect { error: GattError::Transport(error), .. }]
            if error.code() == 0x3e
    );

    Ok(())
}

#[test]
fn empty_service_filter_never_reaches_the_transport() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect()?;
    session.drain();
    session.fake.clear_commands();
    let before = session.core.peripheral_info(peripheral);

    session.core.discover_services(peripheral, Some(Vec::new()))?;
    session.pump();

    assert_eq!(Vec::<FakeCommand>::new(), session.fake.commands());
    assert_eq!(Vec::<GattEvent>::new(), session.drain());
    assert_eq!(before, session.core.peripheral_info(peripheral));
    assert_eq!(
        Some(DiscoveryState::NotDiscovered),
        before.map(|info| info.discovery)
    );
    Ok(())
}

#[test]
fn empty_service_level_filters_never_reach_the_transport() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect()?;
    session.core.discover_services(peripheral, None)?;
    session.pump();
    let heart_rate = session
        .core
        .service(peripheral, HEART_RATE)
        .expect("heart rate service discovered");
    session.drain();
    session.fake.clear_commands();
    let before = session.core.service_info(heart_rate);

    session
        .core
        .discover_characteristics(heart_rate, Some(Vec::new()))?;
    session
        .core
        .discover_included_services(heart_rate, Some(Vec::new()))?;
    session.pump();

    assert_eq!(Vec::<FakeCommand>::new(), session.fake.commands());
    assert_eq!(Vec::<GattEvent>::new(), session.drain());
    assert_eq!(before, session.core.service_info(heart_rate));
    assert_matches!(
        before,
        Some(info) if info.characteristic_discovery == DiscoveryState::NotDiscovered
            && info.included_discovery == DiscoveryState::NotDiscovered
    );
    Ok(())
}

#[test]
fn service_filter_limits_discovered_services() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect()?;

    session
        .core
        .discover_services(peripheral, Some(vec![BATTERY]))?;
    session.pump();

    let identifiers: Vec<_> = session
        .core
        .services(peripheral)
        .iter()
        .map(|service| service.identifier())
        .collect();
    assert_eq!(vec![BATTERY], identifiers);
    Ok(())
}

#[test]
fn full_policy_walks_the_tree_on_connect() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::full());
    let peripheral = session.connect()?;

    let services = session.core.services(peripheral);
    assert_eq!(2, services.len());
    let heart_rate = session
        .core
        .service(peripheral, HEART_RATE)
        .expect("heart rate service discovered");
    let measurement = session
        .core
        .characteristic(heart_rate, MEASUREMENT)
        .expect("measurement characteristic discovered");
    let descriptors: Vec<_> = session
        .core
        .descriptors(measurement)
        .iter()
        .map(|descriptor| descriptor.identifier())
        .collect();

    assert_eq!(vec![CLIENT_CONFIGURATION], descriptors);
    assert_eq!(
        1,
        session
            .fake
            .commands()
            .iter()
            .filter(|command| matches!(command, FakeCommand::DiscoverServices { .. }))
            .count()
    );
    Ok(())
}

#[test]
fn reconnect_reattaches_existing_proxies_without_rediscovery() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::full());
    let peripheral = session.connect_and_walk()?;
    let services = session.core.services(peripheral);
    let heart_rate = session
        .core
        .service(peripheral, HEART_RATE)
        .expect("heart rate service discovered");
    let characteristics = session.core.characteristics(heart_rate);
    let measurement = characteristics[0];

    session.fake.disconnect_remote(MONITOR, None);
    session.pump();
    assert_matches!(
        session.core.read_value(measurement),
        Err(GattError::Unreachable { identifier }) if identifier == MEASUREMENT
    );

    session.core.connect(peripheral, None)?;
    session.pump();

    assert_eq!(services, session.core.services(peripheral));
    assert_eq!(characteristics, session.core.characteristics(heart_rate));
    assert_eq!(
        vec![FakeCommand::Connect { device: MONITOR }],
        session.fake.commands()
    );

    session.core.read_value(measurement)?;
    session.pump();
    assert_eq!(Some(vec![0x06, 0x48]), session.core.value(measurement));
    Ok(())
}

#[test]
fn reconnect_after_cache_loss_rediscovers_into_existing_proxies() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::full());
    let peripheral = session.connect_and_walk()?;
    let services = session.core.services(peripheral);
    let battery = session
        .core
        .service(peripheral, BATTERY)
        .expect("battery service discovered");
    let level = session
        .core
        .characteristic(battery, BATTERY_LEVEL)
        .expect("battery level discovered");

    session.fake.disconnect_remote(MONITOR, None);
    session.pump();
    session.fake.forget_cache(MONITOR);
    session.fake.clear_commands();

    session.core.connect(peripheral, None)?;
    session.pump();

    assert_eq!(services, session.core.services(peripheral));
    assert_eq!(Some(level), session.core.characteristic(battery, BATTERY_LEVEL));
    assert_eq!(
        1,
        session
            .fake
            .commands()
            .iter()
            .filter(|command| matches!(command, FakeCommand::DiscoverServices { .. }))
            .count()
    );
    assert_matches!(
        session.core.service_info(battery),
        Some(info) if info.attached
            && info.characteristic_discovery == DiscoveryState::Discovered
    );

    session.core.read_value(level)?;
    session.pump();
    assert_eq!(Some(vec![0x5a]), session.core.value(level));
    Ok(())
}

#[test]
fn read_on_disconnected_peripheral_fails_synchronously() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::full());
    let peripheral = session.connect_and_walk()?;
    let battery = session
        .core
        .service(peripheral, BATTERY)
        .expect("battery service discovered");
    let level = session
        .core
        .characteristic(battery, BATTERY_LEVEL)
        .expect("battery level discovered");

    session.core.cancel_connection(peripheral)?;
    session.pump();
    session.fake.clear_commands();

    assert_matches!(
        session.core.read_value(level),
        Err(GattError::Unreachable { .. })
    );
    assert_eq!(Vec::<FakeCommand>::new(), session.fake.commands());
    assert_matches!(
        session.core.maximum_write_length(peripheral, WriteType::WithResponse),
        Err(GattError::Unreachable { .. })
    );
    Ok(())
}

#[rstest]
#[case(BATTERY_LEVEL, WriteType::WithResponse)]
#[case(MEASUREMENT, WriteType::WithResponse)]
fn write_to_characteristic_without_write_property_is_rejected(
    #[case] target: Identifier,
    #[case] write_type: WriteType,
) -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::full());
    let peripheral = session.connect_and_walk()?;
    let characteristic = session
        .core
        .services(peripheral)
        .into_iter()
        .find_map(|service| session.core.characteristic(service, target))
        .expect("characteristic discovered");

    assert_matches!(
        session
            .core
            .write_value(characteristic, vec![0x01], write_type),
        Err(GattError::NotPermitted { identifier, .. }) if identifier == target
    );
    Ok(())
}

#[test]
fn write_with_response_updates_remote_value() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::full());
    let peripheral = session.connect_and_walk()?;
    let heart_rate = session
        .core
        .service(peripheral, HEART_RATE)
        .expect("heart rate service discovered");
    let control_point = session
        .core
        .characteristic(heart_rate, CONTROL_POINT)
        .expect("control point discovered");

    session
        .core
        .write_value(control_point, vec![0x01], WriteType::WithResponse)?;
    session.pump();

    assert_eq!(
        Some(vec![0x01]),
        session.fake.stored_value(MONITOR, CONTROL_POINT)
    );
    assert_eq!(
        vec![GattEvent::ValueWritten {
            characteristic: control_point,
            result: Ok(()),
        }],
        session.drain()
    );
    Ok(())
}

#[test]
fn notifications_update_cached_value() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::full());
    let peripheral = session.connect_and_walk()?;
    let heart_rate = session
        .core
        .service(peripheral, HEART_RATE)
        .expect("heart rate service discovered");
    let measurement = session
        .core
        .characteristic(heart_rate, MEASUREMENT)
        .expect("measurement discovered");

    session.core.set_notify_value(measurement, true)?;
    session.pump();
    session.fake.notify(MONITOR, MEASUREMENT, &[0x06, 0x50]);
    session.pump();

    assert_eq!(Some(vec![0x06, 0x50]), session.core.value(measurement));
    assert_eq!(
        vec![
            GattEvent::NotificationStateUpdated {
                characteristic: measurement,
                notifying: Ok(true),
            },
            GattEvent::ValueUpdated {
                characteristic: measurement,
                value: Ok(vec![0x06, 0x50]),
            },
        ],
        session.drain()
    );
    Ok(())
}

#[test]
fn duplicate_service_identifiers_get_distinct_proxies() -> anyhow::Result<()> {
    let fake = FakeTransport::new();
    fake.add_device(
        FakeDevice::builder()
            .identifier(MONITOR)
            .services(vec![
                FakeService::new(BATTERY).characteristic(FakeCharacteristic::new(
                    BATTERY_LEVEL,
                    CharacteristicProperties::READ,
                )),
                FakeService::new(BATTERY),
            ])
            .build(),
    );
    let mut core = CentralManagerCore::new(fake.clone(), DiscoveryPolicy::manual());
    core.start_scanning(None, ScanOptions::default(), None);
    fake.pump(&mut core);
    let peripheral = core.peripheral(MONITOR).expect("monitor registered");
    core.connect(peripheral, None)?;
    fake.pump(&mut core);
    core.discover_services(peripheral, None)?;
    fake.pump(&mut core);

    let batteries = core.services_with_identifier(peripheral, BATTERY);
    assert_eq!(2, batteries.len());
    assert_ne!(batteries[0], batteries[1]);
    assert_eq!(Some(batteries[0]), core.service(peripheral, BATTERY));

    core.discover_characteristics(batteries[0], None)?;
    fake.pump(&mut core);
    assert_eq!(1, core.characteristics(batteries[0]).len());
    assert_eq!(0, core.characteristics(batteries[1]).len());
    Ok(())
}

#[test]
fn services_modified_detaches_invalidated_services() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect_and_walk()?;
    let battery = session
        .core
        .service(peripheral, BATTERY)
        .expect("battery service discovered");
    let level = session
        .core
        .characteristic(battery, BATTERY_LEVEL)
        .expect("battery level discovered");

    session.fake.modify_services(MONITOR, &[BATTERY]);
    session.pump();

    assert_matches!(
        session.drain().as_slice(),
        [GattEvent::ServicesModified { invalidated, .. }] if invalidated == &vec![battery]
    );
    assert_matches!(
        session.core.read_value(level),
        Err(GattError::Unreachable { .. })
    );
    Ok(())
}

#[test]
fn radio_power_loss_disconnects_everything() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect()?;
    session.drain();

    session.fake.set_radio_state(ManagerState::PoweredOff);
    session.pump();

    assert_eq!(ManagerState::PoweredOff, session.core.state());
    assert_eq!(
        Some(ConnectionState::Disconnected),
        session.core.connection_state(peripheral)
    );
    assert_eq!(
        vec![GattEvent::StateUpdated(ManagerState::PoweredOff)],
        session.drain()
    );
    Ok(())
}

#[test]
fn radio_power_loss_ends_an_active_scan() {
    let mut session = Session::new(DiscoveryPolicy::manual());
    session.core.start_scanning(None, ScanOptions::default(), None);
    session.pump();
    session.drain();

    session.fake.set_radio_state(ManagerState::PoweredOff);
    session.pump();

    assert_eq!(false, session.core.is_scanning());
    assert_eq!(
        vec![
            GattEvent::ScanStopped,
            GattEvent::StateUpdated(ManagerState::PoweredOff),
        ],
        session.drain()
    );
}

#[test]
fn stale_disconnection_is_ignored_after_reconnect() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect()?;
    let stale = session
        .fake
        .handle_for(MONITOR)
        .expect("monitor handle available");

    session.fake.disconnect_remote(MONITOR, None);
    session.pump();
    session.core.connect(peripheral, None)?;
    session.pump();
    session.drain();

    session
        .core
        .handle_event(gattlink::TransportEvent::Disconnected {
            peripheral: stale,
            error: None,
        });

    assert_eq!(
        Some(ConnectionState::Connected),
        session.core.connection_state(peripheral)
    );
    assert_eq!(Vec::<GattEvent>::new(), session.drain());
    Ok(())
}

#[test]
fn retrieve_connected_peripherals_only_returns_known_matches() -> anyhow::Result<()> {
    let mut session = Session::new(DiscoveryPolicy::manual());
    let peripheral = session.connect()?;

    assert_eq!(
        vec![peripheral],
        session.core.retrieve_connected_peripherals(&[HEART_RATE])
    );
    assert_eq!(
        Vec::<Peripheral>::new(),
        session
            .core
            .retrieve_connected_peripherals(&[Identifier::from_u16(0x1812)])
    );
    Ok(())
}
