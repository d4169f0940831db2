use bon::Builder;
use tokio::sync::mpsc::UnboundedSender;

use super::discovery::DiscoveryPolicy;
use crate::advertisement::Advertisement;
use crate::error::GattError;
use crate::gatt::{Characteristic, Descriptor, Peripheral, Service};
use crate::identifier::Identifier;
use crate::transport::ManagerState;

/// Manager-level lifecycle callbacks.
#[allow(unused_variables)]
pub trait CentralDelegate: Send {
    fn did_update_state(&mut self, state: ManagerState) {}
    fn did_discover(&mut self, peripheral: Peripheral, advertisement: &Advertisement, rssi: i16) {}
    fn did_connect(&mut self, peripheral: Peripheral) {}
    fn did_fail_to_connect(&mut self, peripheral: Peripheral, error: GattError) {}
    fn did_disconnect(&mut self, peripheral: Peripheral, error: Option<GattError>) {}
    /// Scanning ended, either explicitly or because its timer fired.
    fn did_stop_scanning(&mut self) {}
    fn will_restore_state(&mut self, peripherals: &[Peripheral]) {}
}

/// Per-peripheral completion callbacks.
#[allow(unused_variables)]
pub trait PeripheralDelegate: Send {
    fn did_discover_services(&mut self, peripheral: Peripheral, services: Result<Vec<Service>, GattError>) {}
    fn did_discover_included_services(
        &mut self,
        service: Service,
        included: Result<Vec<Service>, GattError>,
    ) {
    }
    fn did_discover_characteristics(
        &mut self,
        service: Service,
        characteristics: Result<Vec<Characteristic>, GattError>,
    ) {
    }
    fn did_discover_descriptors(
        &mut self,
        characteristic: Characteristic,
        descriptors: Result<Vec<Descriptor>, GattError>,
    ) {
    }
    /// A read completed or a notification arrived.
    fn did_update_value(&mut self, characteristic: Characteristic, value: Result<Vec<u8>, GattError>) {}
    fn did_write_value(&mut self, characteristic: Characteristic, result: Result<(), GattError>) {}
    fn did_update_notification_state(
        &mut self,
        characteristic: Characteristic,
        notifying: Result<bool, GattError>,
    ) {
    }
    fn did_update_descriptor_value(&mut self, descriptor: Descriptor, value: Result<Vec<u8>, GattError>) {}
    fn did_write_descriptor(&mut self, descriptor: Descriptor, result: Result<(), GattError>) {}
    fn did_read_rssi(&mut self, peripheral: Peripheral, rssi: Result<i16, GattError>) {}
    fn did_update_name(&mut self, peripheral: Peripheral, name: Option<String>) {}
    /// Services were invalidated by the remote device and have been detached.
    fn did_modify_services(&mut self, peripheral: Peripheral, invalidated: Vec<Service>) {}
    fn is_ready_to_send_write_without_response(&mut self, peripheral: Peripheral) {}
}

/// Configuration vended for a newly discovered peripheral.
#[derive(Default, Builder)]
pub struct PeripheralSetup {
    pub policy: Option<DiscoveryPolicy>,
    pub delegate: Option<Box<dyn PeripheralDelegate>>,
}

/// Supplies per-peripheral configuration the first time a peripheral is seen.
pub trait PeripheralDataSource: Send {
    fn setup(&mut self, identifier: Identifier, advertisement: &Advertisement) -> PeripheralSetup;
}

/// Every callback flattened into one value, for applications that prefer a
/// stream to delegate objects.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    StateUpdated(ManagerState),
    Discovered {
        peripheral: Peripheral,
        advertisement: Advertisement,
        rssi: i16,
    },
    Connected(Peripheral),
    FailedToConnect {
        peripheral: Peripheral,
        error: GattError,
    },
    Disconnected {
        peripheral: Peripheral,
        error: Option<GattError>,
    },
    ScanStopped,
    WillRestoreState(Vec<Peripheral>),
    ServicesDiscovered {
        peripheral: Peripheral,
        services: Result<Vec<Service>, GattError>,
    },
    IncludedServicesDiscovered {
        service: Service,
        included: Result<Vec<Service>, GattError>,
    },
    CharacteristicsDiscovered {
        service: Service,
        characteristics: Result<Vec<Characteristic>, GattError>,
    },
    DescriptorsDiscovered {
        characteristic: Characteristic,
        descriptors: Result<Vec<Descriptor>, GattError>,
    },
    ValueUpdated {
        characteristic: Characteristic,
        value: Result<Vec<u8>, GattError>,
    },
    ValueWritten {
        characteristic: Characteristic,
        result: Result<(), GattError>,
    },
    NotificationStateUpdated {
        characteristic: Characteristic,
        notifying: Result<bool, GattError>,
    },
    DescriptorValueUpdated {
        descriptor: Descriptor,
        value: Result<Vec<u8>, GattError>,
    },
    DescriptorWritten {
        descriptor: Descriptor,
        result: Result<(), GattError>,
    },
    RssiRead {
        peripheral: Peripheral,
        rssi: Result<i16, GattError>,
    },
    NameUpdated {
        peripheral: Peripheral,
        name: Option<String>,
    },
    ServicesModified {
        peripheral: Peripheral,
        invalidated: Vec<Service>,
    },
    ReadyToSendWriteWithoutResponse(Peripheral),
}

/// Delegate that forwards every callback into a channel.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    events: UnboundedSender<GattEvent>,
}

impl EventForwarder {
    #[must_use]
    pub fn new(events: UnboundedSender<GattEvent>) -> Self {
        Self { events }
    }

    fn forward(&self, event: GattEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.events.send(event);
    }
}

impl CentralDelegate for EventForwarder {
    fn did_update_state(&mut self, state: ManagerState) {
        self.forward(GattEvent::StateUpdated(state));
    }

    fn did_discover(&mut self, peripheral: Peripheral, advertisement: &Advertisement, rssi: i16) {
        self.forward(GattEvent::Discovered {
            peripheral,
            advertisement: advertisement.clone(),
            rssi,
        });
    }

    fn did_connect(&mut self, peripheral: Peripheral) {
        self.forward(GattEvent::Connected(peripheral));
    }

    fn did_fail_to_connect(&mut self, peripheral: Peripheral, error: GattError) {
        self.forward(GattEvent::FailedToConnect { peripheral, error });
    }

    fn did_disconnect(&mut self, peripheral: Peripheral, error: Option<GattError>) {
        self.forward(GattEvent::Disconnected { peripheral, error });
    }

    fn did_stop_scanning(&mut self) {
        self.forward(GattEvent::ScanStopped);
    }

    fn will_restore_state(&mut self, peripherals: &[Peripheral]) {
        self.forward(GattEvent::WillRestoreState(peripherals.to_vec()));
    }
}

impl PeripheralDelegate for EventForwarder {
    fn did_discover_services(&mut self, peripheral: Peripheral, services: Result<Vec<Service>, GattError>) {
        self.forward(GattEvent::ServicesDiscovered {
            peripheral,
            services,
        });
    }

    fn did_discover_included_services(
        &mut self,
        service: Service,
        included: Result<Vec<Service>, GattError>,
    ) {
        self.forward(GattEvent::IncludedServicesDiscovered { service, included });
    }

    fn did_discover_characteristics(
        &mut self,
        service: Service,
        characteristics: Result<Vec<Characteristic>, GattError>,
    ) {
        self.forward(GattEvent::CharacteristicsDiscovered {
            service,
            characteristics,
        });
    }

    fn did_discover_descriptors(
        &mut self,
        characteristic: Characteristic,
        descriptors: Result<Vec<Descriptor>, GattError>,
    ) {
        self.forward(GattEvent::DescriptorsDiscovered {
            characteristic,
            descriptors,
        });
    }

    fn did_update_value(&mut self, characteristic: Characteristic, value: Result<Vec<u8>, GattError>) {
        self.forward(GattEvent::ValueUpdated {
            characteristic,
            value,
        });
    }

    fn did_write_value(&mut self, characteristic: Characteristic, result: Result<(), GattError>) {
        self.forward(GattEvent::ValueWritten {
            characteristic,
            result,
        });
    }

    fn did_update_notification_state(
        &mut self,
        characteristic: Characteristic,
        notifying: Result<bool, GattError>,
    ) {
        self.forward(GattEvent::NotificationStateUpdated {
            characteristic,
            notifying,
        });
    }

    fn did_update_descriptor_value(&mut self, descriptor: Descriptor, value: Result<Vec<u8>, GattError>) {
        self.forward(GattEvent::DescriptorValueUpdated { descriptor, value });
    }

    fn did_write_descriptor(&mut self, descriptor: Descriptor, result: Result<(), GattError>) {
        self.forward(GattEvent::DescriptorWritten { descriptor, result });
    }

    fn did_read_rssi(&mut self, peripheral: Peripheral, rssi: Result<i16, GattError>) {
        self.forward(GattEvent::RssiRead { peripheral, rssi });
    }

    fn did_update_name(&mut self, peripheral: Peripheral, name: Option<String>) {
        self.forward(GattEvent::NameUpdated { peripheral, name });
    }

    fn did_modify_services(&mut self, peripheral: Peripheral, invalidated: Vec<Service>) {
        self.forward(GattEvent::ServicesModified {
            peripheral,
            invalidated,
        });
    }

    fn is_ready_to_send_write_without_response(&mut self, peripheral: Peripheral) {
        self.forward(GattEvent::ReadyToSendWriteWithoutResponse(peripheral));
    }
}
