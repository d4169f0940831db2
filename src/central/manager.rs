use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bon::Builder;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info_span, trace, warn};

use super::engine::{CentralManagerCore, L2capHandler, ScanTimer};
use super::delegate::{
    CentralDelegate, EventForwarder, GattEvent, PeripheralDataSource, PeripheralDelegate,
};
use super::discovery::DiscoveryPolicy;
use super::restoration::{FileRestorationStore, RestorationRecord, RestorationStore};
use crate::codec::ValueCodec;
use crate::error::{GattError, RestorationError};
use crate::gatt::{
    Characteristic, CharacteristicInfo, Descriptor, DescriptorInfo, Peripheral, PeripheralInfo,
    Service, ServiceInfo,
};
use crate::identifier::Identifier;
use crate::transport::{
    ConnectOptions, ConnectionState, ManagerState, ScanOptions, Transport, TransportEvent,
    WriteType,
};

type Job<T> = Box<dyn FnOnce(&mut CentralManagerCore<T>) + Send>;

pub(crate) enum QueueItem<T: Transport> {
    Job(Job<T>),
    Event(TransportEvent<T>),
    ScanTimeout(ScanTimer),
    Shutdown,
}

/// Settings for [`CentralManager::spawn`].
#[derive(Debug, Clone, Default, Builder)]
pub struct ManagerConfig {
    /// Policy for peripherals without their own.
    #[builder(default)]
    pub default_policy: DiscoveryPolicy,
    /// Key under which session state is persisted between launches. Without
    /// one, sessions are neither saved nor restored.
    pub restoration_identifier: Option<String>,
    /// Parent span for everything the manager task logs.
    pub span: Option<Span>,
}

/// Cloneable handle through which a transport posts completions.
pub struct EventSink<T: Transport> {
    queue: mpsc::UnboundedSender<QueueItem<T>>,
}

impl<T: Transport> EventSink<T> {
    /// Queues `event` for the manager task. Returns `false` once the manager
    /// has shut down.
    pub fn post(&self, event: TransportEvent<T>) -> bool {
        self.queue.send(QueueItem::Event(event)).is_ok()
    }
}

impl<T: Transport> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<T: Transport> fmt::Debug for EventSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

/// Central manager running on its own tokio task.
pub struct CentralManager<T: Transport> {
    queue: mpsc::UnboundedSender<QueueItem<T>>,
    scan_timer: Mutex<Option<CancellationToken>>,
    worker: JoinHandle<()>,
    restoration_identifier: Option<String>,
}

impl<T: Transport> CentralManager<T> {
    /// Builds the transport around a fresh [`EventSink`] and starts the
    /// manager task. Must be called from within a tokio runtime.
    pub fn spawn(config: ManagerConfig, transport: impl FnOnce(EventSink<T>) -> T) -> Self {
        let (queue, items) = mpsc::unbounded_channel();
        let transport = transport(EventSink {
            queue: queue.clone(),
        });
        let core = CentralManagerCore::new(transport, config.default_policy);
        let span = config
            .span
            .unwrap_or_else(|| info_span!("central_manager"));
        let worker = tokio::spawn(run_queue(core, items, span));
        Self {
            queue,
            scan_timer: Mutex::new(None),
            worker,
            restoration_identifier: config.restoration_identifier,
        }
    }

    #[must_use]
    pub fn restoration_identifier(&self) -> Option<&str> {
        self.restoration_identifier.as_deref()
    }

    /// File store keyed by the restoration identifier, if there is one.
    pub fn restoration_store(&self) -> Result<Option<FileRestorationStore>, RestorationError> {
        self.restoration_identifier
            .as_deref()
            .map(FileRestorationStore::for_identifier)
            .transpose()
    }

    /// Runs `job` on the manager task and returns its result.
    pub async fn perform<R, F>(&self, job: F) -> Result<R, GattError>
    where
        F: FnOnce(&mut CentralManagerCore<T>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job<T> = Box::new(move |core| {
            // The caller may have stopped waiting.
            let _ = reply.send(job(core));
        });
        self.queue
            .send(QueueItem::Job(job))
            .map_err(|_| GattError::QueueClosed)?;
        response.await.map_err(|_| GattError::QueueClosed)
    }

    /// Stops the manager task after every queued item has been applied.
    pub async fn shutdown(self) {
        self.disarm_scan_timer();
        if self.queue.send(QueueItem::Shutdown).is_err() {
            return;
        }
        if let Err(error) = self.worker.await {
            debug!(%error, "central manager task ended abnormally");
        }
    }

    fn disarm_scan_timer(&self) {
        let mut slot = self
            .scan_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
    }

    fn arm_scan_timer(&self, timer: Option<ScanTimer>) {
        let mut slot = self
            .scan_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let Some(timer) = timer else {
            return;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => trace!("scan timer cancelled"),
                () = tokio::time::sleep(timer.timeout()) => {
                    // The manager may already be gone.
                    let _ = queue.send(QueueItem::ScanTimeout(timer));
                }
            }
        });
        *slot = Some(token);
    }

    /// Streams every delegate callback. Replaces any installed central
    /// delegate and default peripheral delegate.
    pub async fn events(&self) -> Result<UnboundedReceiverStream<GattEvent>, GattError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.perform(move |core| {
            let forwarder = EventForwarder::new(sender);
            core.set_delegate(Some(Box::new(forwarder.clone())));
            core.set_default_peripheral_delegate(Some(Box::new(forwarder)));
        })
        .await?;
        Ok(UnboundedReceiverStream::new(receiver))
    }

    pub async fn state(&self) -> Result<ManagerState, GattError> {
        self.perform(|core| core.state()).await
    }

    pub async fn is_scanning(&self) -> Result<bool, GattError> {
        self.perform(|core| core.is_scanning()).await
    }

    /// Starts scanning. A `timeout` stops the scan once it elapses; calling
    /// again replaces any pending timeout.
    pub async fn start_scanning(
        &self,
        services: Option<Vec<Identifier>>,
        options: ScanOptions,
        timeout: Option<Duration>,
    ) -> Result<(), GattError> {
        let timer = self
            .perform(move |core| core.start_scanning(services, options, timeout))
            .await?;
        self.arm_scan_timer(timer);
        Ok(())
    }

    pub async fn stop_scanning(&self) -> Result<(), GattError> {
        self.disarm_scan_timer();
        self.perform(|core| core.stop_scanning()).await
    }

    pub async fn connect(
        &self,
        peripheral: Peripheral,
        options: Option<ConnectOptions>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.connect(peripheral, options))
            .await?
    }

    pub async fn cancel_connection(&self, peripheral: Peripheral) -> Result<(), GattError> {
        self.perform(move |core| core.cancel_connection(peripheral))
            .await?
    }

    pub async fn cancel_all_connections(&self) -> Result<(), GattError> {
        self.perform(|core| core.cancel_all_connections()).await
    }

    pub async fn forget(&self, peripheral: Peripheral) -> Result<(), GattError> {
        self.perform(move |core| core.forget(peripheral)).await?
    }

    pub async fn retrieve_peripherals(
        &self,
        identifiers: Vec<Identifier>,
    ) -> Result<Vec<Peripheral>, GattError> {
        self.perform(move |core| core.retrieve_peripherals(&identifiers))
            .await
    }

    pub async fn retrieve_connected_peripherals(
        &self,
        services: Vec<Identifier>,
    ) -> Result<Vec<Peripheral>, GattError> {
        self.perform(move |core| core.retrieve_connected_peripherals(&services))
            .await
    }

    pub async fn peripherals(&self) -> Result<Vec<Peripheral>, GattError> {
        self.perform(|core| core.peripherals()).await
    }

    pub async fn peripheral(&self, identifier: Identifier) -> Result<Option<Peripheral>, GattError> {
        self.perform(move |core| core.peripheral(identifier)).await
    }

    pub async fn peripheral_info(
        &self,
        peripheral: Peripheral,
    ) -> Result<Option<PeripheralInfo>, GattError> {
        self.perform(move |core| core.peripheral_info(peripheral))
            .await
    }

    pub async fn connection_state(
        &self,
        peripheral: Peripheral,
    ) -> Result<Option<ConnectionState>, GattError> {
        self.perform(move |core| core.connection_state(peripheral))
            .await
    }

    pub async fn services(&self, peripheral: Peripheral) -> Result<Vec<Service>, GattError> {
        self.perform(move |core| core.services(peripheral)).await
    }

    pub async fn service(
        &self,
        peripheral: Peripheral,
        identifier: Identifier,
    ) -> Result<Option<Service>, GattError> {
        self.perform(move |core| core.service(peripheral, identifier))
            .await
    }

    /// Every service of `peripheral` with `identifier`, in discovery order.
    pub async fn services_with_identifier(
        &self,
        peripheral: Peripheral,
        identifier: Identifier,
    ) -> Result<Vec<Service>, GattError> {
        self.perform(move |core| core.services_with_identifier(peripheral, identifier))
            .await
    }

    pub async fn included_services(&self, service: Service) -> Result<Vec<Service>, GattError> {
        self.perform(move |core| core.included_services(service)).await
    }

    pub async fn service_info(&self, service: Service) -> Result<Option<ServiceInfo>, GattError> {
        self.perform(move |core| core.service_info(service)).await
    }

    pub async fn characteristics(&self, service: Service) -> Result<Vec<Characteristic>, GattError> {
        self.perform(move |core| core.characteristics(service)).await
    }

    pub async fn characteristic(
        &self,
        service: Service,
        identifier: Identifier,
    ) -> Result<Option<Characteristic>, GattError> {
        self.perform(move |core| core.characteristic(service, identifier))
            .await
    }

    pub async fn characteristics_with_identifier(
        &self,
        service: Service,
        identifier: Identifier,
    ) -> Result<Vec<Characteristic>, GattError> {
        self.perform(move |core| core.characteristics_with_identifier(service, identifier))
            .await
    }

    pub async fn characteristic_info(
        &self,
        characteristic: Characteristic,
    ) -> Result<Option<CharacteristicInfo>, GattError> {
        self.perform(move |core| core.characteristic_info(characteristic))
            .await
    }

    pub async fn descriptors(
        &self,
        characteristic: Characteristic,
    ) -> Result<Vec<Descriptor>, GattError> {
        self.perform(move |core| core.descriptors(characteristic))
            .await
    }

    pub async fn descriptor(
        &self,
        characteristic: Characteristic,
        identifier: Identifier,
    ) -> Result<Option<Descriptor>, GattError> {
        self.perform(move |core| core.descriptor(characteristic, identifier))
            .await
    }

    pub async fn descriptor_info(
        &self,
        descriptor: Descriptor,
    ) -> Result<Option<DescriptorInfo>, GattError> {
        self.perform(move |core| core.descriptor_info(descriptor))
            .await
    }

    pub async fn value(&self, characteristic: Characteristic) -> Result<Option<Vec<u8>>, GattError> {
        self.perform(move |core| core.value(characteristic)).await
    }

    pub async fn discover_services(
        &self,
        peripheral: Peripheral,
        filter: Option<Vec<Identifier>>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.discover_services(peripheral, filter))
            .await?
    }

    pub async fn discover_included_services(
        &self,
        service: Service,
        filter: Option<Vec<Identifier>>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.discover_included_services(service, filter))
            .await?
    }

    pub async fn discover_characteristics(
        &self,
        service: Service,
        filter: Option<Vec<Identifier>>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.discover_characteristics(service, filter))
            .await?
    }

    pub async fn discover_descriptors(&self, characteristic: Characteristic) -> Result<(), GattError> {
        self.perform(move |core| core.discover_descriptors(characteristic))
            .await?
    }

    pub async fn read_value(&self, characteristic: Characteristic) -> Result<(), GattError> {
        self.perform(move |core| core.read_value(characteristic))
            .await?
    }

    pub async fn write_value(
        &self,
        characteristic: Characteristic,
        value: Vec<u8>,
        write_type: WriteType,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.write_value(characteristic, value, write_type))
            .await?
    }

    /// Encodes on the caller's task, then writes.
    pub async fn write_typed<C: ValueCodec>(
        &self,
        characteristic: Characteristic,
        codec: &C,
        value: &C::Value,
        write_type: WriteType,
    ) -> Result<(), GattError> {
        let bytes = codec.encode(value)?;
        self.write_value(characteristic, bytes, write_type).await
    }

    pub async fn set_notify_value(
        &self,
        characteristic: Characteristic,
        enabled: bool,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.set_notify_value(characteristic, enabled))
            .await?
    }

    pub async fn read_descriptor(&self, descriptor: Descriptor) -> Result<(), GattError> {
        self.perform(move |core| core.read_descriptor(descriptor))
            .await?
    }

    pub async fn write_descriptor(
        &self,
        descriptor: Descriptor,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.write_descriptor(descriptor, value))
            .await?
    }

    pub async fn read_rssi(&self, peripheral: Peripheral) -> Result<(), GattError> {
        self.perform(move |core| core.read_rssi(peripheral)).await?
    }

    pub async fn open_l2cap_channel(&self, peripheral: Peripheral, psm: u16) -> Result<(), GattError> {
        self.perform(move |core| core.open_l2cap_channel(peripheral, psm))
            .await?
    }

    pub async fn maximum_write_length(
        &self,
        peripheral: Peripheral,
        write_type: WriteType,
    ) -> Result<usize, GattError> {
        self.perform(move |core| core.maximum_write_length(peripheral, write_type))
            .await?
    }

    pub async fn set_delegate(&self, delegate: Option<Box<dyn CentralDelegate>>) -> Result<(), GattError> {
        self.perform(move |core| core.set_delegate(delegate)).await
    }

    pub async fn set_data_source(
        &self,
        data_source: Option<Box<dyn PeripheralDataSource>>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.set_data_source(data_source))
            .await
    }

    pub async fn set_default_peripheral_delegate(
        &self,
        delegate: Option<Box<dyn PeripheralDelegate>>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.set_default_peripheral_delegate(delegate))
            .await
    }

    pub async fn set_peripheral_delegate(
        &self,
        peripheral: Peripheral,
        delegate: Option<Box<dyn PeripheralDelegate>>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.set_peripheral_delegate(peripheral, delegate))
            .await?
    }

    pub async fn set_l2cap_handler(&self, handler: Option<L2capHandler<T>>) -> Result<(), GattError> {
        self.perform(move |core| core.set_l2cap_handler(handler))
            .await
    }

    pub async fn set_default_policy(&self, policy: DiscoveryPolicy) -> Result<(), GattError> {
        self.perform(move |core| core.set_default_policy(policy))
            .await
    }

    pub async fn set_peripheral_policy(
        &self,
        peripheral: Peripheral,
        policy: Option<DiscoveryPolicy>,
    ) -> Result<(), GattError> {
        self.perform(move |core| core.set_peripheral_policy(peripheral, policy))
            .await?
    }

    pub async fn export_record(&self) -> Result<RestorationRecord, GattError> {
        self.perform(|core| core.export_record()).await
    }

    /// Persists the current session to `store`.
    pub async fn save_session(&self, store: &dyn RestorationStore) -> Result<(), RestorationError> {
        let Some(identifier) = self.restoration_identifier.clone() else {
            debug!("no restoration identifier, session not saved");
            return Ok(());
        };
        let mut record = self.export_record().await?;
        record.restoration_identifier = Some(identifier);
        store.save(&record).await
    }

    /// Pre-creates proxies from the record `store` holds for this manager's
    /// restoration identifier.
    pub async fn restore_session(
        &self,
        store: &dyn RestorationStore,
    ) -> Result<Vec<Peripheral>, RestorationError> {
        let Some(identifier) = self.restoration_identifier.as_deref() else {
            debug!("no restoration identifier, nothing to restore");
            return Ok(Vec::new());
        };
        let Some(record) = store.load().await? else {
            return Ok(Vec::new());
        };
        if record.restoration_identifier.as_deref() != Some(identifier) {
            warn!(
                expected = identifier,
                found = ?record.restoration_identifier,
                "ignoring restoration record saved by another manager"
            );
            return Ok(Vec::new());
        }
        Ok(self.perform(move |core| core.restore_record(&record)).await?)
    }
}

async fn run_queue<T: Transport>(
    mut core: CentralManagerCore<T>,
    mut items: mpsc::UnboundedReceiver<QueueItem<T>>,
    span: Span,
) {
    while let Some(item) = items.recv().await {
        let keep_running = span.in_scope(|| match item {
            QueueItem::Job(job) => {
                job(&mut core);
                true
            }
            QueueItem::Event(event) => {
                core.handle_event(event);
                true
            }
            QueueItem::ScanTimeout(timer) => {
                core.on_scan_timeout(timer);
                true
            }
            QueueItem::Shutdown => false,
        });
        if !keep_running {
            break;
        }
    }
    span.in_scope(|| debug!("central manager task stopped"));
}
