use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service, ValueNotification, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{CCCD, ENABLE_NOTIFICATION_VALUE, GATT_FAILURE, GATT_SUCCESS, WRITE_DEADLINE};
use crate::device::transport::{EventSender, GattCharacteristic, GattService, Link, LinkId, LinkState, Transport, TransportEvent};
use crate::error::DeviceError;

type KnownPeripherals = Arc<Mutex<HashMap<String, (Adapter, Peripheral)>>>;
type PeripheralSlot = Arc<Mutex<Option<Peripheral>>>;
type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn emit(events: &EventSender, event: TransportEvent) {
    if let Err(err) = events.unbounded_send(event) {
        debug!("Scale session is gone, dropping {:?}", err.into_inner());
    }
}

/// [`Transport`] on top of the platform bluetooth stack.
pub struct BtleTransport {
    _manager: Manager,
    adapters: Vec<Adapter>,
    events: EventSender,
    known: KnownPeripherals,
    scan_cancel: Option<CancellationToken>,
}

impl BtleTransport {
    pub async fn new(events: EventSender) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        for adapter in &adapters {
            info!("Found adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        }

        Ok(BtleTransport {
            _manager: manager,
            adapters,
            events,
            known: Arc::new(Mutex::new(HashMap::new())),
            scan_cancel: None,
        })
    }
}

impl Transport for BtleTransport {
    fn start_scan(&mut self, device_name: &str) -> Result<(), DeviceError> {
        if self.adapters.is_empty() {
            return Err(DeviceError::NoAdapter);
        }

        self.stop_scan();
        let cancel = CancellationToken::new();

        for adapter in &self.adapters {
            spawn(scan_task(
                adapter.clone(),
                device_name.to_string(),
                self.events.clone(),
                self.known.clone(),
                cancel.clone(),
            ));
        }

        self.scan_cancel = Some(cancel);
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(cancel) = self.scan_cancel.take() {
            cancel.cancel();
        }
    }

    fn connect(&mut self, link: LinkId, address: &str) -> Result<Box<dyn Link>, DeviceError> {
        if self.adapters.is_empty() {
            return Err(DeviceError::NoAdapter);
        }

        let btle_link = BtleLink {
            id: link,
            events: self.events.clone(),
            peripheral: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            closed: false,
        };

        spawn(connect_task(
            link,
            address.to_string(),
            self.adapters.clone(),
            self.known.clone(),
            btle_link.peripheral.clone(),
            self.events.clone(),
            btle_link.cancel.clone(),
        ));

        Ok(Box::new(btle_link))
    }
}

async fn scan_task(adapter: Adapter, device_name: String, events: EventSender, known: KnownPeripherals, cancel: CancellationToken) {
    let mut central_events = match adapter.events().await {
        Ok(v) => v,
        Err(err) => {
            warn!("Failed to listen to adapter events: {:?}", err);
            emit(&events, TransportEvent::ScanFailed { reason: err.to_string() });
            return;
        },
    };

    info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
        warn!("Scanning failed {:?}", err);
        emit(&events, TransportEvent::ScanFailed { reason: err.to_string() });
        return;
    }

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    report_peripheral(&adapter, &id, &device_name, &events, &known).await;
                },
                Some(_) => {},
                None => break 'mainloop,
            },
        }
    }

    if let Err(err) = adapter.stop_scan().await {
        warn!("Failed to stop scanning: {:?}", err);
    }
}

async fn report_peripheral(adapter: &Adapter, id: &PeripheralId, device_name: &str, events: &EventSender, known: &KnownPeripherals) {
    let peripheral = match adapter.peripheral(id).await {
        Ok(v) => v,
        Err(err) => {
            warn!("Failed to query BLE adapter for peripheral: {}", err);
            return;
        },
    };

    let properties = match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            return;
        },
        Ok(None) => return,
        Ok(Some(properties)) => properties,
    };

    if properties.local_name.as_deref() != Some(device_name) {
        return;
    }

    let address = properties.address.to_string();
    // devices without a signal reading rank below every measured one
    let rssi = properties.rssi.unwrap_or(i16::MIN);
    debug!("Advertisement from {} {} ({} dBm)", device_name, address, rssi);

    known
        .lock()
        .expect("Failed to lock known peripherals")
        .insert(address.clone(), (adapter.clone(), peripheral));

    emit(events, TransportEvent::Advertisement {
        name: device_name.to_string(),
        address,
        rssi,
    });
}

async fn find_peripheral(address: &str, adapters: &[Adapter], known: &KnownPeripherals) -> Result<(Adapter, Peripheral), DeviceError> {
    let scanned = known
        .lock()
        .expect("Failed to lock known peripherals")
        .get(address)
        .cloned();
    if let Some(scanned) = scanned {
        return Ok(scanned);
    }

    // not seen in this run's scan, but the platform may still know it (paired devices)
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            },
        };

        for peripheral in peripherals {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok((adapter.clone(), peripheral));
            }
        }
    }

    Err(DeviceError::UnknownPeripheral { address: address.to_string() })
}

async fn connect_task(
    link: LinkId,
    address: String,
    adapters: Vec<Adapter>,
    known: KnownPeripherals,
    slot: PeripheralSlot,
    events: EventSender,
    cancel: CancellationToken,
) {
    let failed = TransportEvent::ConnectionChanged { link, status: GATT_FAILURE, state: LinkState::Disconnected };

    let (adapter, peripheral) = match find_peripheral(&address, &adapters, &known).await {
        Ok(v) => v,
        Err(err) => {
            warn!("Connecting to {} failed: {}", address, err);
            emit(&events, failed);
            return;
        },
    };
    *slot.lock().expect("Failed to lock peripheral slot") = Some(peripheral.clone());

    info!("Connecting to peripheral {}...", address);
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = peripheral.connect() => result,
    };

    if let Err(err) = result {
        warn!("Connecting to peripheral failed: {:?}", err);
        emit(&events, failed);
        return;
    }

    // listen before announcing the connection, so an immediate link loss is not missed
    let central_events = adapter.events().await;
    emit(&events, TransportEvent::ConnectionChanged { link, status: GATT_SUCCESS, state: LinkState::Connected });

    let mut central_events = match central_events {
        Ok(v) => v,
        Err(err) => {
            warn!("Can not watch {} for disconnects: {:?}", address, err);
            return;
        },
    };

    let peripheral_id = peripheral.id();
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                    warn!("Connection to {} lost", address);
                    emit(&events, TransportEvent::ConnectionChanged { link, status: GATT_SUCCESS, state: LinkState::Disconnected });
                    break 'mainloop;
                },
                Some(_) => {},
                None => break 'mainloop,
            },
        }
    }
}

fn to_gatt_service(service: &Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .iter()
            .map(|characteristic| {
                let mut descriptors: Vec<Uuid> = characteristic.descriptors.iter().map(|descriptor| descriptor.uuid).collect();

                // Some backends hide the CCCD, a notifying characteristic always has one
                if characteristic.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
                    && !descriptors.contains(&CCCD)
                {
                    descriptors.push(CCCD);
                }

                GattCharacteristic { uuid: characteristic.uuid, descriptors }
            })
            .collect(),
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, DeviceError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid.eq(&uuid))
        .ok_or(DeviceError::MissingCharacteristic)
}

async fn subscribe(peripheral: &Peripheral, uuid: Uuid, link: LinkId, events: EventSender, cancel: CancellationToken) -> Result<(), DeviceError> {
    let characteristic = find_characteristic(peripheral, uuid)?;

    // open the stream first so that the first frames are not lost
    let notifications = peripheral.notifications().await?;

    info!("Subscribing to characteristic {:?} {:?}", characteristic.service_uuid, characteristic.uuid);
    peripheral.subscribe(&characteristic).await?;

    spawn(read_notifications_task(link, notifications, events, cancel));
    Ok(())
}

async fn unsubscribe(peripheral: &Peripheral, uuid: Uuid) -> Result<(), DeviceError> {
    let characteristic = find_characteristic(peripheral, uuid)?;
    peripheral.unsubscribe(&characteristic).await?;
    Ok(())
}

async fn read_notifications_task(link: LinkId, mut notifications: NotificationStream, events: EventSender, cancel: CancellationToken) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            notification = notifications.next() => match notification {
                Some(data) => emit(&events, TransportEvent::Notification {
                    link,
                    characteristic: data.uuid,
                    value: data.value,
                }),
                None => break 'mainloop,
            },
        }
    }

    debug!("Notification reader of {:?} stopped", link);
}

async fn write_with_deadline(peripheral: &Peripheral, uuid: Uuid, value: &[u8]) -> i32 {
    let characteristic = match find_characteristic(peripheral, uuid) {
        Ok(v) => v,
        Err(err) => {
            warn!("Can not write to {}: {}", uuid, err);
            return GATT_FAILURE;
        },
    };

    let fut = peripheral.write(&characteristic, value, WriteType::WithResponse);

    tokio::select! {
        _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
            warn!("Sending to characteristic {} took too long", uuid);
            GATT_FAILURE
        }
        result = fut => match result {
            Err(err) => {
                warn!("Failed to send to characteristic {}: {:?}", uuid, err);
                GATT_FAILURE
            },
            Ok(()) => GATT_SUCCESS,
        }
    }
}

struct BtleLink {
    id: LinkId,
    events: EventSender,
    /// Filled in by the connect task once the address has been resolved.
    peripheral: PeripheralSlot,
    cancel: CancellationToken,
    closed: bool,
}

impl BtleLink {
    fn peripheral(&self) -> Option<Peripheral> {
        self.peripheral.lock().expect("Failed to lock peripheral slot").clone()
    }
}

impl Link for BtleLink {
    fn discover_services(&mut self) {
        let link = self.id;
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let peripheral = self.peripheral();

        spawn(async move {
            let failed = TransportEvent::ServicesDiscovered { link, status: GATT_FAILURE, services: Vec::new() };

            let peripheral = match peripheral {
                Some(v) => v,
                None => {
                    emit(&events, failed);
                    return;
                },
            };

            info!("Connected; Discovering services...");
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = peripheral.discover_services() => result,
            };

            match result {
                Ok(()) => {
                    let services = peripheral.services().iter().map(to_gatt_service).collect();
                    emit(&events, TransportEvent::ServicesDiscovered { link, status: GATT_SUCCESS, services });
                },
                Err(err) => {
                    warn!("Discovering services failed: {:?}", err);
                    emit(&events, failed);
                },
            }
        });
    }

    fn write_descriptor(&mut self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) {
        let link = self.id;
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let peripheral = self.peripheral();
        let enable = value == &ENABLE_NOTIFICATION_VALUE[..];

        spawn(async move {
            let result = match peripheral {
                None => Err(DeviceError::MissingCharacteristic),
                // btleplug writes the CCCD as part of (un)subscribing
                Some(_) if descriptor != CCCD => Err(DeviceError::MissingCharacteristic),
                Some(peripheral) if enable => subscribe(&peripheral, characteristic, link, events.clone(), cancel.clone()).await,
                Some(peripheral) => unsubscribe(&peripheral, characteristic).await,
            };

            if cancel.is_cancelled() {
                return;
            }

            let status = match result {
                Ok(()) => GATT_SUCCESS,
                Err(err) => {
                    warn!("Writing descriptor {} of {} failed: {}", descriptor, characteristic, err);
                    GATT_FAILURE
                },
            };
            emit(&events, TransportEvent::DescriptorWriteResult { link, descriptor, status });
        });
    }

    fn write_characteristic(&mut self, characteristic: Uuid, value: &[u8]) {
        let link = self.id;
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        let peripheral = self.peripheral();
        let value = value.to_vec();

        spawn(async move {
            let status = match peripheral {
                Some(peripheral) => write_with_deadline(&peripheral, characteristic, &value).await,
                None => GATT_FAILURE,
            };

            if !cancel.is_cancelled() {
                emit(&events, TransportEvent::CharacteristicWriteResult { link, characteristic, status });
            }
        });
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();

        let peripheral = match self.peripheral() {
            Some(v) => v,
            None => return,
        };

        // dropping a link outside of the runtime (process exit) leaves the disconnect to the OS
        if let Ok(runtime) = Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = peripheral.disconnect().await {
                    warn!("Failed to disconnect peripheral: {:?}", err);
                }
            });
        }
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.close();
    }
}
