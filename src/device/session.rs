use std::future::pending;
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::{short_uuid, CCCD, COMMAND_TARE, CONNECT_TIMEOUT, COOL_DOWN, DEFAULT_DEVICE_NAME, ENABLE_NOTIFICATION_VALUE, GATT_SUCCESS, SCALE_NOTIFY_CHARACTERISTIC, SCALE_SERVICE, SCALE_WRITE_CHARACTERISTIC, SCAN_TIMEOUT};
use crate::device::frame::{decode, format_hex, Reading};
use crate::device::transport::{EventReceiver, GattService, Link, LinkId, LinkState, Transport, TransportEvent};
use crate::device::types::{ConnectionState, ScannedDevice, SessionCommand, SessionView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub device_name: String,
    pub scan_timeout: Duration,
    pub cool_down: Duration,
    pub connect_timeout: Duration,
    /// Connect as soon as a matching device is found, instead of waiting for `connect_to_address`.
    pub auto_connect: bool,
    /// Chosen over stronger devices whenever it has been seen during the scan.
    pub preferred_address: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            device_name: String::from(DEFAULT_DEVICE_NAME),
            scan_timeout: Duration::from_millis(SCAN_TIMEOUT),
            cool_down: Duration::from_millis(COOL_DOWN),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT),
            auto_connect: true,
            preferred_address: None,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        SessionSettings {
            device_name: config.device_name.clone(),
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            cool_down: Duration::from_millis(config.cool_down_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            auto_connect: config.auto_connect,
            preferred_address: config.saved_device_address.clone(),
        }
    }
}

/// The connection owned by the session. Dropping it closes the link.
struct ActiveLink {
    id: LinkId,
    address: String,
    handle: Box<dyn Link>,
    /// Set once the descriptor write enabling notifications has been confirmed.
    notify_characteristic: Option<Uuid>,
    write_characteristic: Option<Uuid>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Deadlines {
    scan: Option<Instant>,
    setup: Option<Instant>,
    cool_down: Option<Instant>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

struct Session<T: Transport> {
    transport: T,
    settings: SessionSettings,
    view: watch::Sender<SessionView>,
    link: Option<ActiveLink>,
    next_link_id: u64,
    scanning: bool,
    // insertion order is advertisement order, the most recent last
    discovered: IndexMap<String, ScannedDevice>,
    deadlines: Deadlines,
}

impl<T: Transport> Session<T> {
    async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: UnboundedReceiver<SessionCommand>,
        mut events: EventReceiver,
    ) {
        'mainloop: loop {
            let Deadlines { scan, setup, cool_down } = self.deadlines;

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = commands.next() => match command {
                    Some(command) => self.handle_command(command),
                    None => break 'mainloop,
                },
                Some(event) = events.next() => {
                    self.handle_event(event);
                },
                _ = wait_until(scan) => {
                    self.on_scan_timeout();
                },
                _ = wait_until(setup) => {
                    self.on_setup_timeout();
                },
                _ = wait_until(cool_down) => {
                    self.on_cool_down();
                },
            }
        }

        info!("Scale session stopping");
        self.stop_scanning();
        self.release_link();
        self.deadlines = Deadlines::default();
        self.set_state(ConnectionState::Idle);
    }

    fn state(&self) -> ConnectionState {
        self.view.borrow().state.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        info!("Scale session state: {}", state);
        self.view.send_modify(|view| {
            if state != ConnectionState::Connected {
                view.reading = None;
            }
            view.state = state;
        });
    }

    fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!("{}", line);
        self.view.send_modify(|view| view.log.push(line));
    }

    fn stop_scanning(&mut self) {
        self.deadlines.scan = None;
        if self.scanning {
            self.scanning = false;
            self.transport.stop_scan();
        }
    }

    fn release_link(&mut self) {
        self.deadlines.setup = None;
        if let Some(link) = self.link.take() {
            info!("Releasing link {:?} to {}", link.id, link.address);
        }
    }

    /// Surface `message` and fall back to a clean baseline; the cool-down reverts to idle.
    fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Scale session error: {}", message);

        self.stop_scanning();
        self.release_link();
        self.append_log(format!("> Error: {}", message));
        self.set_state(ConnectionState::Error { message });
        self.deadlines.cool_down = Some(Instant::now() + self.settings.cool_down);
    }

    fn handle_command(&mut self, command: SessionCommand) {
        debug!("Scale session command {:?}", command);

        match command {
            SessionCommand::StartScan => self.start_scan(),
            SessionCommand::ConnectToAddress(address) => self.connect_to(address),
            SessionCommand::Disconnect => self.disconnect(),
            SessionCommand::SendTare => self.send_tare(),
        }
    }

    fn start_scan(&mut self) {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Error { .. } => {},
            ConnectionState::Scanning | ConnectionState::DeviceFound { .. } => {
                self.append_log("> Already scanning");
                return;
            },
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.append_log("> Disconnect before scanning again");
                return;
            },
        }

        self.deadlines.cool_down = None;
        self.discovered.clear();
        self.view.send_modify(|view| {
            view.clear_log();
            view.devices.clear();
        });
        self.append_log(format!("> Scanning for \"{}\"...", self.settings.device_name));

        if let Err(err) = self.transport.start_scan(&self.settings.device_name) {
            self.fail(err.to_string());
            return;
        }

        self.scanning = true;
        self.deadlines.scan = Some(Instant::now() + self.settings.scan_timeout);
        self.set_state(ConnectionState::Scanning);
    }

    fn best_candidate(&self) -> Option<ScannedDevice> {
        if let Some(preferred) = &self.settings.preferred_address {
            if let Some(device) = self.discovered.get(preferred) {
                return Some(device.clone());
            }
        }

        // max_by yields the last of equally strong devices, which is the most recent one
        self.discovered
            .values()
            .max_by(|a, b| a.rssi.cmp(&b.rssi))
            .cloned()
    }

    fn on_advertisement(&mut self, name: String, address: String, rssi: i16) {
        if !self.scanning {
            return;
        }

        // Some environments ignore the scan filter, so make sure to check the name again
        if name != self.settings.device_name {
            return;
        }

        self.discovered.shift_remove(&address);
        self.discovered.insert(address.clone(), ScannedDevice { name, address, rssi });

        let mut devices: Vec<ScannedDevice> = self.discovered.values().cloned().collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        self.view.send_modify(|view| view.devices = devices);

        let best = match self.best_candidate() {
            Some(best) => best,
            None => return,
        };

        match self.state() {
            ConnectionState::Scanning => {
                self.append_log(format!("> Found: {}", best.address));
                self.append_log(format!("> Signal: {} dBm", best.rssi));
                self.set_state(ConnectionState::DeviceFound { address: best.address.clone(), rssi: best.rssi });

                if self.settings.auto_connect {
                    self.connect_to(best.address);
                }
            },
            ConnectionState::DeviceFound { address, rssi } => {
                if address != best.address || rssi != best.rssi {
                    self.set_state(ConnectionState::DeviceFound { address: best.address, rssi: best.rssi });
                }
            },
            _ => {},
        }
    }

    fn connect_to(&mut self, address: String) {
        match self.state() {
            ConnectionState::Idle | ConnectionState::Error { .. } => {
                // a direct connect starts a new attempt, just like a scan does
                self.deadlines.cool_down = None;
                self.view.send_modify(|view| view.clear_log());
            },
            ConnectionState::Scanning | ConnectionState::DeviceFound { .. } => {},
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting => {
                self.append_log("> Already connected");
                return;
            },
        }

        self.stop_scanning();

        self.next_link_id += 1;
        let id = LinkId(self.next_link_id);
        self.append_log(format!("> Connecting to {}...", address));

        match self.transport.connect(id, &address) {
            Ok(handle) => {
                self.link = Some(ActiveLink {
                    id,
                    address,
                    handle,
                    notify_characteristic: None,
                    write_characteristic: None,
                });
                self.deadlines.setup = Some(Instant::now() + self.settings.connect_timeout);
                self.set_state(ConnectionState::Connecting);
            },
            Err(err) => self.fail(err.to_string()),
        }
    }

    fn disconnect(&mut self) {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.set_state(ConnectionState::Disconnecting);
                self.append_log("> Disconnecting...");
                self.release_link();
                self.append_log("> Disconnected");
                self.set_state(ConnectionState::Idle);
            },
            ConnectionState::Scanning | ConnectionState::DeviceFound { .. } => {
                self.stop_scanning();
                self.append_log("> Scan stopped");
                self.set_state(ConnectionState::Idle);
            },
            ConnectionState::Idle | ConnectionState::Disconnecting | ConnectionState::Error { .. } => {},
        }
    }

    fn send_tare(&mut self) {
        if self.state() != ConnectionState::Connected {
            self.append_log("> Not connected");
            return;
        }

        let characteristic = match self.link.as_ref().and_then(|link| link.write_characteristic) {
            Some(characteristic) => characteristic,
            None => {
                self.append_log("> Write characteristic not found");
                return;
            },
        };

        self.append_log(format!("> Sending Tare: {}", format_hex(&COMMAND_TARE)));
        if let Some(link) = self.link.as_mut() {
            link.handle.write_characteristic(characteristic, &COMMAND_TARE);
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        if let Some(link) = event.link() {
            if self.link.as_ref().map(|active| active.id) != Some(link) {
                debug!("Ignoring event of released link {:?}", link);
                return;
            }
        }

        match event {
            TransportEvent::Advertisement { name, address, rssi } => self.on_advertisement(name, address, rssi),
            TransportEvent::ScanFailed { reason } => self.on_scan_failed(reason),
            TransportEvent::ConnectionChanged { status, state, .. } => self.on_connection_changed(status, state),
            TransportEvent::ServicesDiscovered { status, services, .. } => self.on_services_discovered(status, services),
            TransportEvent::DescriptorWriteResult { descriptor, status, .. } => self.on_descriptor_write(descriptor, status),
            TransportEvent::Notification { characteristic, value, .. } => self.on_notification(characteristic, value),
            TransportEvent::CharacteristicWriteResult { characteristic, status, .. } => self.on_characteristic_write(characteristic, status),
        }
    }

    fn on_scan_failed(&mut self, reason: String) {
        if !self.scanning {
            return;
        }

        // the transport has already given up on the scan
        self.scanning = false;
        self.fail(format!("Scan failed: {}", reason));
    }

    fn on_connection_changed(&mut self, status: i32, state: LinkState) {
        match (state, self.state()) {
            (LinkState::Connected, ConnectionState::Connecting) if status == GATT_SUCCESS => {
                self.append_log("> GATT Connected");
                self.set_state(ConnectionState::Connected);
                self.append_log("> Discovering services...");
                if let Some(link) = self.link.as_mut() {
                    link.handle.discover_services();
                }
            },
            (_, ConnectionState::Connecting) if status != GATT_SUCCESS => {
                self.fail(format!("Connection failed with status {}", status));
            },
            (LinkState::Connected, _) => {},
            (LinkState::Disconnected, _) => {
                if status == GATT_SUCCESS {
                    self.append_log("> Disconnected");
                } else {
                    self.append_log(format!("> Disconnected (status {})", status));
                }
                self.release_link();
                self.set_state(ConnectionState::Idle);
            },
        }
    }

    fn on_services_discovered(&mut self, status: i32, services: Vec<GattService>) {
        if self.state() != ConnectionState::Connected {
            return;
        }

        if status != GATT_SUCCESS {
            self.append_log(format!("> Service discovery failed: {}", status));
            self.fail("Service discovery failed");
            return;
        }

        self.append_log(format!("> Services discovered: {}", services.len()));

        let service = match services.iter().find(|service| service.uuid.eq(&SCALE_SERVICE)) {
            Some(service) => service,
            None => {
                self.append_log(format!("> Service {} not found", short_uuid(&SCALE_SERVICE)));
                self.fail("Service not found");
                return;
            },
        };

        let notify = match service.characteristic(&SCALE_NOTIFY_CHARACTERISTIC) {
            Some(characteristic) => characteristic,
            None => {
                self.append_log(format!("> Characteristic {} not found", short_uuid(&SCALE_NOTIFY_CHARACTERISTIC)));
                self.fail("Characteristic not found");
                return;
            },
        };

        if !notify.descriptors.contains(&CCCD) {
            self.append_log("> CCCD descriptor not found");
            self.fail("Descriptor not found");
            return;
        }

        let write_characteristic = services
            .iter()
            .find_map(|service| service.characteristic(&SCALE_WRITE_CHARACTERISTIC))
            .map(|characteristic| characteristic.uuid);
        if write_characteristic.is_none() {
            warn!("Scale has no write characteristic, tare will not be available");
        }

        self.append_log(format!("> Subscribing to {}...", short_uuid(&SCALE_NOTIFY_CHARACTERISTIC)));
        if let Some(link) = self.link.as_mut() {
            link.write_characteristic = write_characteristic;
            link.handle.write_descriptor(SCALE_NOTIFY_CHARACTERISTIC, CCCD, &ENABLE_NOTIFICATION_VALUE);
        }
    }

    fn on_descriptor_write(&mut self, descriptor: Uuid, status: i32) {
        if self.state() != ConnectionState::Connected || descriptor != CCCD {
            return;
        }

        if status != GATT_SUCCESS {
            self.append_log(format!("> Failed to enable notification: {}", status));
            self.fail("Failed to enable notifications");
            return;
        }

        if let Some(link) = self.link.as_mut() {
            link.notify_characteristic = Some(SCALE_NOTIFY_CHARACTERISTIC);
        }
        self.deadlines.setup = None;
        self.append_log("> Notification enabled");
    }

    fn on_notification(&mut self, characteristic: Uuid, value: Vec<u8>) {
        let subscribed = self.link.as_ref().and_then(|link| link.notify_characteristic);
        if self.state() != ConnectionState::Connected || subscribed != Some(characteristic) {
            debug!("Ignoring notification on {}", characteristic);
            return;
        }

        match decode(&value) {
            Ok(reading) => self.publish_reading(reading),
            Err(err) => {
                warn!("Dropping frame [{}]: {}", format_hex(&value), err);
                self.append_log(format!("> Parse error: {}", err));
            },
        }
    }

    fn publish_reading(&self, reading: Reading) {
        let line = format!("> RX: {} → {:.1}g", reading.raw_frame, reading.weight);
        debug!("{}", line);

        self.view.send_modify(|view| {
            view.log.push(line);
            view.reading = Some(reading);
        });
    }

    fn on_characteristic_write(&mut self, characteristic: Uuid, status: i32) {
        let expected = self.link.as_ref().and_then(|link| link.write_characteristic);
        if self.state() != ConnectionState::Connected || expected != Some(characteristic) {
            return;
        }

        if status == GATT_SUCCESS {
            self.append_log("> Tare command sent");
        } else {
            self.append_log(format!("> Write failed: {}", status));
            self.fail("Tare command failed");
        }
    }

    fn on_scan_timeout(&mut self) {
        self.deadlines.scan = None;

        match self.state() {
            ConnectionState::Scanning => {
                self.stop_scanning();
                self.append_log("> Scan timeout");
                self.fail("Device not found");
            },
            ConnectionState::DeviceFound { .. } => {
                self.stop_scanning();
                self.append_log("> Scan finished");
            },
            _ => self.stop_scanning(),
        }
    }

    fn on_setup_timeout(&mut self) {
        self.deadlines.setup = None;

        let pending_setup = self.link.as_ref().map_or(false, |link| link.notify_characteristic.is_none());
        if pending_setup {
            self.append_log("> Connection setup timed out");
            self.fail("Connection timed out");
        }
    }

    fn on_cool_down(&mut self) {
        self.deadlines.cool_down = None;

        if let ConnectionState::Error { .. } = self.state() {
            self.set_state(ConnectionState::Idle);
        }
    }
}

/// The public side of a running session: fire-and-forget commands plus the published view.
#[derive(Clone)]
pub struct SessionHandle {
    commands: UnboundedSender<SessionCommand>,
    view: watch::Receiver<SessionView>,
    cancel: CancellationToken,
}

impl SessionHandle {
    fn send(&self, command: SessionCommand) {
        if let Err(err) = self.commands.unbounded_send(command) {
            warn!("Scale session is not running, dropping {:?}", err.into_inner());
        }
    }

    pub fn start_scan(&self) {
        self.send(SessionCommand::StartScan);
    }

    pub fn connect_to_address(&self, address: impl Into<String>) {
        self.send(SessionCommand::ConnectToAddress(address.into()));
    }

    pub fn disconnect(&self) {
        self.send(SessionCommand::Disconnect);
    }

    pub fn send_tare(&self) {
        self.send(SessionCommand::SendTare);
    }

    pub fn state(&self) -> ConnectionState {
        self.view.borrow().state.clone()
    }

    pub fn reading(&self) -> Option<Reading> {
        self.view.borrow().reading.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.view.borrow().log.clone()
    }

    pub fn devices(&self) -> Vec<ScannedDevice> {
        self.view.borrow().devices.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Stops the session task; the link is closed and scanning stopped on the way out.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub fn spawn_session<T: Transport>(
    cancel: CancellationToken,
    transport: T,
    events: EventReceiver,
    settings: SessionSettings,
) -> (SessionHandle, JoinHandle<()>) {
    let (command_sender, command_receiver) = unbounded::<SessionCommand>();
    let (view_sender, view_receiver) = watch::channel(SessionView::default());

    let session = Session {
        transport,
        settings,
        view: view_sender,
        link: None,
        next_link_id: 0,
        scanning: false,
        discovered: IndexMap::new(),
        deadlines: Deadlines::default(),
    };

    let handle = spawn(session.run(cancel.clone(), command_receiver, events));

    let session_handle = SessionHandle {
        commands: command_sender,
        view: view_receiver,
        cancel,
    };

    (session_handle, handle)
}
