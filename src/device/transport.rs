//! The seam between the session state machine and a bluetooth stack.
//!
//! Operations are fire-and-forget: their outcome arrives later as a
//! [`TransportEvent`] on the channel handed to the transport when it was created.

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::DeviceError;

/// Identifies one connection attempt. Events of a link the session no longer
/// holds are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|characteristic| characteristic.uuid.eq(uuid))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Advertisement {
        name: String,
        address: String,
        rssi: i16,
    },
    ScanFailed {
        reason: String,
    },
    ConnectionChanged {
        link: LinkId,
        status: i32,
        state: LinkState,
    },
    ServicesDiscovered {
        link: LinkId,
        status: i32,
        services: Vec<GattService>,
    },
    DescriptorWriteResult {
        link: LinkId,
        descriptor: Uuid,
        status: i32,
    },
    Notification {
        link: LinkId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    CharacteristicWriteResult {
        link: LinkId,
        characteristic: Uuid,
        status: i32,
    },
}

impl TransportEvent {
    pub fn link(&self) -> Option<LinkId> {
        match self {
            TransportEvent::Advertisement { .. } | TransportEvent::ScanFailed { .. } => None,
            TransportEvent::ConnectionChanged { link, .. }
            | TransportEvent::ServicesDiscovered { link, .. }
            | TransportEvent::DescriptorWriteResult { link, .. }
            | TransportEvent::Notification { link, .. }
            | TransportEvent::CharacteristicWriteResult { link, .. } => Some(*link),
        }
    }
}

pub type EventSender = UnboundedSender<TransportEvent>;
pub type EventReceiver = UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    unbounded()
}

pub trait Transport: Send + 'static {
    /// Errors returned here mean the transport is unusable (no adapter, no scanner).
    fn start_scan(&mut self, device_name: &str) -> Result<(), DeviceError>;

    fn stop_scan(&mut self);

    fn connect(&mut self, link: LinkId, address: &str) -> Result<Box<dyn Link>, DeviceError>;
}

/// A connection handle. Implementations must release the native connection in
/// `close` and when dropped, and must not emit events afterwards.
pub trait Link: Send {
    fn discover_services(&mut self);

    fn write_descriptor(&mut self, characteristic: Uuid, descriptor: Uuid, value: &[u8]);

    fn write_characteristic(&mut self, characteristic: Uuid, value: &[u8]);

    fn close(&mut self);
}
