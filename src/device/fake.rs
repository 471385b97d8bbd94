//! A transport that records what the session asks of it. Tests play the
//! bluetooth stack by pushing `TransportEvent`s into the session themselves.

use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::device::transport::{Link, LinkId, Transport};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(String),
    StopScan,
    Connect(LinkId, String),
    DiscoverServices(LinkId),
    WriteDescriptor(LinkId, Uuid, Uuid, Vec<u8>),
    WriteCharacteristic(LinkId, Uuid, Vec<u8>),
    Close(LinkId),
}

type Calls = Arc<Mutex<Vec<Call>>>;

pub struct FakeTransport {
    calls: Calls,
    has_adapter: bool,
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport { calls: Arc::new(Mutex::new(Vec::new())), has_adapter: true }
    }

    pub fn without_adapter() -> Self {
        FakeTransport { has_adapter: false, ..FakeTransport::new() }
    }

    pub fn calls(&self) -> Calls {
        self.calls.clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for FakeTransport {
    fn start_scan(&mut self, device_name: &str) -> Result<(), DeviceError> {
        if !self.has_adapter {
            return Err(DeviceError::NoAdapter);
        }
        self.record(Call::StartScan(device_name.to_string()));
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.record(Call::StopScan);
    }

    fn connect(&mut self, link: LinkId, address: &str) -> Result<Box<dyn Link>, DeviceError> {
        if !self.has_adapter {
            return Err(DeviceError::NoAdapter);
        }
        self.record(Call::Connect(link, address.to_string()));
        Ok(Box::new(FakeLink { id: link, calls: self.calls.clone(), closed: false }))
    }
}

struct FakeLink {
    id: LinkId,
    calls: Calls,
    closed: bool,
}

impl FakeLink {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Link for FakeLink {
    fn discover_services(&mut self) {
        self.record(Call::DiscoverServices(self.id));
    }

    fn write_descriptor(&mut self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) {
        self.record(Call::WriteDescriptor(self.id, characteristic, descriptor, value.to_vec()));
    }

    fn write_characteristic(&mut self, characteristic: Uuid, value: &[u8]) {
        self.record(Call::WriteCharacteristic(self.id, characteristic, value.to_vec()));
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.record(Call::Close(self.id));
        }
    }
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.close();
    }
}
