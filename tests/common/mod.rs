#![allow(dead_code)]

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use meditador_flash::{
    error::{ConnectionError, FetchError},
    firmware::FirmwareSource,
    flasher::FlashRequest,
    interface::{Backend, Loader, PortHandle, Transport},
    progress::{ProgressCallbacks, ProgressEvent, ProgressSink},
    targets::{Chip, DeviceInfo},
    ConnectionPolicy,
    Error,
    Session,
};

/// Knobs for making individual steps fail
#[derive(Debug, Default, Clone)]
pub struct Faults {
    pub cancel_chooser: bool,
    pub no_port: bool,
    pub open: bool,
    pub handshake: bool,
    pub write: bool,
    pub reset: bool,
    pub transport_disconnect: bool,
    /// Fail transport disconnects only once an image has been written
    pub disconnect_after_write: bool,
}

/// Everything the fakes did, in order
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    calls: Rc<RefCell<Vec<String>>>,
    faults: Rc<RefCell<Faults>>,
    transports: Rc<RefCell<usize>>,
    loaders: Rc<RefCell<usize>>,
}

impl Recorder {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.borrow_mut().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn faults(&self) -> Faults {
        self.faults.borrow().clone()
    }

    pub fn set_faults(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.faults.borrow_mut());
    }

    /// Position of the first call equal to `call`
    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c == call)
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.borrow().iter().filter(|c| *c == call).count()
    }

    fn next_transport(&self) -> usize {
        let mut n = self.transports.borrow_mut();
        *n += 1;
        *n
    }

    fn next_loader(&self) -> usize {
        let mut n = self.loaders.borrow_mut();
        *n += 1;
        *n
    }
}

pub struct MockPort {
    open: bool,
    recorder: Recorder,
}

impl PortHandle for MockPort {
    fn name(&self) -> String {
        "/dev/ttyMOCK0".to_string()
    }

    fn open(&mut self, baud: u32) -> Result<(), Error> {
        self.recorder.record(format!("port.open({baud})"));
        if self.recorder.faults().open {
            return Err(Error::SerialNotFound(self.name()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.recorder.record("port.close");
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.recorder.record(format!("port.dtr({level})"));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.recorder.record(format!("port.rts({level})"));
        Ok(())
    }
}

pub struct MockTransport {
    id: usize,
    connected: bool,
    recorder: Recorder,
}

impl MockTransport {
    fn name(&self) -> String {
        format!("transport#{}", self.id)
    }
}

impl Transport for MockTransport {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.recorder.record(format!("{}.dtr({level})", self.name()));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.recorder.record(format!("{}.rts({level})", self.name()));
        if self.recorder.faults().reset {
            return Err(Error::Connection(ConnectionError::ConnectionFailed));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.recorder.record(format!("{}.disconnect", self.name()));
        if !self.connected {
            return Err(Error::TransportDisconnected);
        }
        self.connected = false;
        let faults = self.recorder.faults();
        let written = self
            .recorder
            .calls()
            .iter()
            .any(|call| call.contains("write_flash"));
        if faults.transport_disconnect || (faults.disconnect_after_write && written) {
            return Err(Error::Connection(ConnectionError::ConnectionFailed));
        }
        Ok(())
    }
}

pub struct MockLoader {
    id: usize,
    recorder: Recorder,
}

impl MockLoader {
    fn name(&self) -> String {
        format!("loader#{}", self.id)
    }
}

impl Drop for MockLoader {
    fn drop(&mut self) {
        self.recorder.record(format!("{}.drop", self.name()));
    }
}

impl Loader<MockTransport> for MockLoader {
    fn handshake(&mut self, transport: &mut MockTransport) -> Result<DeviceInfo, Error> {
        self.recorder
            .record(format!("{}.handshake({})", self.name(), transport.name()));
        if self.recorder.faults().handshake {
            return Err(Error::Connection(ConnectionError::NoSyncReply));
        }

        Ok(DeviceInfo {
            chip: Chip::Esp32c3,
        })
    }

    fn write_flash(
        &mut self,
        transport: &mut MockTransport,
        request: &FlashRequest<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.recorder.record(format!(
            "{}.write_flash({}, {} @ {:#x})",
            self.name(),
            transport.name(),
            request.data.len(),
            request.address
        ));

        let total = request.data.len();
        progress.init(request.address, total);
        progress.update(total / 2);

        if self.recorder.faults().write {
            return Err(Error::Flashing(ConnectionError::ConnectionFailed));
        }

        progress.update(total);
        progress.finish();

        Ok(())
    }
}

pub struct MockBackend {
    recorder: Recorder,
}

impl Backend for MockBackend {
    type Port = MockPort;
    type Transport = MockTransport;
    type Loader = MockLoader;

    fn request_port(&mut self) -> Result<MockPort, Error> {
        self.recorder.record("request_port");
        let faults = self.recorder.faults();
        if faults.cancel_chooser {
            return Err(Error::Cancelled);
        }
        if faults.no_port {
            return Err(Error::NoSerial);
        }

        Ok(MockPort {
            open: false,
            recorder: self.recorder.clone(),
        })
    }

    fn open_transport(&mut self, port: &mut MockPort, _trace: bool) -> Result<MockTransport, Error> {
        if !port.is_open() {
            return Err(Error::PortClosed);
        }

        let id = self.recorder.next_transport();
        self.recorder.record(format!("transport#{id}.new"));

        Ok(MockTransport {
            id,
            connected: true,
            recorder: self.recorder.clone(),
        })
    }

    fn new_loader(&mut self) -> MockLoader {
        let id = self.recorder.next_loader();
        self.recorder.record(format!("loader#{id}.new"));

        MockLoader {
            id,
            recorder: self.recorder.clone(),
        }
    }
}

/// A session over the fakes, plus the recorder observing them
pub fn session(policy: ConnectionPolicy) -> (Session<MockBackend>, Recorder) {
    let recorder = Recorder::default();
    let backend = MockBackend {
        recorder: recorder.clone(),
    };

    (Session::new(backend, policy), recorder)
}

/// Firmware images held in memory
pub struct MemorySource {
    images: HashMap<String, Vec<u8>>,
    recorder: Recorder,
}

impl MemorySource {
    pub fn new(recorder: &Recorder) -> Self {
        MemorySource {
            images: HashMap::new(),
            recorder: recorder.clone(),
        }
    }

    pub fn with_image(mut self, path: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(path.to_string(), bytes);
        self
    }
}

impl FirmwareSource for MemorySource {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        self.recorder.record(format!("fetch({path})"));

        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                path: path.to_string(),
                status: Some(404),
            })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Progress sink remembering every percentage it was shown
#[derive(Debug, Default)]
pub struct ProgressLog {
    pub percents: Vec<u8>,
    pub events: Vec<ProgressEvent>,
    pub finished: usize,
}

impl ProgressSink for ProgressLog {
    fn on_progress(&mut self, event: &ProgressEvent, percent: u8) {
        self.events.push(*event);
        self.percents.push(percent);
    }

    fn on_finish(&mut self) {
        self.finished += 1;
    }
}
