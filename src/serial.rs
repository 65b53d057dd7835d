//! Serial port backend for real hardware

use log::debug;
use serialport::{FlowControl, SerialPort};

use crate::{
    connection::SerialTransport,
    error::Error,
    interface::{Backend, PortHandle},
    loader::RomLoader,
};

/// A serial port picked by the user, open or closed
pub struct SerialPortHandle {
    name: String,
    pid: u16,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortHandle {
    /// `pid` is the USB product id of the adapter, `0` when not a USB port
    pub fn new(name: impl Into<String>, pid: u16) -> Self {
        SerialPortHandle {
            name: name.into(),
            pid,
            port: None,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, Error> {
        self.port.as_mut().ok_or(Error::PortClosed)
    }
}

impl PortHandle for SerialPortHandle {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&mut self, baud: u32) -> Result<(), Error> {
        if self.port.is_some() {
            return Ok(());
        }

        debug!("Opening {} at {} baud", self.name, baud);
        let port = serialport::new(&self.name, baud)
            .flow_control(FlowControl::None)
            .open()?;
        self.port = Some(port);

        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if let Some(port) = self.port.take() {
            debug!("Closing {}", self.name);
            drop(port);
        }

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.port_mut()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.port_mut()?.write_request_to_send(level)?;
        Ok(())
    }
}

/// Asks the user for a serial port
pub trait PortChooser {
    /// Returns [Error::Cancelled] when the user declines to pick one
    fn choose_port(&mut self) -> Result<SerialPortHandle, Error>;
}

/// A port known up front, for example from the command line
pub struct FixedPort {
    name: String,
    pid: u16,
}

impl FixedPort {
    pub fn new(name: impl Into<String>, pid: u16) -> Self {
        FixedPort {
            name: name.into(),
            pid,
        }
    }
}

impl PortChooser for FixedPort {
    fn choose_port(&mut self) -> Result<SerialPortHandle, Error> {
        Ok(SerialPortHandle::new(self.name.clone(), self.pid))
    }
}

/// [Backend] driving a device through a serial port and its ROM bootloader
pub struct SerialBackend<C> {
    chooser: C,
}

impl<C: PortChooser> SerialBackend<C> {
    pub fn new(chooser: C) -> Self {
        SerialBackend { chooser }
    }
}

impl<C: PortChooser> Backend for SerialBackend<C> {
    type Port = SerialPortHandle;
    type Transport = SerialTransport;
    type Loader = RomLoader;

    fn request_port(&mut self) -> Result<SerialPortHandle, Error> {
        self.chooser.choose_port()
    }

    // The transport gets its own OS handle to the port; the device is only
    // released once both the transport and the port handle let go of it.
    fn open_transport(
        &mut self,
        port: &mut SerialPortHandle,
        trace: bool,
    ) -> Result<SerialTransport, Error> {
        let cloned = port.port_mut()?.try_clone()?;

        Ok(SerialTransport::new(cloned, port.pid(), trace))
    }

    fn new_loader(&mut self) -> RomLoader {
        RomLoader::new()
    }
}
