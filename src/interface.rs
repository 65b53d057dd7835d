//! Seams between the session logic and the hardware it drives
//!
//! A [Backend] hands out the three resources a [Session](crate::Session)
//! juggles: the user-selected [PortHandle], a [Transport] built over it, and
//! a bootloader [Loader] speaking through that transport. The serial
//! implementations live in [crate::serial]; tests substitute recording
//! fakes.

use crate::{
    error::Error,
    flasher::FlashRequest,
    progress::ProgressCallbacks,
    targets::DeviceInfo,
};

/// A serial port chosen by the user
///
/// The handle outlives any number of open/close cycles. While a
/// [Transport] built over it is alive the port must not be closed.
pub trait PortHandle {
    /// Human readable name of the port
    fn name(&self) -> String;

    /// Open the port at the given baud rate
    fn open(&mut self, baud: u32) -> Result<(), Error>;

    /// Close the port; closing a closed port is not an error
    fn close(&mut self) -> Result<(), Error>;

    fn is_open(&self) -> bool;

    /// Drive the DTR line
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;

    /// Drive the RTS line
    fn set_rts(&mut self, level: bool) -> Result<(), Error>;
}

/// Framing layer over an open port, exclusively holding its reader/writer
pub trait Transport {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;

    fn set_rts(&mut self, level: bool) -> Result<(), Error>;

    /// Release the port; the transport is unusable afterwards
    fn disconnect(&mut self) -> Result<(), Error>;
}

/// Bootloader protocol client
pub trait Loader<T: Transport> {
    /// Reset the device into its bootloader and synchronize with it
    fn handshake(&mut self, transport: &mut T) -> Result<DeviceInfo, Error>;

    /// Write an image to flash, reporting progress as bytes are accepted
    fn write_flash(
        &mut self,
        transport: &mut T,
        request: &FlashRequest<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error>;
}

/// Source of ports, transports and loaders
pub trait Backend {
    type Port: PortHandle;
    type Transport: Transport;
    type Loader: Loader<Self::Transport>;

    /// Ask the user which port to use
    fn request_port(&mut self) -> Result<Self::Port, Error>;

    /// Build a transport over an open port
    fn open_transport(&mut self, port: &mut Self::Port, trace: bool)
        -> Result<Self::Transport, Error>;

    fn new_loader(&mut self) -> Self::Loader;
}
