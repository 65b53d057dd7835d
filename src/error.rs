//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use slip_codec::SlipError;
use strum::VariantNames;
use thiserror::Error;

use crate::{
    connection::command::CommandType,
    flasher::FlashFrequency,
    session::SessionState,
    targets::Chip,
};

/// Errors raised by ports, transports and the bootloader client
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(meditador::cancelled))]
    Cancelled,

    #[error("Unrecognized magic value: {0:#x}")]
    #[diagnostic(
        code(meditador::chip_detect_error),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetectError(u32),

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(meditador::no_serial),
        help("Make sure you have connected a device to the host system")
    )]
    NoSerial,

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(meditador::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("The serial port is not open")]
    #[diagnostic(code(meditador::port_closed))]
    PortClosed,

    #[error("The transport has already been disconnected")]
    #[diagnostic(code(meditador::transport_disconnected))]
    TransportDisconnected,

    #[error("The bootloader has not been synchronized with")]
    #[diagnostic(
        code(meditador::not_synchronized),
        help("Run the handshake before writing to flash")
    )]
    NotSynchronized,

    #[error("The ROM bootloader can not erase the whole flash chip")]
    #[diagnostic(
        code(meditador::erase_all_unsupported),
        help("Only the sectors covered by the image are erased when writing")
    )]
    EraseAllUnsupported,

    #[error("The specified flash frequency '{frequency}' is not supported by the {chip}")]
    #[diagnostic(code(meditador::unsupported_flash_frequency))]
    UnsupportedFlashFrequency {
        chip: Chip,
        frequency: FlashFrequency,
    },

    #[error("The image of {0} bytes is too large to be written")]
    #[diagnostic(code(meditador::image_too_large))]
    ImageTooLarge(usize),

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Configuration key {0}")]
    #[diagnostic(
        code(meditador::misplaced_key),
        help("Move the key into the section named above")
    )]
    MisplacedKey(String),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(meditador::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),

    #[error("Internal Error")]
    InternalError,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<SlipError> for Error {
    fn from(err: SlipError) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(meditador::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(meditador::connection_failed),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(meditador::slip_framing),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    FramingError,

    #[error("Download mode successfully detected, but getting no sync reply")]
    #[diagnostic(
        code(meditador::no_sync_reply),
        help("The serial TX path seems to be down")
    )]
    NoSyncReply,

    #[error("Received packet to large for buffer")]
    #[diagnostic(
        code(meditador::oversized_packet),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    OverSizedPacket,

    #[error("Timeout while running {0}command")]
    #[diagnostic(code(meditador::timeout))]
    Timeout(TimedOutCommand),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(meditador::serial_error))]
    Serial(#[source] serialport::Error),

    #[error("Wrong boot mode detected ({0})! The chip needs to be in download mode.")]
    #[diagnostic(code(meditador::wrong_boot_mode))]
    WrongBootMode(String),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

impl From<SlipError> for ConnectionError {
    fn from(err: SlipError) -> Self {
        match err {
            SlipError::FramingError => Self::FramingError,
            SlipError::OversizedPacket => Self::OverSizedPacket,
            SlipError::ReadError(io) => Self::from(io),
            SlipError::EndOfStream => Self::FramingError,
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(meditador::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(meditador::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(meditador::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(meditador::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(meditador::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(meditador::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(meditador::rom::deflate))]
    DeflateError = 0x0b,

    #[default]
    #[error("Other")]
    #[diagnostic(code(meditador::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// An error originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, kind: RomErrorKind) -> RomError {
        RomError { command, kind }
    }
}

/// Failure to bring a session into the connected state
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("No serial port was selected")]
    #[diagnostic(
        code(meditador::connect::cancelled),
        help("Select the port of your device to continue")
    )]
    Cancelled,

    #[error("No compatible serial port is available")]
    #[diagnostic(
        code(meditador::connect::no_port),
        help("Make sure the device is plugged in and not in use by another application")
    )]
    NoPort(#[source] Error),

    #[error("Failed to open serial port '{port}'")]
    #[diagnostic(
        code(meditador::connect::open),
        help("Make sure the port is not in use by another application")
    )]
    Open {
        port: String,
        #[source]
        source: Error,
    },

    #[error("Failed to synchronize with the bootloader")]
    #[diagnostic(code(meditador::connect::handshake))]
    Handshake(#[source] Error),

    #[error("The session is busy ({0})")]
    #[diagnostic(code(meditador::connect::busy))]
    Busy(SessionState),
}

/// Failure to retrieve a firmware image
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FetchError {
    #[error("Firmware '{path}' was not found")]
    #[diagnostic(code(meditador::fetch::not_found))]
    NotFound { path: String, status: Option<u16> },

    #[error("Request for '{url}' failed")]
    #[diagnostic(code(meditador::fetch::request))]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to read firmware '{path}'")]
    #[diagnostic(code(meditador::fetch::io))]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Fatal failure of a flash attempt
///
/// Every variant except [FlashError::NotConnected] and [FlashError::Busy] is
/// reported after teardown has already run.
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FlashError {
    #[error("No device is connected")]
    #[diagnostic(
        code(meditador::flash::not_connected),
        help("Connect to a device before flashing")
    )]
    NotConnected,

    #[error("A flash operation is already in progress")]
    #[diagnostic(code(meditador::flash::busy))]
    Busy,

    #[error("Failed to put the device into bootloader mode")]
    #[diagnostic(
        code(meditador::flash::bootloader_entry),
        help("Try holding the BOOT button while connecting, then try again")
    )]
    BootloaderEntry(#[source] Error),

    #[error("Firmware '{path}' was not found")]
    #[diagnostic(
        code(meditador::flash::firmware_not_found),
        help("Check the selected options and the firmware location")
    )]
    FirmwareNotFound { path: String },

    #[error("Failed to fetch the firmware")]
    #[diagnostic(transparent)]
    Fetch(#[source] FetchError),

    #[error("Failed to write the firmware to the device")]
    #[diagnostic(code(meditador::flash::transfer))]
    Transfer(#[source] Error),
}

impl From<FetchError> for FlashError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { path, .. } => FlashError::FirmwareNotFound { path },
            err => FlashError::Fetch(err),
        }
    }
}

/// Invalid firmware option value
#[derive(Debug, Diagnostic, Error)]
#[error("Invalid {option} '{value}'")]
#[diagnostic(
    code(meditador::invalid_selection),
    help("Option values may only contain letters, digits, '-' and '_'")
)]
pub struct SelectionError {
    pub option: &'static str,
    pub value: String,
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}

fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> ConnectionError
where
    E: Into<serialport::Error>,
{
    use io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
        ErrorKind::NotFound => ConnectionError::DeviceNotFound,
        _ => ConnectionError::Serial(err.into()),
    }
}
