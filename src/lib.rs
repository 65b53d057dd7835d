//! Pick a firmware variant and flash it onto an ESP32-class device
//!
//! The [Session] owns the serial port, transport and bootloader client and
//! implements the lazy and eager connection policies. The
//! [FlashOrchestrator] runs one complete flash attempt on top of a session:
//! bootloader entry, firmware retrieval, transfer, reset and a teardown which
//! runs on every exit path.
//!
//! Everything that touches hardware sits behind the traits in [interface],
//! with serial implementations in [serial], [connection] and [loader].

pub use self::{
    error::{ConnectError, Error, FetchError, FlashError},
    firmware::{FirmwareImage, FirmwareSelection},
    orchestrator::{FlashOrchestrator, FlashReport, FlashWarning},
    session::{ConnectionPolicy, Session, SessionState, SessionStatus},
};

#[cfg(feature = "cli")]
pub mod cli;
pub mod connection;
pub mod error;
pub mod firmware;
pub mod flasher;
pub mod interface;
pub mod loader;
#[cfg(feature = "cli")]
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod serial;
pub mod session;
pub mod targets;
