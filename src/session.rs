//! Connection state of one device
//!
//! A [Session] owns the port, transport and bootloader client handed out by
//! its [Backend]. With the [lazy](ConnectionPolicy::Lazy) policy the device
//! keeps running its application until a flash starts; the
//! [eager](ConnectionPolicy::Eager) policy synchronizes with the bootloader
//! as soon as the port is opened.

use std::{
    sync::{Arc, Mutex, PoisonError},
    thread::sleep,
    time::Duration,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, VariantNames};

use crate::{
    connection::reset::hard_reset,
    error::{ConnectError, Error, FlashError},
    flasher::FlashRequest,
    interface::{Backend, Loader, PortHandle, Transport},
    progress::ProgressCallbacks,
    targets::DeviceInfo,
};

/// Baud rate the ROM bootloader listens at
pub const BAUD: u32 = 115_200;
/// Time given to the OS to release a port before it is reopened
pub const PORT_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// When to synchronize with the bootloader
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPolicy {
    /// Only open the port on connect, enter the bootloader right before
    /// flashing
    #[default]
    Lazy,
    /// Enter the bootloader on connect and stay connected between flashes
    Eager,
}

/// Where a [Session] is in its lifecycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    Flashing,
    /// A flash attempt failed and is being torn down
    Error,
}

/// Shared, read-mostly view of a session's state
///
/// Clones observe the same state. Whoever wants to start a flash must win
/// [SessionStatus::try_begin_flash] first.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    state: Arc<Mutex<SessionState>>,
}

impl SessionStatus {
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can_connect(&self) -> bool {
        self.state() == SessionState::Disconnected
    }

    pub fn can_flash(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Move from Connected to Flashing, or report the state in the way
    pub fn try_begin_flash(&self) -> Result<(), SessionState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            SessionState::Connected => {
                *state = SessionState::Flashing;
                Ok(())
            }
            other => Err(other),
        }
    }

    fn set(&self, new: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != new {
            debug!("Session state: {} -> {}", *state, new);
            *state = new;
        }
    }
}

/// The connection to one device
pub struct Session<B: Backend> {
    backend: B,
    policy: ConnectionPolicy,
    trace: bool,
    port: Option<B::Port>,
    transport: Option<B::Transport>,
    loader: Option<B::Loader>,
    /// Whether `loader` has synchronized with the bootloader since the last
    /// reset
    in_bootloader: bool,
    device: Option<DeviceInfo>,
    status: SessionStatus,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B, policy: ConnectionPolicy) -> Self {
        Session {
            backend,
            policy,
            trace: false,
            port: None,
            transport: None,
            loader: None,
            in_bootloader: false,
            device: None,
            status: SessionStatus::default(),
        }
    }

    /// Log every frame exchanged with the device
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// A handle observing this session's state
    pub fn status(&self) -> SessionStatus {
        self.status.clone()
    }

    pub fn port(&self) -> Option<&B::Port> {
        self.port.as_ref()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// The device found by the last handshake, if still connected
    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    /// Ask the user for a port and connect to it according to the policy
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        match self.state() {
            SessionState::Connected => return Ok(()),
            SessionState::Disconnected => {}
            state => return Err(ConnectError::Busy(state)),
        }

        let port = self.backend.request_port().map_err(|err| match err {
            Error::Cancelled => ConnectError::Cancelled,
            err => ConnectError::NoPort(err),
        })?;
        info!("Using port {}", port.name());

        self.port = Some(port);

        let result = match self.policy {
            ConnectionPolicy::Lazy => self.open_lazy(),
            ConnectionPolicy::Eager => self.open_eager(),
        };

        match result {
            Ok(()) => {
                self.status.set(SessionState::Connected);
                Ok(())
            }
            Err(err) => {
                self.release();
                self.status.set(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    fn open_lazy(&mut self) -> Result<(), ConnectError> {
        let Some(port) = self.port.as_mut() else {
            return Err(ConnectError::NoPort(Error::PortClosed));
        };
        let open_error = |port: &B::Port, source| ConnectError::Open {
            port: port.name(),
            source,
        };

        port.open(BAUD).map_err(|e| open_error(port, e))?;
        // Keep the application running: IO0 released, EN high
        port.set_dtr(false).map_err(|e| open_error(port, e))?;
        port.set_rts(false).map_err(|e| open_error(port, e))?;

        let transport = self
            .backend
            .open_transport(port, self.trace)
            .map_err(|e| open_error(port, e))?;
        self.transport = Some(transport);
        self.in_bootloader = false;

        Ok(())
    }

    fn open_eager(&mut self) -> Result<(), ConnectError> {
        let Some(port) = self.port.as_mut() else {
            return Err(ConnectError::NoPort(Error::PortClosed));
        };

        port.open(BAUD).map_err(|source| ConnectError::Open {
            port: port.name(),
            source,
        })?;
        let transport = self
            .backend
            .open_transport(port, self.trace)
            .map_err(|source| ConnectError::Open {
                port: port.name(),
                source,
            })?;
        let transport = self.transport.insert(transport);
        let loader = self.loader.insert(self.backend.new_loader());

        let device = loader
            .handshake(transport)
            .map_err(ConnectError::Handshake)?;
        self.device = Some(device);
        self.in_bootloader = true;

        Ok(())
    }

    /// Release every resource and return to Disconnected
    pub fn disconnect(&mut self) {
        self.release();
        self.status.set(SessionState::Disconnected);
    }

    // Loader first, then transport, then port; a failing step does not
    // stop the next one.
    fn release(&mut self) {
        self.loader = None;

        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.disconnect() {
                warn!("Failed to disconnect transport: {err}");
            }
        }

        if let Some(mut port) = self.port.take() {
            if let Err(err) = port.close() {
                warn!("Failed to close port {}: {err}", port.name());
            }
        }

        self.in_bootloader = false;
        self.device = None;
    }

    /// Claim the session for a flash attempt
    pub(crate) fn begin_flash(&mut self) -> Result<(), FlashError> {
        self.status.try_begin_flash().map_err(|state| match state {
            SessionState::Disconnected => FlashError::NotConnected,
            _ => FlashError::Busy,
        })
    }

    pub(crate) fn mark_failed(&mut self) {
        self.status.set(SessionState::Error);
    }

    /// Make sure the loader is synchronized with the device's bootloader
    pub(crate) fn enter_bootloader(&mut self) -> Result<DeviceInfo, Error> {
        match self.policy {
            ConnectionPolicy::Lazy => self.reopen_into_bootloader(),
            ConnectionPolicy::Eager => self.resync(),
        }
    }

    // The running transport holds its own handle on the port, so it has to
    // be gone before the port can be closed and reopened.
    fn reopen_into_bootloader(&mut self) -> Result<DeviceInfo, Error> {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect()?;
        }
        self.loader = None;
        self.in_bootloader = false;

        let port = self.port.as_mut().ok_or(Error::PortClosed)?;
        port.close()?;
        sleep(PORT_SETTLE_DELAY);
        port.open(BAUD)?;

        let transport = self.backend.open_transport(port, self.trace)?;
        let transport = self.transport.insert(transport);
        let loader = self.loader.insert(self.backend.new_loader());

        let device = loader.handshake(transport)?;
        self.device = Some(device.clone());
        self.in_bootloader = true;

        Ok(device)
    }

    fn resync(&mut self) -> Result<DeviceInfo, Error> {
        if self.in_bootloader && self.loader.is_some() {
            if let Some(device) = &self.device {
                debug!("Bootloader still synchronized");
                return Ok(device.clone());
            }
        }

        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::TransportDisconnected)?;
        let backend = &mut self.backend;
        let loader = self.loader.get_or_insert_with(|| backend.new_loader());

        let device = loader.handshake(transport)?;
        self.device = Some(device.clone());
        self.in_bootloader = true;

        Ok(device)
    }

    pub(crate) fn write_flash(
        &mut self,
        request: &FlashRequest<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::TransportDisconnected)?;
        let loader = self.loader.as_mut().ok_or(Error::NotSynchronized)?;

        loader.write_flash(transport, request, progress)
    }

    /// Restart the device into the freshly written application
    pub(crate) fn hard_reset(&mut self) -> Result<(), Error> {
        self.in_bootloader = false;

        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::TransportDisconnected)?;

        hard_reset(transport)
    }

    /// Return to the policy's resting state after a flash attempt
    pub(crate) fn finish_flash(&mut self) {
        match self.policy {
            ConnectionPolicy::Eager if self.transport.is_some() => {
                // The next flash has to handshake again
                self.in_bootloader = false;
                self.status.set(SessionState::Connected);
            }
            _ => {
                self.release();
                self.status.set(SessionState::Disconnected);
            }
        }
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        // Field order would close the port before the transport lets go of it
        if self.port.is_some() || self.transport.is_some() || self.loader.is_some() {
            self.release();
            self.status.set(SessionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_flash_can_begin() {
        let status = SessionStatus::default();
        assert!(status.can_connect());
        assert_eq!(
            status.try_begin_flash(),
            Err(SessionState::Disconnected)
        );

        status.set(SessionState::Connected);
        assert!(status.can_flash());

        let other = status.clone();
        assert_eq!(status.try_begin_flash(), Ok(()));
        assert_eq!(other.try_begin_flash(), Err(SessionState::Flashing));
        assert_eq!(other.state(), SessionState::Flashing);
        assert!(!other.can_connect());
        assert!(!other.can_flash());
    }

    #[test]
    fn policy_names() {
        assert_eq!(ConnectionPolicy::default(), ConnectionPolicy::Lazy);
        assert_eq!(ConnectionPolicy::Eager.to_string(), "eager");
        assert_eq!(SessionState::Flashing.to_string(), "Flashing");
    }
}
