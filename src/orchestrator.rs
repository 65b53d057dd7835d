//! One complete flash attempt
//!
//! [FlashOrchestrator::flash] enters the bootloader, fetches the selected
//! image, writes it, resets the device and finally returns the session to its
//! resting state. The last step is owned by a [FlashGuard], so it also runs
//! when an earlier step fails or panics.

use std::ops::{Deref, DerefMut};

use log::{error, info, warn};
use miette::Diagnostic;
use thiserror::Error;

use crate::{
    error::{Error, FlashError},
    firmware::{FirmwareImage, FirmwareSelection, FirmwareSource},
    flasher::{FlashRequest, WriteFlashOptions},
    interface::Backend,
    progress::{ClampedProgress, ProgressSink},
    session::Session,
    targets::DeviceInfo,
};

/// Something that went wrong without failing the attempt
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum FlashWarning {
    #[error("Failed to reset the device after flashing")]
    #[diagnostic(
        code(meditador::flash::reset),
        help("Press the device's reset button to start the new firmware")
    )]
    Reset(#[source] Error),
}

/// Outcome of a successful flash
#[derive(Debug)]
pub struct FlashReport {
    pub device: DeviceInfo,
    pub selection: FirmwareSelection,
    pub bytes_written: usize,
    pub warnings: Vec<FlashWarning>,
}

/// Runs flash attempts against a [Session]
pub struct FlashOrchestrator {
    source: Box<dyn FirmwareSource>,
    options: WriteFlashOptions,
}

impl FlashOrchestrator {
    pub fn new(source: Box<dyn FirmwareSource>) -> Self {
        FlashOrchestrator {
            source,
            options: WriteFlashOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WriteFlashOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &WriteFlashOptions {
        &self.options
    }

    /// Write the image for `selection` to the connected device
    ///
    /// Fails with [FlashError::NotConnected] or [FlashError::Busy] without
    /// touching the session when it is not ready. Once started, the session
    /// ends up Disconnected (lazy policy) or Connected (eager policy) no
    /// matter how the attempt ends.
    pub fn flash<B: Backend>(
        &self,
        session: &mut Session<B>,
        selection: &FirmwareSelection,
        sink: &mut dyn ProgressSink,
    ) -> Result<FlashReport, FlashError> {
        session.begin_flash()?;

        let mut guard = FlashGuard::new(session);
        let result = self.run(&mut *guard, selection, sink);

        if let Err(err) = &result {
            error!("Flashing {selection} failed: {err}");
            guard.mark_failed();
        }

        drop(guard);
        result
    }

    fn run<B: Backend>(
        &self,
        session: &mut Session<B>,
        selection: &FirmwareSelection,
        sink: &mut dyn ProgressSink,
    ) -> Result<FlashReport, FlashError> {
        info!("Entering bootloader");
        let device = session
            .enter_bootloader()
            .map_err(FlashError::BootloaderEntry)?;

        let path = selection.resource_path();
        info!("Fetching {} from {}", path, self.source.describe());
        let image = FirmwareImage::merged(self.source.fetch(&path)?);

        info!(
            "Writing {} bytes to the {} at {:#x}",
            image.bytes.len(),
            device.chip,
            image.load_address
        );
        let request = FlashRequest {
            data: &image.bytes,
            address: image.load_address,
            options: self.options,
        };
        let mut progress = ClampedProgress::new(sink);
        session
            .write_flash(&request, &mut progress)
            .map_err(FlashError::Transfer)?;
        progress.complete();

        let bytes_written = image.bytes.len();
        drop(image);

        let mut warnings = Vec::new();
        if let Err(err) = session.hard_reset() {
            warn!("Failed to reset the device: {err}");
            warnings.push(FlashWarning::Reset(err));
        }

        info!("Flashed {selection}");

        Ok(FlashReport {
            device,
            selection: selection.clone(),
            bytes_written,
            warnings,
        })
    }
}

/// Exclusive access to a session for the duration of a flash attempt
///
/// Dropping the guard returns the session to its resting state.
pub struct FlashGuard<'a, B: Backend> {
    session: &'a mut Session<B>,
}

impl<'a, B: Backend> FlashGuard<'a, B> {
    fn new(session: &'a mut Session<B>) -> Self {
        FlashGuard { session }
    }
}

impl<B: Backend> Deref for FlashGuard<'_, B> {
    type Target = Session<B>;

    fn deref(&self) -> &Session<B> {
        self.session
    }
}

impl<B: Backend> DerefMut for FlashGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Session<B> {
        self.session
    }
}

impl<B: Backend> Drop for FlashGuard<'_, B> {
    fn drop(&mut self) {
        self.session.finish_flash();
    }
}

/// Identify the connected device
///
/// Runs the same bootloader entry and teardown as a flash, without writing
/// anything.
pub fn board_info<B: Backend>(session: &mut Session<B>) -> Result<DeviceInfo, FlashError> {
    session.begin_flash()?;

    let mut guard = FlashGuard::new(session);
    let device = guard.enter_bootloader().map_err(FlashError::BootloaderEntry);

    match &device {
        Ok(_) => {
            if let Err(err) = guard.hard_reset() {
                warn!("Failed to reset the device: {err}");
            }
        }
        Err(_) => guard.mark_failed(),
    }

    device
}
