//! DTR/RTS sequences driving the EN and IO0 pins of a target device
//!
//! On the common dev-board auto-reset circuit DTR drives IO0 (boot mode) and
//! RTS drives EN (chip enable), both inverted.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{connection::USB_SERIAL_JTAG_PID, error::Error, interface::Transport};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms
/// Width of the EN pulse used to restart the freshly written application
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Some strategy for resetting a target device into its bootloader
pub trait ResetStrategy {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error>;
}

/// Classic reset sequence, sets DTR and RTS sequentially.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        let delay = if extra_delay {
            EXTRA_RESET_DELAY
        } else {
            DEFAULT_RESET_DELAY
        };

        Self { delay }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        transport.set_dtr(false)?; // IO0 = HIGH
        transport.set_rts(true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100));

        transport.set_dtr(true)?; // IO0 = LOW
        transport.set_rts(false)?; // EN = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        transport.set_dtr(false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Reset sequence for devices connected through their USB-JTAG-Serial
/// peripheral
#[derive(Debug, Clone, Copy)]
pub struct UsbJtagSerialReset;

impl ResetStrategy for UsbJtagSerialReset {
    fn reset(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        debug!("Using UsbJtagSerial reset strategy");

        transport.set_rts(false)?;
        transport.set_dtr(false)?; // Idle

        sleep(Duration::from_millis(100));

        transport.set_dtr(true)?; // Set IO0
        transport.set_rts(false)?;

        sleep(Duration::from_millis(100));

        // Go through (1,1) instead of (0,0)
        transport.set_rts(true)?;
        transport.set_dtr(false)?;
        // Windows only propagates DTR on RTS setting
        transport.set_rts(true)?;

        sleep(Duration::from_millis(100));

        transport.set_dtr(false)?;
        transport.set_rts(false)?;

        Ok(())
    }
}

/// Reset strategies to cycle through while trying to reach the bootloader
pub fn construct_reset_strategy_sequence(pid: u16) -> Vec<Box<dyn ResetStrategy>> {
    if pid == USB_SERIAL_JTAG_PID {
        return vec![Box::new(UsbJtagSerialReset)];
    }

    vec![
        Box::new(ClassicReset::new(false)),
        Box::new(ClassicReset::new(true)),
    ]
}

/// Restart the target into whatever is in its flash
///
/// Keeps IO0 released and pulses EN low for [RESET_PULSE].
pub fn hard_reset(transport: &mut dyn Transport) -> Result<(), Error> {
    debug!("Hard resetting the device");

    transport.set_dtr(false)?;
    transport.set_rts(true)?;

    sleep(RESET_PULSE);

    transport.set_rts(false)?;

    Ok(())
}
