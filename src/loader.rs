//! Client for the ROM bootloader of ESP32-class devices

use std::{io::Write, iter::zip, time::Duration};

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use log::{debug, info};
use regex::Regex;

use crate::{
    connection::{
        command::{Command, CommandType},
        reset::{construct_reset_strategy_sequence, ResetStrategy},
        SerialTransport,
        USB_SERIAL_JTAG_PID,
    },
    error::{ConnectionError, Error, ResultExt},
    flasher::{
        patch_image_header,
        FlashRequest,
        SpiAttachParams,
        FLASH_SECTOR_SIZE,
        FLASH_WRITE_SIZE,
    },
    interface::Loader,
    progress::ProgressCallbacks,
    targets::{Chip, DeviceInfo, CHIP_DETECT_MAGIC_REG_ADDR},
};

const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Key written to the RTC write-protect register to unlock it
const WDT_WKEY: u32 = 0x50D8_3AA1;

/// Talks to the bootloader in the chip's mask ROM
///
/// The ROM loader is slow compared to a RAM stub but needs nothing uploaded
/// first, so a flash attempt can start right after the handshake.
#[derive(Debug, Default)]
pub struct RomLoader {
    chip: Option<Chip>,
}

impl RomLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chip found during the last successful handshake
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    fn connect_attempt(
        &mut self,
        transport: &mut SerialTransport,
        reset_strategy: &dyn ResetStrategy,
    ) -> Result<(), Error> {
        reset_strategy.reset(transport)?;

        // Whatever the chip printed after the reset tells us which mode it
        // booted into
        let output = transport.read_available()?;
        let boot_log = String::from_utf8_lossy(&output);
        let pattern = Regex::new(r"boot:(0x[0-9a-fA-F]+)(.*waiting for download)?")
            .map_err(|_| Error::InternalError)?;

        let boot_mode = pattern.captures(&boot_log).map(|captures| {
            let mode = captures
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let download_mode = captures.get(2).is_some();

            debug!("Boot Mode: {}", mode);
            debug!("Download Mode: {}", download_mode);

            (mode, download_mode)
        });

        for _ in 0..MAX_SYNC_ATTEMPTS {
            transport.flush()?;

            if transport.sync().is_ok() {
                return Ok(());
            }
        }

        match boot_mode {
            Some((_, true)) => Err(Error::Connection(ConnectionError::NoSyncReply)),
            Some((mode, false)) => Err(Error::Connection(ConnectionError::WrongBootMode(mode))),
            None => Err(Error::Connection(ConnectionError::ConnectionFailed)),
        }
    }

    fn begin(&mut self, transport: &mut SerialTransport, chip: Chip) -> Result<(), Error> {
        transport.with_timeout(CommandType::SpiAttach.timeout(), |transport| {
            transport.command(Command::SpiAttach {
                spi_params: SpiAttachParams::default(),
            })
        })?;

        // Without a RAM stub nothing stops the RTC watchdog from resetting
        // the chip halfway through a write over USB-JTAG-Serial
        if transport.usb_pid() == USB_SERIAL_JTAG_PID {
            if let Some((wp_reg, wdt_reg)) = chip.rtc_watchdog_registers() {
                debug!("Disabling the RTC watchdog");

                transport.write_reg(wp_reg, WDT_WKEY, None)?; // WP disable
                transport.write_reg(wdt_reg, 0x0, None)?; // turn off RTC WDT
                transport.write_reg(wp_reg, 0x0, None)?; // WP enable
            }
        }

        Ok(())
    }

    fn write_deflated(
        &mut self,
        transport: &mut SerialTransport,
        chip: Chip,
        data: &[u8],
        addr: u32,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let size = image_size(data)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let block_count = compressed.len().div_ceil(FLASH_WRITE_SIZE);
        let erase_count = data.len().div_ceil(FLASH_SECTOR_SIZE);

        // round up to sector size
        let erase_size = (erase_count * FLASH_SECTOR_SIZE) as u32;

        debug!(
            "Writing {} bytes ({} compressed) in {} blocks at {:#x}",
            data.len(),
            compressed.len(),
            block_count,
            addr
        );

        transport.with_timeout(
            CommandType::FlashDeflBegin.timeout_for_size(erase_size),
            |transport| {
                transport.command(Command::FlashDeflBegin {
                    size,
                    blocks: block_count as u32,
                    block_size: FLASH_WRITE_SIZE as u32,
                    offset: addr,
                    supports_encryption: chip.rom_supports_encryption_flag(),
                })
            },
        )?;

        progress.init(addr, data.len());

        // decode the chunks to see how much data the device will have to save
        let mut decoder = ZlibDecoder::new(Vec::new());
        let mut decoded_size = 0;

        for (i, block) in compressed.chunks(FLASH_WRITE_SIZE).enumerate() {
            decoder.write_all(block)?;
            decoder.flush()?;
            let size = decoder.get_ref().len() - decoded_size;
            decoded_size = decoder.get_ref().len();

            transport.with_timeout(
                CommandType::FlashDeflData.timeout_for_size(size as u32),
                |transport| {
                    transport.command(Command::FlashDeflData {
                        sequence: i as u32,
                        pad_to: 0,
                        pad_byte: 0xff,
                        data: block,
                    })
                },
            )?;

            progress.update(decoded_size);
        }

        progress.finish();

        transport.with_timeout(CommandType::FlashDeflEnd.timeout(), |transport| {
            transport.command(Command::FlashDeflEnd { reboot: false })
        })?;

        Ok(())
    }

    fn write_plain(
        &mut self,
        transport: &mut SerialTransport,
        chip: Chip,
        data: &[u8],
        addr: u32,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let size = image_size(data)?;
        let block_count = data.len().div_ceil(FLASH_WRITE_SIZE);

        debug!(
            "Writing {} bytes in {} blocks at {:#x}",
            data.len(),
            block_count,
            addr
        );

        transport.with_timeout(
            CommandType::FlashBegin.timeout_for_size(size),
            |transport| {
                transport.command(Command::FlashBegin {
                    size,
                    blocks: block_count as u32,
                    block_size: FLASH_WRITE_SIZE as u32,
                    offset: addr,
                    supports_encryption: chip.rom_supports_encryption_flag(),
                })
            },
        )?;

        progress.init(addr, data.len());

        let mut written = 0;
        for (i, block) in data.chunks(FLASH_WRITE_SIZE).enumerate() {
            transport.with_timeout(
                CommandType::FlashData.timeout_for_size(block.len() as u32),
                |transport| {
                    transport.command(Command::FlashData {
                        sequence: i as u32,
                        pad_to: FLASH_WRITE_SIZE,
                        pad_byte: 0xff,
                        data: block,
                    })
                },
            )?;

            written += block.len();
            progress.update(written);
        }

        progress.finish();

        transport.command(Command::FlashEnd { reboot: false })?;

        Ok(())
    }
}

impl Loader<SerialTransport> for RomLoader {
    fn handshake(&mut self, transport: &mut SerialTransport) -> Result<DeviceInfo, Error> {
        self.chip = None;

        let reset_sequence = construct_reset_strategy_sequence(transport.usb_pid());
        let mut connected = false;

        for (_, reset_strategy) in zip(0..MAX_CONNECT_ATTEMPTS, reset_sequence.iter().cycle()) {
            match self.connect_attempt(transport, reset_strategy.as_ref()) {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(e) => {
                    debug!("Failed to reset, error {:#?}, retrying", e);
                }
            }
        }

        if !connected {
            return Err(Error::Connection(ConnectionError::ConnectionFailed));
        }

        transport.set_timeout(DEFAULT_TIMEOUT)?;

        let magic = transport.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        let chip = Chip::from_magic(magic)?;
        info!("Connected to {}", chip);

        self.chip = Some(chip);

        Ok(DeviceInfo { chip })
    }

    fn write_flash(
        &mut self,
        transport: &mut SerialTransport,
        request: &FlashRequest<'_>,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let chip = self.chip.ok_or(Error::NotSynchronized)?;
        let options = &request.options;

        if options.erase_all {
            return Err(Error::EraseAllUnsupported);
        }

        self.begin(transport, chip).flashing()?;

        let data = patch_image_header(request.data, request.address, options, chip)?;

        if options.compress {
            self.write_deflated(transport, chip, &data, request.address, progress)
                .flashing()
        } else {
            self.write_plain(transport, chip, &data, request.address, progress)
                .flashing()
        }
    }
}

fn image_size(data: &[u8]) -> Result<u32, Error> {
    u32::try_from(data.len()).map_err(|_| Error::ImageTooLarge(data.len()))
}
