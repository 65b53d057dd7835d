//! Flash parameters and the request handed to a bootloader client
//!
//! Merged images start with the second stage bootloader, whose header
//! carries the SPI flash mode, frequency and size the chip boots with.
//! [patch_image_header] rewrites those fields to match the requested
//! [WriteFlashOptions] before the image is sent.

use std::borrow::Cow;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, VariantNames};

use crate::{error::Error, targets::Chip};

pub(crate) const FLASH_SECTOR_SIZE: usize = 0x1000;
/// Largest block accepted by the ROM loader per data command
pub(crate) const FLASH_WRITE_SIZE: usize = 0x400;

const ESP_MAGIC: u8 = 0xE9;
/// Offset of `hash_appended` in the extended image header
const HASH_APPENDED_OFFSET: usize = 23;

/// Supported flash frequencies
///
/// Note that not all frequencies are supported by each target device.
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashFrequency {
    /// 12 MHz
    #[serde(rename = "12MHz")]
    #[strum(serialize = "12MHz")]
    #[cfg_attr(feature = "cli", value(name = "12m"))]
    _12Mhz,
    /// 15 MHz
    #[serde(rename = "15MHz")]
    #[strum(serialize = "15MHz")]
    #[cfg_attr(feature = "cli", value(name = "15m"))]
    _15Mhz,
    /// 16 MHz
    #[serde(rename = "16MHz")]
    #[strum(serialize = "16MHz")]
    #[cfg_attr(feature = "cli", value(name = "16m"))]
    _16Mhz,
    /// 20 MHz
    #[serde(rename = "20MHz")]
    #[strum(serialize = "20MHz")]
    #[cfg_attr(feature = "cli", value(name = "20m"))]
    _20Mhz,
    /// 24 MHz
    #[serde(rename = "24MHz")]
    #[strum(serialize = "24MHz")]
    #[cfg_attr(feature = "cli", value(name = "24m"))]
    _24Mhz,
    /// 26 MHz
    #[serde(rename = "26MHz")]
    #[strum(serialize = "26MHz")]
    #[cfg_attr(feature = "cli", value(name = "26m"))]
    _26Mhz,
    /// 30 MHz
    #[serde(rename = "30MHz")]
    #[strum(serialize = "30MHz")]
    #[cfg_attr(feature = "cli", value(name = "30m"))]
    _30Mhz,
    /// 40 MHz
    #[serde(rename = "40MHz")]
    #[strum(serialize = "40MHz")]
    #[cfg_attr(feature = "cli", value(name = "40m"))]
    #[default]
    _40Mhz,
    /// 48 MHz
    #[serde(rename = "48MHz")]
    #[strum(serialize = "48MHz")]
    #[cfg_attr(feature = "cli", value(name = "48m"))]
    _48Mhz,
    /// 60 MHz
    #[serde(rename = "60MHz")]
    #[strum(serialize = "60MHz")]
    #[cfg_attr(feature = "cli", value(name = "60m"))]
    _60Mhz,
    /// 80 MHz
    #[serde(rename = "80MHz")]
    #[strum(serialize = "80MHz")]
    #[cfg_attr(feature = "cli", value(name = "80m"))]
    _80Mhz,
}

/// Supported flash modes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FlashMode {
    /// Quad I/O (4 pins used for address & data)
    Qio = 0,
    /// Quad Output (4 pins used for data)
    Qout = 1,
    /// Dual I/O (2 pins used for address & data)
    #[default]
    Dio = 2,
    /// Dual Output (2 pins used for data)
    Dout = 3,
}

/// Supported flash sizes
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
pub enum FlashSize {
    /// 1 MB
    #[serde(rename = "1MB")]
    #[strum(serialize = "1MB")]
    #[cfg_attr(feature = "cli", value(name = "1MB"))]
    _1Mb,
    /// 2 MB
    #[serde(rename = "2MB")]
    #[strum(serialize = "2MB")]
    #[cfg_attr(feature = "cli", value(name = "2MB"))]
    _2Mb,
    /// 4 MB
    #[default]
    #[serde(rename = "4MB")]
    #[strum(serialize = "4MB")]
    #[cfg_attr(feature = "cli", value(name = "4MB"))]
    _4Mb,
    /// 8 MB
    #[serde(rename = "8MB")]
    #[strum(serialize = "8MB")]
    #[cfg_attr(feature = "cli", value(name = "8MB"))]
    _8Mb,
    /// 16 MB
    #[serde(rename = "16MB")]
    #[strum(serialize = "16MB")]
    #[cfg_attr(feature = "cli", value(name = "16MB"))]
    _16Mb,
}

impl FlashSize {
    /// Encoding of the size in the high nibble of the image header
    fn header_nibble(&self) -> u8 {
        match self {
            FlashSize::_1Mb => 0x0,
            FlashSize::_2Mb => 0x1,
            FlashSize::_4Mb => 0x2,
            FlashSize::_8Mb => 0x3,
            FlashSize::_16Mb => 0x4,
        }
    }
}

/// What to do with the flash size recorded in the image header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashSizePolicy {
    /// Leave the size the image was built with
    #[default]
    Keep,
    /// Overwrite it
    Size(FlashSize),
}

/// Parameters of a flash write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteFlashOptions {
    pub flash_size: FlashSizePolicy,
    pub flash_mode: FlashMode,
    pub flash_freq: FlashFrequency,
    /// Erase the whole chip instead of only the sectors being written
    pub erase_all: bool,
    /// Send the image zlib compressed
    pub compress: bool,
}

impl Default for WriteFlashOptions {
    fn default() -> Self {
        WriteFlashOptions {
            flash_size: FlashSizePolicy::Keep,
            flash_mode: FlashMode::Dio,
            flash_freq: FlashFrequency::_40Mhz,
            erase_all: false,
            compress: true,
        }
    }
}

/// One image to be written at `address`
#[derive(Clone, Copy, Debug)]
pub struct FlashRequest<'a> {
    pub data: &'a [u8],
    pub address: u32,
    pub options: WriteFlashOptions,
}

/// Parameters for attaching to a target devices SPI flash
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    /// Encode the parameters the way the ROM loader expects them
    pub fn encode(self) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded = packed.to_le_bytes().to_vec();
        // The ROM takes an additional, unused word
        encoded.extend_from_slice(&[0; 4]);

        encoded
    }
}

/// Rewrite flash mode, frequency and size in the header of an image written
/// at address 0
///
/// Images with an appended SHA-256 digest are returned untouched, since any
/// header change would invalidate the digest.
pub fn patch_image_header<'a>(
    data: &'a [u8],
    address: u32,
    options: &WriteFlashOptions,
    chip: Chip,
) -> Result<Cow<'a, [u8]>, Error> {
    if address != 0 || data.len() < 8 || data[0] != ESP_MAGIC {
        return Ok(Cow::Borrowed(data));
    }

    let mode = options.flash_mode as u8;
    let size = match options.flash_size {
        FlashSizePolicy::Keep => data[3] & 0xf0,
        FlashSizePolicy::Size(size) => size.header_nibble() << 4,
    };
    let freq = chip.encode_flash_frequency(options.flash_freq)?;
    let size_freq = size | freq;

    if data[2] == mode && data[3] == size_freq {
        return Ok(Cow::Borrowed(data));
    }

    if data.get(HASH_APPENDED_OFFSET) == Some(&1) {
        warn!("Image has an appended SHA-256 digest, leaving its flash parameters unchanged");
        return Ok(Cow::Borrowed(data));
    }

    debug!(
        "Updating image header: mode {:#04x} -> {:#04x}, size/freq {:#04x} -> {:#04x}",
        data[2], mode, data[3], size_freq
    );

    let mut patched = data.to_vec();
    patched[2] = mode;
    patched[3] = size_freq;

    Ok(Cow::Owned(patched))
}
