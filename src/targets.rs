//! Supported target devices

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};

use crate::{error::Error, flasher::FlashFrequency};

/// Address of the register holding a chip specific magic value
pub(crate) const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// All supported devices
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, VariantNames, EnumIter, Serialize, Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// ESP32
    Esp32,
    /// ESP32-C2, ESP8684
    Esp32c2,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
}

impl Chip {
    /// Identify a chip from the value of [CHIP_DETECT_MAGIC_REG_ADDR]
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        Chip::iter()
            .find(|chip| chip.magic_values().contains(&magic))
            .ok_or(Error::ChipDetectError(magic))
    }

    fn magic_values(&self) -> &'static [u32] {
        match self {
            Chip::Esp32 => &[0x00f0_1d83],
            Chip::Esp32c2 => &[
                0x6f51_306f, // ECO0
                0x7c41_a06f, // ECO1
            ],
            Chip::Esp32c3 => &[
                0x6921_506f, // ECO1 + ECO2
                0x1b31_506f, // ECO3
                0x4881_606f, // ECO6
                0x4361_606f, // ECO7
            ],
            Chip::Esp32c6 => &[0x2ce0_806f],
            Chip::Esp32h2 => &[0xd7b7_3e80],
            Chip::Esp32s2 => &[0x0000_07c6],
            Chip::Esp32s3 => &[0x9],
        }
    }

    /// Whether the ROM's FLASH_BEGIN takes the trailing `encrypted` word
    pub fn rom_supports_encryption_flag(&self) -> bool {
        !matches!(self, Chip::Esp32)
    }

    /// Encoding of the flash frequency in the image header
    pub fn encode_flash_frequency(&self, frequency: FlashFrequency) -> Result<u8, Error> {
        use FlashFrequency::*;

        let encoded = match (self, frequency) {
            (Chip::Esp32c2, _30Mhz) => Some(0x0),
            (Chip::Esp32c2, _20Mhz) => Some(0x1),
            (Chip::Esp32c2, _15Mhz) => Some(0x2),
            (Chip::Esp32c2, _60Mhz) => Some(0xf),
            (Chip::Esp32h2, _24Mhz) => Some(0x0),
            (Chip::Esp32h2, _16Mhz) => Some(0x1),
            (Chip::Esp32h2, _12Mhz) => Some(0x2),
            (Chip::Esp32h2, _48Mhz) => Some(0xf),
            (Chip::Esp32c6, _40Mhz) => Some(0x0),
            (Chip::Esp32c6, _80Mhz) => Some(0x0),
            (Chip::Esp32c6, _20Mhz) => Some(0x2),
            (Chip::Esp32c2 | Chip::Esp32h2 | Chip::Esp32c6, _) => None,
            (_, _40Mhz) => Some(0x0),
            (_, _26Mhz) => Some(0x1),
            (_, _20Mhz) => Some(0x2),
            (_, _80Mhz) => Some(0xf),
            _ => None,
        };

        encoded.ok_or(Error::UnsupportedFlashFrequency {
            chip: *self,
            frequency,
        })
    }

    /// Write-protect and RTC watchdog config registers, for chips whose RTC
    /// watchdog keeps running in the ROM bootloader when attached through
    /// USB-JTAG-Serial
    pub(crate) fn rtc_watchdog_registers(&self) -> Option<(u32, u32)> {
        match self {
            Chip::Esp32c3 => Some((0x6000_80a8, 0x6000_8090)),
            Chip::Esp32s3 => Some((0x6000_80b0, 0x6000_8098)),
            Chip::Esp32c6 => Some((0x600b_1c18, 0x600b_1c00)),
            _ => None,
        }
    }
}

/// Information about the connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The chip being used
    pub chip: Chip,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_chip_from_magic() {
        assert_eq!(Chip::from_magic(0x00f0_1d83).unwrap(), Chip::Esp32);
        assert_eq!(Chip::from_magic(0x2ce0_806f).unwrap(), Chip::Esp32c6);
        assert_eq!(Chip::from_magic(0x9).unwrap(), Chip::Esp32s3);
        assert!(matches!(
            Chip::from_magic(0xdead_beef),
            Err(Error::ChipDetectError(0xdead_beef))
        ));
    }

    #[test]
    fn flash_frequency_encodings() {
        assert_eq!(
            Chip::Esp32
                .encode_flash_frequency(FlashFrequency::_40Mhz)
                .unwrap(),
            0x0
        );
        assert_eq!(
            Chip::Esp32s3
                .encode_flash_frequency(FlashFrequency::_80Mhz)
                .unwrap(),
            0xf
        );
        assert_eq!(
            Chip::Esp32c6
                .encode_flash_frequency(FlashFrequency::_40Mhz)
                .unwrap(),
            0x0
        );
        assert!(Chip::Esp32h2
            .encode_flash_frequency(FlashFrequency::_40Mhz)
            .is_err());
    }
}
