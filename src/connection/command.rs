//! Commands understood by the ROM bootloader

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::SpiAttachParams;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_DEFLATE_END_TIMEOUT: Duration = Duration::from_secs(10);

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
const SYNC_FRAME: [u8; 36] = {
    let mut frame = [0x55; 36];
    frame[0] = 0x07;
    frame[1] = 0x07;
    frame[2] = 0x12;
    frame[3] = 0x20;
    frame
};

const CHECKSUM_INIT: u8 = 0xEF;

/// Types of commands that can be sent to a target device
///
/// https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiAttach = 0x0D,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::FlashDeflEnd => FLASH_DEFLATE_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout scaled to the amount of data being erased or written
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }

        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin => {
                calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                calc_timeout(ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            _ => self.timeout(),
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
        }
    }

    /// Write a command
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        // Direction and command identifier
        writer.write_all(&[0, self.command_type() as u8])?;

        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => begin_command(
                writer,
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            ),
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            }
            | Command::FlashDeflData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => data_command(writer, data, pad_to, pad_byte, sequence),
            // 0 means reboot, 1 means stay in the loader
            Command::FlashEnd { reboot } | Command::FlashDeflEnd { reboot } => {
                write_basic(writer, &[u8::from(!reboot)], 0)
            }
            Command::Sync => write_basic(writer, &SYNC_FRAME, 0),
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    address: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }

                let params = WriteRegParams {
                    address,
                    value,
                    mask: mask.unwrap_or(0xFFFF_FFFF),
                    delay_us: 0,
                };
                write_basic(writer, bytes_of(&params), 0)
            }
            Command::ReadReg { address } => write_basic(writer, &address.to_le_bytes(), 0),
            Command::SpiAttach { spi_params } => write_basic(writer, &spi_params.encode(), 0),
        }
    }
}

/// Write a data array and its checksum to a writer
fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }

    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    // The ESP32 ROM does not take the trailing `encrypted` word
    let data = if supports_encryption {
        bytes
    } else {
        &bytes[..bytes.len() - 4]
    };

    write_basic(writer, data, 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }

    Ok(())
}

fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode(command: Command<'_>) -> Vec<u8> {
        let mut buffer = Vec::new();
        command.write(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn sync_frame() {
        let encoded = encode(Command::Sync);

        assert_eq!(&encoded[..2], &[0x00, 0x08]);
        assert_eq!(&encoded[2..4], &36u16.to_le_bytes());
        assert_eq!(&encoded[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(encoded[12..].iter().all(|b| *b == 0x55));
    }

    #[test]
    fn begin_without_encryption_drops_last_word() {
        let command = |supports_encryption| Command::FlashDeflBegin {
            size: 0x2000,
            blocks: 2,
            block_size: 0x400,
            offset: 0,
            supports_encryption,
        };

        assert_eq!(encode(command(false)).len(), 2 + 6 + 16);
        assert_eq!(encode(command(true)).len(), 2 + 6 + 20);
    }

    #[test]
    fn data_is_padded_and_checksummed() {
        let encoded = encode(Command::FlashData {
            data: &[0x01, 0x02],
            pad_to: 4,
            pad_byte: 0xff,
            sequence: 7,
        });

        // 16 byte block header followed by the padded payload
        assert_eq!(&encoded[2..4], &20u16.to_le_bytes());
        assert_eq!(encoded[4], 0xEF ^ 0x01 ^ 0x02 ^ 0xff ^ 0xff);
        assert_eq!(&encoded[8..12], &4u32.to_le_bytes());
        assert_eq!(&encoded[12..16], &7u32.to_le_bytes());
        assert_eq!(&encoded[24..], &[0x01, 0x02, 0xff, 0xff]);
    }

    #[test]
    fn end_encodes_inverted_reboot_flag() {
        assert_eq!(encode(Command::FlashDeflEnd { reboot: false })[8], 1);
        assert_eq!(encode(Command::FlashEnd { reboot: true })[8], 0);
    }
}
