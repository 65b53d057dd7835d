//! Byte-level link to a target device
//!
//! The [SerialTransport] owns a handle to an open serial port, frames
//! commands with SLIP and decodes the bootloader's responses. It is the
//! [Transport] implementation used on real hardware.

use std::{
    io::{BufWriter, Read, Write},
    thread::sleep,
    time::Duration,
};

use log::{debug, trace};
use serialport::SerialPort;
use slip_codec::SlipDecoder;

use self::{
    command::{Command, CommandType},
    encoder::SlipEncoder,
};
use crate::{
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    interface::Transport,
};

pub mod command;
pub mod reset;

const MAX_RESPONSE_ATTEMPTS: usize = 100;
const MAX_SYNC_RESPONSES: usize = 7;
pub(crate) const USB_SERIAL_JTAG_PID: u16 = 0x1001;

/// A response from a target device following a command
#[derive(Debug, Copy, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: u32,
    pub error: u8,
    pub status: u8,
}

/// SLIP framed link over a serial port handle
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    pid: u16,
    decoder: SlipDecoder,
    trace: bool,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>, pid: u16, trace: bool) -> Self {
        SerialTransport {
            port: Some(port),
            pid,
            decoder: SlipDecoder::new(),
            trace,
        }
    }

    /// USB product id of the adapter, `0` when unknown
    pub fn usb_pid(&self) -> u16 {
        self.pid
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, Error> {
        self.port.as_mut().ok_or(Error::TransportDisconnected)
    }

    /// Set timeout for the serial port
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.port_mut()?.set_timeout(timeout)?;
        Ok(())
    }

    /// Run a closure with a temporarily changed read timeout
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut SerialTransport) -> Result<T, Error>,
    {
        let old_timeout = {
            let port = self.port_mut()?;
            let old_timeout = port.timeout();
            port.set_timeout(timeout)?;
            old_timeout
        };

        let result = f(self);

        self.port_mut()?.set_timeout(old_timeout)?;

        result
    }

    /// Drain whatever the device printed since the last read
    pub fn read_available(&mut self) -> Result<Vec<u8>, Error> {
        let port = self.port_mut()?;
        let available = port.bytes_to_read()? as usize;
        let mut buffer = vec![0; available];
        let read = port.read(&mut buffer)?;
        buffer.truncate(read);

        Ok(buffer)
    }

    /// Send a single SYNC and wait for the bootloader to echo it
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_timeout(CommandType::Sync.timeout(), |transport| {
            transport.write_command(Command::Sync)?;
            transport.flush()?;

            sleep(Duration::from_millis(10));

            // The ROM answers a SYNC with several identical responses
            for _ in 0..MAX_SYNC_RESPONSES {
                match transport.read_response()? {
                    Some(response) if response.return_op == CommandType::Sync as u8 => {
                        if response.status == 1 {
                            transport.flush().ok();
                            return Err(Error::RomError(RomError::new(
                                CommandType::Sync,
                                RomErrorKind::from(response.error),
                            )));
                        }
                    }
                    _ => {
                        return Err(Error::RomError(RomError::new(
                            CommandType::Sync,
                            RomErrorKind::InvalidMessage,
                        )))
                    }
                }
            }

            Ok(())
        })
    }

    /// Read the next response frame
    pub fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        let response = match self.read(10)? {
            None => return Ok(None),
            Some(response) => response,
        };

        // The stub answers with two status bytes, the ROM with four
        let status_len = match response.len() {
            10 => 2,
            12 => 4,
            _ => return Err(Error::InternalError),
        };

        let header = CommandResponse {
            resp: response[0],
            return_op: response[1],
            return_length: u16::from_le_bytes([response[2], response[3]]),
            value: u32::from_le_bytes([response[4], response[5], response[6], response[7]]),
            error: response[response.len() - status_len],
            status: response[response.len() - status_len + 1],
        };

        if self.trace {
            trace!("<- {:02x?}", response);
        }

        Ok(Some(header))
    }

    /// Write a command to the serial port
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        if self.trace {
            let mut raw = Vec::new();
            command.write(&mut raw)?;
            trace!("-> {:02x?}", raw);
        }

        let port = self.port_mut()?;
        port.clear(serialport::ClearBuffer::Input)?;

        let mut writer = BufWriter::new(port);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;

        Ok(())
    }

    /// Write a command and read the matching response
    pub fn command(&mut self, command: Command<'_>) -> Result<u32, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        for _ in 0..MAX_RESPONSE_ATTEMPTS {
            match self.read_response().for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.error != 0 {
                        let _error = self.flush();
                        Err(Error::RomError(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response.value)
                    };
                }
                _ => continue,
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    /// Read a register of the target device
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.with_timeout(CommandType::ReadReg.timeout(), |transport| {
            transport.command(Command::ReadReg { address })
        })
    }

    /// Write a register of the target device
    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.with_timeout(CommandType::WriteReg.timeout(), |transport| {
            transport.command(Command::WriteReg {
                address,
                value,
                mask,
            })
        })?;

        Ok(())
    }

    fn read(&mut self, len: usize) -> Result<Option<Vec<u8>>, Error> {
        let mut tmp = Vec::with_capacity(1024);
        let port = self.port.as_mut().ok_or(Error::TransportDisconnected)?;

        loop {
            self.decoder.decode(port, &mut tmp)?;
            if tmp.len() >= len {
                return Ok(Some(tmp));
            }
        }
    }

    /// Flush the serial port
    pub fn flush(&mut self) -> Result<(), Error> {
        self.port_mut()?.flush()?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
        self.port_mut()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), Error> {
        self.port_mut()?.write_request_to_send(level)?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        match self.port.take() {
            Some(mut port) => {
                debug!("Releasing transport");
                port.flush()?;
                Ok(())
            }
            None => Err(Error::TransportDisconnected),
        }
    }
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    /// Wraps everything written through it in a single SLIP frame
    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf {
                self.len += match *value {
                    END => self.writer.write(&[ESC, ESC_END])?,
                    ESC => self.writer.write(&[ESC, ESC_ESC])?,
                    other => self.writer.write(&[other])?,
                };
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn escapes_frame_bytes() {
            let mut out = Vec::new();
            let mut encoder = SlipEncoder::new(&mut out).unwrap();
            encoder.write_all(&[0x01, END, ESC, 0x02]).unwrap();
            encoder.finish().unwrap();

            assert_eq!(
                out,
                vec![END, 0x01, ESC, ESC_END, ESC, ESC_ESC, 0x02, END]
            );
        }
    }
}
