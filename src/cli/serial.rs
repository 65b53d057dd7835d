use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::{info, warn};
use miette::{IntoDiagnostic, Result};
use serialport::{available_ports, SerialPortInfo, SerialPortType, UsbPortInfo};

use super::config::{Config, UsbDevice};
use crate::{
    error::Error,
    serial::{PortChooser, SerialPortHandle},
};

/// USB UART adapters which are known to be on common dev boards
const KNOWN_DEVICES: &[UsbDevice] = &[
    UsbDevice {
        vid: 0x10c4,
        pid: 0xea60,
    }, // Silicon Labs CP210x UART Bridge
    UsbDevice {
        vid: 0x1a86,
        pid: 0x7523,
    }, // QinHeng Electronics CH340 serial converter
    UsbDevice {
        vid: 0x303a,
        pid: 0x1001,
    }, // Espressif USB-JTAG-Serial
];

/// Picks the port named on the command line or in the configuration, and
/// asks the user otherwise
pub struct InteractiveChooser {
    serial: Option<String>,
    config: Config,
}

impl InteractiveChooser {
    /// A port given on the command line takes precedence over the configured
    /// one
    pub fn new(serial: Option<String>, config: &Config) -> Self {
        InteractiveChooser {
            serial: serial.or_else(|| config.port_config.connection.serial.clone()),
            config: config.clone(),
        }
    }
}

impl PortChooser for InteractiveChooser {
    fn choose_port(&mut self) -> Result<SerialPortHandle, Error> {
        let port = get_serial_port_info(self.serial.as_deref(), &self.config)?;

        let pid = match &port.port_type {
            SerialPortType::UsbPort(info) => info.pid,
            _ => 0,
        };

        Ok(SerialPortHandle::new(port.port_name, pid))
    }
}

fn get_serial_port_info(serial: Option<&str>, config: &Config) -> Result<SerialPortInfo, Error> {
    let ports = detect_usb_serial_ports().unwrap_or_default();

    if let Some(serial) = serial {
        // canonicalize() does not understand "dummy" device paths like `COM4`
        #[cfg(not(target_os = "windows"))]
        let serial = std::fs::canonicalize(serial)?.to_string_lossy().to_string();
        return find_serial_port(&ports, &serial);
    }

    let (port, matches) = select_serial_port(ports, config)?;

    if let SerialPortType::UsbPort(usb_info) = &port.port_type {
        if !matches {
            let remember = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt("Remember this serial port for future use?")
                .interact_opt()?
                .unwrap_or_default();

            if remember {
                if let Err(e) = config.save_with(|config| {
                    config.port_config.usb_device.push(UsbDevice {
                        vid: usb_info.vid,
                        pid: usb_info.pid,
                    })
                }) {
                    warn!("Failed to save config {:#}", e);
                } else {
                    info!("Remembered USB device {:04x}:{:04x}", usb_info.vid, usb_info.pid);
                }
            }
        }
    }

    Ok(port)
}

/// Given a vector of `SerialPortInfo` structs, attempt to find and return one
/// whose `port_name` field matches the provided `name` argument.
fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<SerialPortInfo, Error> {
    ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| Error::SerialNotFound(name.to_owned()))
}

fn detect_usb_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = available_ports().into_diagnostic()?;
    let ports = ports
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .collect::<Vec<_>>();

    Ok(ports)
}

fn select_serial_port(
    ports: Vec<SerialPortInfo>,
    config: &Config,
) -> Result<(SerialPortInfo, bool), Error> {
    let device_matches = |info: &UsbPortInfo| {
        config
            .port_config
            .usb_device
            .iter()
            .chain(KNOWN_DEVICES.iter())
            .any(|dev| dev.matches(info))
    };

    if ports.len() > 1 {
        println!(
            "Detected {} serial ports. Ports which match a known common dev board are highlighted.\n",
            ports.len()
        );

        let port_names = ports
            .iter()
            .map(|port_info| match &port_info.port_type {
                SerialPortType::UsbPort(info) => {
                    let formatted = if device_matches(info) {
                        port_info.port_name.as_str().bold()
                    } else {
                        port_info.port_name.as_str().reset()
                    };

                    match &info.product {
                        Some(product) => format!("{} - {}", formatted, product),
                        None => formatted.to_string(),
                    }
                }
                _ => port_info.port_name.clone(),
            })
            .collect::<Vec<_>>();

        let index = Select::with_theme(&ColorfulTheme::default())
            .items(&port_names)
            .default(0)
            .interact_opt()?
            .ok_or(Error::Cancelled)?;

        let port_info = ports.get(index).ok_or(Error::Cancelled)?;
        let matches = match &port_info.port_type {
            SerialPortType::UsbPort(usb_info) => device_matches(usb_info),
            _ => false,
        };

        Ok((port_info.to_owned(), matches))
    } else if let [port] = ports.as_slice() {
        let unknown = UsbPortInfo {
            vid: 0,
            pid: 0,
            serial_number: None,
            manufacturer: None,
            product: None,
        };
        let port_info = match &port.port_type {
            SerialPortType::UsbPort(info) => info,
            _ => &unknown,
        };

        if device_matches(port_info) {
            Ok((port.to_owned(), true))
        } else if confirm_port(&port.port_name, port_info)? {
            Ok((port.to_owned(), false))
        } else {
            Err(Error::Cancelled)
        }
    } else {
        Err(Error::NoSerial)
    }
}

fn confirm_port(port_name: &str, port_info: &UsbPortInfo) -> Result<bool, Error> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(match &port_info.product {
            Some(product) => format!("Use serial port '{}' - {}?", port_name, product),
            None => format!("Use serial port '{}'?", port_name),
        })
        .interact_opt()?
        .ok_or(Error::Cancelled)
}
