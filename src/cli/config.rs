//! Command-line interface configuration
//!
//! Project settings are read from `meditador.toml`, the preferred serial port
//! and known USB devices from `meditador_ports.toml`. Both are looked up in
//! the current directory, its parent and finally the user's configuration
//! directory. Only the port configuration is ever written back.

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use serialport::UsbPortInfo;

use crate::{
    error::Error,
    flasher::{FlashFrequency, FlashMode, FlashSize},
    session::ConnectionPolicy,
};

const PROJECT_CONFIG_FILE: &str = "meditador.toml";
const PORT_CONFIG_FILE: &str = "meditador_ports.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
}

/// A configured, known USB device
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{decimal:04x}"))
}

impl UsbDevice {
    /// Check if the given USB port matches this device
    pub fn matches(&self, port: &UsbPortInfo) -> bool {
        self.vid == port.vid && self.pid == port.pid
    }
}

/// Flash parameters overriding the built-in defaults
#[derive(Debug, Deserialize, Serialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlashSettings {
    pub mode: Option<FlashMode>,
    #[serde(alias = "frequency")]
    pub freq: Option<FlashFrequency>,
    pub size: Option<FlashSize>,
}

/// Which variant to flash when none is given on the command line
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct SelectionDefaults {
    pub rhythm: Option<String>,
    pub personality: Option<String>,
}

/// Project configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Directory or URL the `firmwares/` folder lives under
    #[serde(default)]
    pub firmware: Option<String>,
    #[serde(default)]
    pub policy: Option<ConnectionPolicy>,
    /// Trace every frame exchanged with the device
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub selection: SelectionDefaults,
    #[serde(default)]
    pub flash: FlashSettings,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct PortConfig {
    /// Preferred serial port connection information
    #[serde(default)]
    pub connection: Connection,
    /// Preferred USB devices
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    /// Path of the file to save the configuration to
    #[serde(skip)]
    save_path: PathBuf,
}

/// Configuration for the project and the port
#[derive(Debug, Default, Clone)]
pub struct Config {
    pub project_config: ProjectConfig,
    pub port_config: PortConfig,
}

impl Config {
    /// Load configuration from the configuration files
    pub fn load() -> Result<Self> {
        let project_config_file = Self::find_config_path(PROJECT_CONFIG_FILE)?;
        let port_config_file = Self::find_config_path(PORT_CONFIG_FILE)?;

        let project_config = match read_to_string(&project_config_file) {
            Ok(raw) => Self::parse_project_config(&raw).wrap_err_with(|| {
                format!("Failed to load {}", project_config_file.display())
            })?,
            Err(_) => ProjectConfig::default(),
        };
        debug!("Config: {:#?}", &project_config);

        let mut port_config = match read_to_string(&port_config_file) {
            Ok(raw) => toml::from_str::<PortConfig>(&raw)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to load {}", port_config_file.display()))?,
            Err(_) => PortConfig::default(),
        };
        port_config.save_path = port_config_file;
        debug!("Port Config: {:#?}", &port_config);

        Ok(Config {
            project_config,
            port_config,
        })
    }

    fn parse_project_config(raw: &str) -> Result<ProjectConfig> {
        let value = toml::from_str::<toml::Value>(raw).into_diagnostic()?;
        if let toml::Value::Table(top_level) = &value {
            Self::validate_keys(top_level)?;
        }

        toml::from_str(raw).into_diagnostic()
    }

    fn validate_keys(top_level: &toml::map::Map<String, toml::Value>) -> Result<(), Error> {
        let sections: &[(&[&str], &str)] = &[
            (&["mode", "freq", "frequency", "size"], "flash"),
            (&["rhythm", "personality"], "selection"),
        ];

        let mut misplaced_keys = Vec::new();

        for (keys, allowed) in sections {
            for &key in *keys {
                for (section_name, value) in top_level {
                    if let toml::Value::Table(table) = value {
                        if table.contains_key(key) && section_name != allowed {
                            misplaced_keys.push((key, *allowed));
                        }
                    }
                }
                if top_level.contains_key(key) {
                    misplaced_keys.push((key, *allowed));
                }
            }
        }

        if misplaced_keys.is_empty() {
            Ok(())
        } else {
            let msg = misplaced_keys
                .into_iter()
                .map(|(key, section)| format!("'{key}' should be under [{section}]!"))
                .collect::<Vec<_>>()
                .join(", ");
            Err(Error::MisplacedKey(msg))
        }
    }

    fn write_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
        let serialized = toml::to_string(config)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;

        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }

        write(path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", path.display()))
    }

    /// Save port configuration to the configuration file
    pub fn save_with<F: Fn(&mut Self)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.clone();
        modify_fn(&mut copy);

        Self::write_config(&copy.port_config, &self.port_config.save_path)
    }

    fn find_config_path(filename: &str) -> Result<PathBuf> {
        let current_dir = std::env::current_dir().into_diagnostic()?;

        let local_config = current_dir.join(filename);
        if local_config.exists() {
            return Ok(local_config);
        }
        if let Some(parent_folder) = current_dir.parent() {
            let workspace_config = parent_folder.join(filename);
            if workspace_config.exists() {
                return Ok(workspace_config);
            }
        }

        let project_dirs = ProjectDirs::from("org", "meditador", "meditador-flash")
            .ok_or_else(|| miette!("Could not determine the user's configuration directory"))?;

        Ok(project_dirs.config_dir().join(filename))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, Serialize)]
    struct TestData {
        #[serde(
            serialize_with = "serialize_u16_to_hex",
            deserialize_with = "deserialize_hex_to_u16"
        )]
        value: u16,
    }

    #[test]
    fn test_deserialize_hex_to_u16() {
        let result: Result<TestData, _> = toml::from_str(r#"value = "aaaa""#);
        assert_eq!(result.unwrap().value, 0xaaaa);

        let result: Result<TestData, _> = toml::from_str(r#"value = "0x1a86""#);
        assert_eq!(result.unwrap().value, 0x1a86);

        let result: Result<TestData, _> = toml::from_str(r#"value = "a""#);
        assert_eq!(result.unwrap().value, 0x0a);

        let result: Result<TestData, _> = toml::from_str(r#"value = "EA60""#);
        assert_eq!(result.unwrap().value, 0xea60);

        let result: Result<TestData, _> = toml::from_str(r#"value = "gg""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_u16_to_hex() {
        let data = TestData { value: 0x7523 };
        assert_eq!(toml::to_string(&data).unwrap().trim(), r#"value = "7523""#);

        let data = TestData { value: 0xa };
        assert_eq!(toml::to_string(&data).unwrap().trim(), r#"value = "000a""#);
    }

    #[test]
    fn parses_project_config() {
        let raw = r#"
            firmware = "https://example.com/meditador"
            policy = "eager"
            trace = true

            [selection]
            rhythm = "largo"
            personality = "minimalista"

            [flash]
            mode = "qio"
            freq = "80MHz"
        "#;

        let config = Config::parse_project_config(raw).unwrap();

        assert_eq!(
            config.firmware.as_deref(),
            Some("https://example.com/meditador")
        );
        assert_eq!(config.policy, Some(ConnectionPolicy::Eager));
        assert!(config.trace);
        assert_eq!(config.selection.rhythm.as_deref(), Some("largo"));
        assert_eq!(config.flash.mode, Some(FlashMode::Qio));
        assert_eq!(config.flash.freq, Some(FlashFrequency::_80Mhz));
        assert_eq!(config.flash.size, None);
    }

    #[test]
    fn empty_project_config_uses_defaults() {
        let config = Config::parse_project_config("").unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn rejects_misplaced_keys() {
        let err = Config::parse_project_config("mode = \"dio\"\n").unwrap_err();
        assert!(err.to_string().contains("'mode' should be under [flash]!"));

        let err = Config::parse_project_config("[flash]\nrhythm = \"corto\"\n").unwrap_err();
        assert!(err.to_string().contains("'rhythm' should be under [selection]!"));
    }

    #[test]
    fn parses_port_config() {
        let raw = r#"
            [connection]
            serial = "/dev/ttyUSB0"

            [[usb_device]]
            vid = "303a"
            pid = "1001"
        "#;

        let config: PortConfig = toml::from_str(raw).unwrap();

        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(
            config.usb_device,
            vec![UsbDevice {
                vid: 0x303a,
                pid: 0x1001
            }]
        );
    }
}
