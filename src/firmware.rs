//! Firmware variants and where their images come from
//!
//! Every variant is a pre-merged image (bootloader, partition table and
//! application) stored as `firmwares/<variant>.bin` below some location,
//! either a directory on disk or an HTTP(S) server.

use std::{
    fmt::{Display, Formatter},
    fs,
    io,
    path::PathBuf,
    time::Duration,
};

use log::debug;
use reqwest::blocking::Client;

use crate::error::{FetchError, SelectionError};

/// Directory holding the images, relative to a firmware location
pub const FIRMWARE_DIR: &str = "firmwares";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The firmware variant a user picked
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareSelection {
    variant_key: String,
}

impl FirmwareSelection {
    /// A breathing exercise variant, one rhythm combined with one pet
    /// personality
    pub fn breathing(rhythm: &str, personality: &str) -> Result<Self, SelectionError> {
        validate("rhythm", rhythm)?;
        validate("personality", personality)?;

        Ok(FirmwareSelection {
            variant_key: format!("breathing_{rhythm}_pet_{personality}"),
        })
    }

    /// A predefined profile
    pub fn profile(id: &str) -> Result<Self, SelectionError> {
        validate("profile", id)?;

        Ok(FirmwareSelection {
            variant_key: format!("profile_{id}"),
        })
    }

    pub fn variant_key(&self) -> &str {
        &self.variant_key
    }

    /// Path of the image relative to the firmware location
    pub fn resource_path(&self) -> String {
        format!("{FIRMWARE_DIR}/{}.bin", self.variant_key)
    }
}

impl Display for FirmwareSelection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.variant_key)
    }
}

fn validate(option: &'static str, value: &str) -> Result<(), SelectionError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(SelectionError {
            option,
            value: value.to_string(),
        })
    }
}

/// A merged image ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub bytes: Vec<u8>,
    /// Merged images always start at the beginning of flash
    pub load_address: u32,
}

impl FirmwareImage {
    pub fn merged(bytes: Vec<u8>) -> Self {
        FirmwareImage {
            bytes,
            load_address: 0x0000,
        }
    }
}

/// Somewhere firmware images can be read from
pub trait FirmwareSource {
    /// Retrieve the raw bytes stored at `path`
    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError>;

    /// Human readable location, used in log messages
    fn describe(&self) -> String;
}

/// Images served over HTTP(S)
pub struct HttpSource {
    base: String,
    client: Client,
}

impl HttpSource {
    pub fn new(base: impl Into<String>) -> Result<Self, FetchError> {
        let base = base.into();
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|source| FetchError::Request {
                url: base.clone(),
                source,
            })?;

        Ok(HttpSource { base, client })
    }

    fn url(&self, path: &str) -> String {
        let mut url = self.base.trim_end_matches('/').to_string();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            url.push('/');
            url.push_str(part);
        }

        url
    }
}

impl FirmwareSource for HttpSource {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let url = self.url(path);
        debug!("GET {url}");

        let request_error = |source| FetchError::Request {
            url: url.clone(),
            source,
        };

        let response = self.client.get(&url).send().map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            debug!("GET {url} returned {status}");
            return Err(FetchError::NotFound {
                path: path.to_string(),
                status: Some(status.as_u16()),
            });
        }

        let bytes = response.bytes().map_err(request_error)?;

        Ok(bytes.to_vec())
    }

    fn describe(&self) -> String {
        self.base.clone()
    }
}

/// Images stored below a local directory
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectorySource { root: root.into() }
    }
}

impl FirmwareSource for DirectorySource {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let file = self.root.join(path);
        debug!("Reading {}", file.display());

        fs::read(&file).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => FetchError::NotFound {
                path: path.to_string(),
                status: None,
            },
            _ => FetchError::Io {
                path: file.display().to_string(),
                source,
            },
        })
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Pick a source for a location: URLs are fetched over HTTP(S), anything
/// else is a directory
pub fn source_for(location: &str) -> Result<Box<dyn FirmwareSource>, FetchError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpSource::new(location)?))
    } else {
        Ok(Box::new(DirectorySource::new(location)))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpListener,
        thread,
    };

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn breathing_resource_path() {
        let selection = FirmwareSelection::breathing("largo", "minimalista").unwrap();
        assert_eq!(
            selection.resource_path(),
            "firmwares/breathing_largo_pet_minimalista.bin"
        );
    }

    #[test]
    fn profile_resource_path() {
        let selection = FirmwareSelection::profile("a").unwrap();
        assert_eq!(selection.resource_path(), "firmwares/profile_a.bin");
        assert_eq!(selection.to_string(), "profile_a");
    }

    #[test]
    fn rejects_values_escaping_the_template() {
        for value in ["", "../boot", "a/b", "a b", "é"] {
            let err = FirmwareSelection::profile(value).unwrap_err();
            assert_eq!(err.option, "profile");
            assert_eq!(err.value, value);
        }

        let err = FirmwareSelection::breathing("corto", "mini.malista").unwrap_err();
        assert_eq!(err.option, "personality");
    }

    #[test]
    fn joins_http_paths() {
        let source = HttpSource::new("https://example.com/site/").unwrap();
        assert_eq!(
            source.url("firmwares/profile_a.bin"),
            "https://example.com/site/firmwares/profile_a.bin"
        );
    }

    /// Answer a single HTTP request with `response`, returning the base URL
    fn serve_once(response: &'static str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/site", listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                if header.trim().is_empty() {
                    break;
                }
            }

            reader.get_mut().write_all(response.as_bytes()).unwrap();
            request_line
        });

        (base, handle)
    }

    fn local_source(base: String) -> HttpSource {
        HttpSource {
            base,
            client: Client::builder().no_proxy().build().unwrap(),
        }
    }

    #[test]
    fn http_error_status_means_not_found() {
        let (base, server) =
            serve_once("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");

        let err = local_source(base)
            .fetch("firmwares/profile_z.bin")
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::NotFound { ref path, status: Some(404) } if path == "firmwares/profile_z.bin"
        ));
        assert!(server
            .join()
            .unwrap()
            .starts_with("GET /site/firmwares/profile_z.bin "));
    }

    #[test]
    fn http_success_returns_the_body() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: 4\r\nConnection: close\r\n\r\nMERG",
        );

        let bytes = local_source(base).fetch("firmwares/profile_a.bin").unwrap();

        assert_eq!(bytes, b"MERG".to_vec());
        assert!(server
            .join()
            .unwrap()
            .starts_with("GET /site/firmwares/profile_a.bin "));
    }

    #[test]
    fn picks_source_by_scheme() {
        assert_eq!(
            source_for("http://localhost:8000").unwrap().describe(),
            "http://localhost:8000"
        );
        assert_eq!(source_for("./site").unwrap().describe(), "./site");
    }

    #[test]
    fn reads_images_from_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(FIRMWARE_DIR)).unwrap();
        fs::write(dir.path().join("firmwares/profile_b.bin"), [0xe9, 0x03]).unwrap();

        let source = DirectorySource::new(dir.path());
        assert_eq!(source.fetch("firmwares/profile_b.bin").unwrap(), vec![0xe9, 0x03]);

        let missing = source.fetch("firmwares/profile_c.bin").unwrap_err();
        assert!(matches!(
            missing,
            FetchError::NotFound { ref path, status: None } if path == "firmwares/profile_c.bin"
        ));
    }
}
