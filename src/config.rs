//! Loader configuration
//!
//! All fields have defaults, so an empty file (or no file at all) gives a
//! working configuration. Command-line options take precedence over values
//! read from a file.
//!
//! ```toml
//! baud = 921600
//! connect_attempts = 10
//! flash_size = "8MB"
//! stub = "stubs/esp32.toml"
//! port = "/dev/ttyUSB0"
//! ```

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{connection::MAX_CONNECT_ATTEMPTS, Error};

/// Baud rate the ROM bootloader listens at after reset
pub const ESP_ROM_BAUD: u32 = 115_200;

const DEFAULT_FLASH_SIZE: u32 = 4 * 1024 * 1024;

/// Configuration for connecting to and flashing a device
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Baud rate used to reach the ROM bootloader
    pub rom_baud: u32,
    /// Baud rate to switch to once connected, or once the stub runs
    pub baud: Option<u32>,
    /// How many reset-and-sync rounds to attempt before giving up
    pub connect_attempts: usize,
    /// Size of the attached flash in bytes
    #[serde(deserialize_with = "deserialize_size")]
    pub flash_size: u32,
    /// Stub descriptor to upload after connecting
    pub stub: Option<PathBuf>,
    /// Serial port the device is attached to
    pub port: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rom_baud: ESP_ROM_BAUD,
            baud: None,
            connect_attempts: MAX_CONNECT_ATTEMPTS,
            flash_size: DEFAULT_FLASH_SIZE,
            stub: None,
            port: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        Ok(toml::from_str(s)?)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let s = read_to_string(path).map_err(|err| Error::FileOpen(path.display().to_string(), err))?;
        debug!("Config loaded from {}", path.display());

        Self::from_toml_str(&s)
    }
}

/// Accept a plain byte count, a hex string, or a size with a `KB`/`MB` suffix
fn deserialize_size<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u32),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(bytes) => Ok(bytes),
        Size::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_size(text: &str) -> Result<u32, String> {
    let text = text.trim().to_uppercase();
    let invalid = || format!("invalid size '{text}'");

    let (number, multiplier) = if let Some(hex) = text.strip_prefix("0X") {
        return u32::from_str_radix(hex, 16).map_err(|_| invalid());
    } else if let Some(mb) = text.strip_suffix("MB") {
        (mb, 1024 * 1024)
    } else if let Some(kb) = text.strip_suffix("KB") {
        (kb, 1024)
    } else {
        (text.as_str(), 1)
    };

    number
        .trim()
        .parse::<u32>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(invalid)
}
