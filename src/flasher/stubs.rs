//! Stub loader descriptors
//!
//! Stub images are not shipped with this crate; they are supplied by the
//! caller, either built from raw segments or loaded from the TOML files
//! produced from `esptool.py`'s JSON stubs.

use std::{fs, path::Path};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{error::StubError, Error};

/// Frame the stub sends once it is running
pub(crate) const EXPECTED_STUB_HANDSHAKE: &[u8] = b"OHAI";

/// Flash stub object (deserialized from TOML, converted from JSON as used by
/// `esptool.py`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    /// Text (base64 encoded)
    text: String,
    /// Start of text section address
    text_start: u32,
    /// Data (base64 encoded)
    data: String,
    /// Start of data section address
    data_start: u32,
}

impl FlashStub {
    /// Build a stub from its raw segments
    pub fn new(entry: u32, text: (u32, &[u8]), data: (u32, &[u8])) -> Self {
        FlashStub {
            entry,
            text: general_purpose::STANDARD.encode(text.1),
            text_start: text.0,
            data: general_purpose::STANDARD.encode(data.1),
            data_start: data.0,
        }
    }

    /// Parse a stub descriptor, checking that both segments decode
    pub fn from_toml_str(s: &str) -> Result<Self, StubError> {
        let stub: FlashStub = toml::from_str(s)?;
        stub.text()?;
        stub.data()?;

        Ok(stub)
    }

    /// Read and parse a stub descriptor file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .map_err(|err| Error::FileOpen(path.display().to_string(), err))?;

        Ok(Self::from_toml_str(&s)?)
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> Result<(u32, Vec<u8>), StubError> {
        let v = general_purpose::STANDARD
            .decode(&self.text)
            .map_err(|err| StubError::Base64("text", err))?;
        Ok((self.text_start, v))
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> Result<(u32, Vec<u8>), StubError> {
        let v = general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|err| StubError::Base64("data", err))?;
        Ok((self.data_start, v))
    }
}
