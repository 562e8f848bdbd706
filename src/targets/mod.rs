//! Supported chip families
//!
//! Everything chip specific lives here: how a chip is recognised, where its
//! eFuses and UART clock divider are mapped, how the MAC address is packed
//! into the eFuse words, and which ROM quirks the loader has to work around.
//! None of it talks to the device; the [Flasher](crate::Flasher) reads the
//! registers and hands the raw words to a [Target].

use std::fmt;

use log::warn;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::{
    targets::{esp32::Esp32, esp32s2::Esp32s2, esp8266::Esp8266},
    Error,
};

mod esp32;
mod esp32s2;
mod esp8266;

/// Register read to tell the chip families apart
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x6000_0078;

/// Number of eFuse words read per connection
pub const EFUSE_WORDS: usize = 4;

/// Supported crystal frequencies
#[derive(
    Debug, Default, Clone, Copy, Hash, PartialEq, Eq, Display, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[repr(u32)]
pub enum XtalFrequency {
    #[strum(serialize = "26 MHz")]
    /// 26 MHz
    _26Mhz,
    #[strum(serialize = "40 MHz")]
    /// 40 MHz
    #[default]
    _40Mhz,
}

impl XtalFrequency {
    /// Frequency in MHz
    pub fn mhz(&self) -> u32 {
        match self {
            XtalFrequency::_26Mhz => 26,
            XtalFrequency::_40Mhz => 40,
        }
    }
}

/// All supported devices
#[derive(
    Debug, Clone, Copy, Hash, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames, Serialize, Deserialize,
)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chip {
    /// ESP8266
    Esp8266,
    /// ESP32
    Esp32,
    /// ESP32-S2
    Esp32s2,
}

impl Chip {
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        if Esp8266::has_magic_value(magic) {
            Ok(Chip::Esp8266)
        } else if Esp32::has_magic_value(magic) {
            Ok(Chip::Esp32)
        } else if Esp32s2::has_magic_value(magic) {
            Ok(Chip::Esp32s2)
        } else {
            Err(Error::ChipDetect(magic))
        }
    }

    pub fn into_target(&self) -> Box<dyn Target> {
        match self {
            Chip::Esp8266 => Box::new(Esp8266),
            Chip::Esp32 => Box::new(Esp32),
            Chip::Esp32s2 => Box::new(Esp32s2),
        }
    }

    /// Human readable chip name
    pub fn name(&self) -> &'static str {
        match self {
            Chip::Esp8266 => "ESP8266",
            Chip::Esp32 => "ESP32",
            Chip::Esp32s2 => "ESP32-S2",
        }
    }
}

/// A station MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bytes_to_mac_addr(&self.0))
    }
}

/// Enable the reading of eFuses for a target
pub trait ReadEFuse {
    /// Returns the base address of the eFuse register
    fn efuse_reg(&self) -> u32;

    /// Address of the nth word of the eFuse region
    fn efuse_word_addr(&self, n: u32) -> u32 {
        self.efuse_reg() + (n * 0x4)
    }
}

/// Chip specific constants and derivations
pub trait Target: ReadEFuse + Send + Sync {
    fn chip(&self) -> Chip;

    /// Derive the MAC address from the first [EFUSE_WORDS] eFuse words
    fn mac_address(&self, efuses: &[u32; EFUSE_WORDS]) -> Result<MacAddress, Error>;

    /// Address of `UART_CLKDIV_REG`
    fn uart_clkdiv_reg(&self) -> u32;

    /// Divider between the crystal and the UART clock
    fn xtal_clk_divider(&self) -> u32 {
        1
    }

    /// Estimate the crystal frequency from the UART clock divider in use at
    /// `baud`
    fn crystal_freq(&self, uart_div: u32, baud: u32) -> XtalFrequency {
        let uart_div = uart_div & 0xf_ffff;
        let est_xtal = (baud as u64 * uart_div as u64) as f64 / 1_000_000.0
            / self.xtal_clk_divider() as f64;
        let norm_xtal = if est_xtal > 33.0 {
            XtalFrequency::_40Mhz
        } else {
            XtalFrequency::_26Mhz
        };

        if (norm_xtal.mhz() as f64 - est_xtal).abs() > 1.0 {
            warn!(
                "Detected crystal frequency ({:.2} MHz) is quite different to normalized frequency ({})",
                est_xtal, norm_xtal
            );
        }

        norm_xtal
    }

    /// Length of the status trailer in responses from the ROM loader
    fn rom_status_len(&self) -> usize {
        4
    }

    /// Whether the ROM expects SPI_ATTACH before touching flash
    fn rom_needs_spi_attach(&self) -> bool {
        true
    }

    /// Whether the ROM expects the flash geometry through SPI_SET_PARAMS
    fn rom_needs_spi_params(&self) -> bool {
        false
    }

    /// Whether the ROM's FLASH_BEGIN carries the `encrypted` word
    fn rom_supports_encryption(&self) -> bool {
        false
    }

    /// Whether the ROM's FLASH_BEGIN under-erases and needs a padded size
    fn rom_erase_size_bug(&self) -> bool {
        false
    }

    /// Whether the ROM implements FLASH_MD5
    fn rom_supports_md5(&self) -> bool {
        true
    }
}

fn bytes_to_mac_addr(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
