use crate::{
    targets::{Chip, MacAddress, ReadEFuse, Target, EFUSE_WORDS},
    Error,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x1512_2500];

const UART_CLKDIV_REG: u32 = 0x3ff4_0014; // UART0_BASE_REG + 0x14

/// ESP32 Target
pub struct Esp32;

impl Esp32 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl ReadEFuse for Esp32 {
    fn efuse_reg(&self) -> u32 {
        0x3ff5_a000
    }
}

impl Target for Esp32 {
    fn chip(&self) -> Chip {
        Chip::Esp32
    }

    fn mac_address(&self, efuses: &[u32; EFUSE_WORDS]) -> Result<MacAddress, Error> {
        let [_, mac1, mac2, _] = *efuses;

        Ok(MacAddress([
            (mac2 >> 8) as u8,
            mac2 as u8,
            (mac1 >> 24) as u8,
            (mac1 >> 16) as u8,
            (mac1 >> 8) as u8,
            mac1 as u8,
        ]))
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        UART_CLKDIV_REG
    }

    fn rom_needs_spi_params(&self) -> bool {
        true
    }
}
