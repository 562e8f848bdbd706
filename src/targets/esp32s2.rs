use crate::{
    targets::{Chip, MacAddress, ReadEFuse, Target, EFUSE_WORDS},
    Error,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_0500];

const UART_CLKDIV_REG: u32 = 0x3f40_0014; // UART0_BASE_REG + 0x14

/// ESP32-S2 Target
pub struct Esp32s2;

impl Esp32s2 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl ReadEFuse for Esp32s2 {
    fn efuse_reg(&self) -> u32 {
        // EFUSE_RD_MAC_SPI_SYS_0_REG
        0x3f41_a044
    }
}

impl Target for Esp32s2 {
    fn chip(&self) -> Chip {
        Chip::Esp32s2
    }

    fn mac_address(&self, efuses: &[u32; EFUSE_WORDS]) -> Result<MacAddress, Error> {
        let [mac0, mac1, ..] = *efuses;

        Ok(MacAddress([
            (mac1 >> 8) as u8,
            mac1 as u8,
            (mac0 >> 24) as u8,
            (mac0 >> 16) as u8,
            (mac0 >> 8) as u8,
            mac0 as u8,
        ]))
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        UART_CLKDIV_REG
    }

    fn rom_supports_encryption(&self) -> bool {
        true
    }
}
