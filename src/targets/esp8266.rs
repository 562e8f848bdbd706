use crate::{
    targets::{Chip, MacAddress, ReadEFuse, Target, EFUSE_WORDS},
    Error,
};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0006_2000];

const UART_CLKDIV_REG: u32 = 0x6000_0014;

const XTAL_CLK_DIVIDER: u32 = 2;

/// ESP8266 Target
pub struct Esp8266;

impl Esp8266 {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(value: u32) -> bool {
        CHIP_DETECT_MAGIC_VALUES.contains(&value)
    }
}

impl ReadEFuse for Esp8266 {
    fn efuse_reg(&self) -> u32 {
        0x3ff0_0050
    }
}

impl Target for Esp8266 {
    fn chip(&self) -> Chip {
        Chip::Esp8266
    }

    fn mac_address(&self, efuses: &[u32; EFUSE_WORDS]) -> Result<MacAddress, Error> {
        let [mac0, mac1, _, mac3] = *efuses;

        let oui = if mac3 != 0 {
            [(mac3 >> 16) as u8, (mac3 >> 8) as u8, mac3 as u8]
        } else {
            match (mac1 >> 16) & 0xff {
                0 => [0x18, 0xfe, 0x34],
                1 => [0xac, 0xd0, 0x74],
                _ => return Err(Error::InvalidResponse("unknown OUI in eFuses".into())),
            }
        };

        Ok(MacAddress([
            oui[0],
            oui[1],
            oui[2],
            (mac1 >> 8) as u8,
            mac1 as u8,
            (mac0 >> 24) as u8,
        ]))
    }

    fn uart_clkdiv_reg(&self) -> u32 {
        UART_CLKDIV_REG
    }

    fn xtal_clk_divider(&self) -> u32 {
        XTAL_CLK_DIVIDER
    }

    fn rom_status_len(&self) -> usize {
        2
    }

    fn rom_needs_spi_attach(&self) -> bool {
        false
    }

    fn rom_erase_size_bug(&self) -> bool {
        true
    }

    fn rom_supports_md5(&self) -> bool {
        false
    }
}
