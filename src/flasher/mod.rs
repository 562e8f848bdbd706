//! Write a binary application to a target device
//!
//! The [Flasher] drives a [Connection] through the loader's session
//! lifecycle: connect and identify the chip, optionally hand over to a stub,
//! then flash, verify or erase.

use std::time::Duration;

use log::{debug, info, warn};
use md5::{Digest, Md5};
use strum::Display;
use tokio::time::{sleep, Instant};

use self::stubs::{FlashStub, EXPECTED_STUB_HANDSHAKE};
use crate::{
    config::Config,
    connection::{
        command::{Command, CommandType, DEFAULT_TIMEOUT},
        CommandResponse, Connection,
    },
    error::ConnectionError,
    targets::{Chip, MacAddress, Target, XtalFrequency, CHIP_DETECT_MAGIC_REG_ADDR, EFUSE_WORDS},
    transport::Transport,
    Error,
};

pub mod stubs;

pub use crate::connection::command::ERASE_CHIP_TIMEOUT;

/// Block size of FLASH_DATA under the ROM loader
pub const FLASH_WRITE_SIZE: usize = 0x400;
/// Block size of FLASH_DATA under the stub
pub const STUB_FLASH_WRITE_SIZE: usize = 0x4000;
/// Largest MEM_DATA block
pub const MAX_RAM_BLOCK_SIZE: usize = 0x1800;
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;
pub const FLASH_SECTORS_PER_BLOCK: u32 = 16;

/// Time the device needs to settle on a new baud rate
const BAUD_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Where a [Flasher] is in its session lifecycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum FlasherState {
    #[default]
    Disconnected,
    Connecting,
    /// The bootloader answers, the chip is not identified yet
    Synced,
    Ready,
}

/// The chip behind a connection, resolved once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipIdentity {
    chip: Chip,
    efuses: [u32; EFUSE_WORDS],
}

impl ChipIdentity {
    pub fn chip(&self) -> Chip {
        self.chip
    }

    pub fn name(&self) -> &'static str {
        self.chip.name()
    }

    pub fn efuses(&self) -> [u32; EFUSE_WORDS] {
        self.efuses
    }

    pub fn mac_address(&self) -> Result<MacAddress, Error> {
        self.chip.into_target().mac_address(&self.efuses)
    }
}

/// Information about the connected device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// The chip being used
    pub chip: Chip,
    /// Human readable chip name
    pub name: &'static str,
    /// The crystal frequency of the chip
    pub crystal_frequency: XtalFrequency,
    /// MAC address
    pub mac_address: MacAddress,
    /// Whether the stub loader is running
    pub stub: bool,
}

/// Connect to and flash a target device
pub struct Flasher {
    /// Connection for flash operations
    connection: Connection,
    state: FlasherState,
    /// Indicate RAM stub loader is in use
    use_stub: bool,
    identity: Option<ChipIdentity>,
    /// Block size of the flash session in progress
    session_block_size: Option<usize>,
    connect_attempts: usize,
    flash_size: u32,
    baud: Option<u32>,
}

impl Flasher {
    pub fn new(transport: Box<dyn Transport>, config: &Config) -> Self {
        Flasher {
            connection: Connection::new(transport),
            state: FlasherState::Disconnected,
            use_stub: false,
            identity: None,
            session_block_size: None,
            connect_attempts: config.connect_attempts,
            flash_size: config.flash_size,
            baud: config.baud,
        }
    }

    /// Reset the device into its bootloader, synchronise and identify the chip
    pub async fn connect(&mut self) -> Result<Chip, Error> {
        self.state = FlasherState::Connecting;
        // A reset brings the ROM loader back
        self.use_stub = false;
        self.identity = None;
        self.session_block_size = None;

        match self.establish().await {
            Ok(chip) => {
                self.state = FlasherState::Ready;
                info!("Connected to {}", chip.name());
                Ok(chip)
            }
            Err(err) => {
                if let Err(close_err) = self.reset_session().await {
                    debug!("Closing after failed connect: {close_err}");
                }
                Err(err)
            }
        }
    }

    async fn establish(&mut self) -> Result<Chip, Error> {
        self.connection.begin(self.connect_attempts).await?;
        self.state = FlasherState::Synced;

        let magic = self.connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR).await?;
        let chip = Chip::from_magic(magic)?;
        debug!("Detected chip {chip} (magic {magic:#010x})");

        let target = chip.into_target();
        self.connection.set_status_len(target.rom_status_len());

        let efuses = read_efuse_words(&mut self.connection, target.as_ref()).await?;
        self.identity = Some(ChipIdentity { chip, efuses });

        Ok(chip)
    }

    /// Stop the connection and forget everything learned about the device
    ///
    /// Returns the error that had terminated the reader, if any.
    pub async fn disconnect(&mut self) -> Result<Option<Error>, Error> {
        let result = self.reset_session().await;
        debug!("Disconnected");
        result
    }

    async fn reset_session(&mut self) -> Result<Option<Error>, Error> {
        self.state = FlasherState::Disconnected;
        self.use_stub = false;
        self.identity = None;
        self.session_block_size = None;

        self.connection.close().await
    }

    pub fn state(&self) -> FlasherState {
        self.state
    }

    /// Whether the stub loader has replaced the ROM loader
    pub fn is_stub(&self) -> bool {
        self.use_stub
    }

    /// The active connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.connection.into_transport()
    }

    /// Re-synchronise with the loader
    pub async fn sync(&mut self) -> Result<(), Error> {
        self.ensure_synced()?;
        self.connection.sync().await
    }

    pub fn identity(&self) -> Result<&ChipIdentity, Error> {
        self.identity.as_ref().ok_or(Error::NotConnected)
    }

    /// The chip family that the flasher is connected to
    pub fn chip_family(&self) -> Result<Chip, Error> {
        Ok(self.identity()?.chip)
    }

    pub fn chip_name(&self) -> Result<&'static str, Error> {
        Ok(self.identity()?.name())
    }

    /// The eFuse words read when connecting
    pub fn efuses(&self) -> Result<[u32; EFUSE_WORDS], Error> {
        Ok(self.identity()?.efuses)
    }

    /// Read the eFuse words from the device again
    pub async fn read_efuses(&mut self) -> Result<[u32; EFUSE_WORDS], Error> {
        let chip = self.chip_family()?;
        let efuses = read_efuse_words(&mut self.connection, chip.into_target().as_ref()).await?;
        self.identity = Some(ChipIdentity { chip, efuses });

        Ok(efuses)
    }

    pub fn mac_address(&self) -> Result<MacAddress, Error> {
        self.identity()?.mac_address()
    }

    /// Estimate the crystal frequency from the UART divider at the current
    /// baud rate
    pub async fn crystal_frequency(&mut self) -> Result<XtalFrequency, Error> {
        let target = self.chip_family()?.into_target();
        let uart_div = self.connection.read_reg(target.uart_clkdiv_reg()).await?;

        Ok(target.crystal_freq(uart_div, self.connection.baud()))
    }

    /// Read and print any information we can about the connected device
    pub async fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let identity = *self.identity()?;
        let crystal_frequency = self.crystal_frequency().await?;

        Ok(DeviceInfo {
            chip: identity.chip,
            name: identity.name(),
            crystal_frequency,
            mac_address: identity.mac_address()?,
            stub: self.use_stub,
        })
    }

    pub async fn read_register(&mut self, address: u32) -> Result<u32, Error> {
        self.ensure_synced()?;
        self.connection.read_reg(address).await
    }

    pub async fn write_register(
        &mut self,
        address: u32,
        value: u32,
        mask: Option<u32>,
    ) -> Result<(), Error> {
        self.ensure_synced()?;
        self.connection.write_reg(address, value, mask).await
    }

    /// Switch the device and the transport from `previous` to `next` baud
    ///
    /// If the device doesn't acknowledge, the transport is returned to
    /// `previous`.
    pub async fn set_baud_rate(&mut self, previous: u32, next: u32) -> Result<(), Error> {
        self.ensure_ready()?;
        debug!("Change baud from {previous} to {next}");

        let prior_baud = match self.use_stub {
            true => previous,
            false => 0,
        };

        let result = match self
            .connection
            .command(Command::ChangeBaudrate {
                new_baud: next,
                prior_baud,
            })
            .await
        {
            Ok(_) => self.connection.set_baud(next).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            warn!("Baud rate change to {next} failed, staying at {previous}");
            self.connection.set_baud(previous).await?;
            return Err(Error::BaudRate {
                from: previous,
                to: next,
                source: Box::new(err),
            });
        }

        sleep(BAUD_SETTLE_DELAY).await;
        Ok(())
    }

    /// Upload a stub to RAM, start it and wait for its greeting
    ///
    /// Once the stub runs, the baud rate is raised to the configured one.
    pub async fn load_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        self.ensure_ready()?;
        if self.use_stub {
            debug!("Stub already running");
            return Ok(());
        }

        for (name, (addr, data)) in [("text", stub.text()?), ("data", stub.data()?)] {
            if data.is_empty() {
                continue;
            }
            debug!("Write {} byte stub {name} at {addr:#010x}", data.len());
            self.write_ram(addr, &data).await?;
        }

        debug!("Starting stub at {:#010x}", stub.entry());
        {
            // The greeting may follow the MEM_END response immediately
            let _listen = self.connection.listen()?;
            self.connection
                .send_command(Command::MemEnd {
                    no_entry: false,
                    entry: stub.entry(),
                })
                .await?;
            self.await_stub_greeting().await?;
        }

        self.use_stub = true;
        self.connection.set_status_len(2);
        info!("Stub is running");

        if let Some(baud) = self.baud {
            let current = self.connection.baud();
            if baud != current {
                self.set_baud_rate(current, baud).await?;
            }
        }

        Ok(())
    }

    /// Wait for the stub's greeting after the jump to its entry point
    ///
    /// A MEM_END response arriving first is checked. The ROM may also jump
    /// without answering, so the greeting alone is enough.
    async fn await_stub_greeting(&mut self) -> Result<(), Error> {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match self
                .connection
                .reader()
                .packet(EXPECTED_STUB_HANDSHAKE.len(), remaining)
                .await
            {
                Ok(frame) => frame,
                Err(err) if err.is_timeout() => {
                    return Err(ConnectionError::InvalidStubHandshake.into())
                }
                Err(err) => return Err(err),
            };

            if frame == EXPECTED_STUB_HANDSHAKE {
                return Ok(());
            }

            match CommandResponse::parse(&frame) {
                Some(response) if response.return_op == CommandType::MemEnd as u8 => {
                    self.connection.check_status(CommandType::MemEnd, response)?;
                }
                Some(response) => debug!(
                    "Discarding response to {:#04x} while waiting for the stub",
                    response.return_op
                ),
                None => {
                    debug!("Unexpected stub greeting {frame:02x?}");
                    return Err(ConnectionError::InvalidStubHandshake.into());
                }
            }
        }
    }

    async fn write_ram(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let blocks = data.len().div_ceil(MAX_RAM_BLOCK_SIZE) as u32;
        self.mem_begin(data.len() as u32, blocks, MAX_RAM_BLOCK_SIZE as u32, addr)
            .await?;

        for (sequence, block) in data.chunks(MAX_RAM_BLOCK_SIZE).enumerate() {
            self.mem_block(block, sequence as u32).await?;
        }

        Ok(())
    }

    /// Announce an upload to RAM
    pub async fn mem_begin(
        &mut self,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    ) -> Result<(), Error> {
        self.ensure_ready()?;
        self.connection
            .command(Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            })
            .await?;

        Ok(())
    }

    /// Send one block of a RAM upload
    pub async fn mem_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.ensure_ready()?;
        self.connection
            .command(Command::MemData {
                data,
                pad_to: data.len().next_multiple_of(4),
                pad_byte: 0,
                sequence,
            })
            .await?;

        Ok(())
    }

    /// Finish a RAM upload, jumping to `entry` unless it is zero
    ///
    /// The ROM may jump before it answers, so a missing response is not an
    /// error there.
    pub async fn mem_finish(&mut self, entry: u32) -> Result<(), Error> {
        self.ensure_ready()?;
        let result = self
            .connection
            .command(Command::MemEnd {
                no_entry: entry == 0,
                entry,
            })
            .await;

        match result {
            Err(err) if err.is_timeout() && !self.use_stub => {
                debug!("No MEM_END response, continuing");
                Ok(())
            }
            result => result.map(drop),
        }
    }

    fn flash_write_size(&self) -> usize {
        match self.use_stub {
            true => STUB_FLASH_WRITE_SIZE,
            false => FLASH_WRITE_SIZE,
        }
    }

    /// Begin a flash session for `size` bytes at `offset`
    ///
    /// Returns the number of blocks the device expects.
    pub async fn flash_begin(&mut self, size: u32, offset: u32) -> Result<u32, Error> {
        self.ensure_ready()?;
        let target = self.chip_family()?.into_target();
        let block_size = self.flash_write_size();
        let blocks = (size as usize).div_ceil(block_size) as u32;

        if !self.use_stub {
            if target.rom_needs_spi_attach() {
                self.connection.command(Command::SpiAttach).await?;
            }
            if target.rom_needs_spi_params() {
                self.connection
                    .command(Command::SpiSetParams {
                        total_size: self.flash_size,
                    })
                    .await?;
            }
        }

        let erase_len = match !self.use_stub && target.rom_erase_size_bug() {
            true => erase_size(size),
            false => size,
        };
        debug!(
            "Flash begin: {blocks} blocks of {block_size:#x} bytes at {offset:#010x}, erasing {erase_len:#x}"
        );

        self.connection
            .check_command(
                Command::FlashBegin {
                    size: erase_len,
                    blocks,
                    block_size: block_size as u32,
                    offset,
                    supports_encryption: !self.use_stub && target.rom_supports_encryption(),
                },
                CommandType::FlashBegin.timeout_for_size(erase_len),
            )
            .await?;

        self.session_block_size = Some(block_size);
        Ok(blocks)
    }

    /// Write one block of the current flash session
    ///
    /// Short blocks are padded with `0xff` to the session block size. Blocks
    /// are sent with the sequence number given; the device rejects gaps and
    /// reordering.
    pub async fn flash_block(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.ensure_ready()?;
        let block_size = self.session_block_size.unwrap_or_else(|| self.flash_write_size());
        if data.len() > block_size {
            return Err(Error::BlockTooLarge {
                len: data.len(),
                max: block_size,
            });
        }

        self.connection
            .check_command(
                Command::FlashData {
                    data,
                    pad_to: block_size,
                    pad_byte: 0xff,
                    sequence,
                },
                CommandType::FlashData.timeout_for_size(block_size as u32),
            )
            .await?;

        Ok(())
    }

    /// End the flash session, optionally rebooting into the new image
    pub async fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        self.ensure_ready()?;
        self.connection.command(Command::FlashEnd { reboot }).await?;
        self.session_block_size = None;

        Ok(())
    }

    /// Write a binary image to flash at `offset`
    ///
    /// With `verify` set, the flash content is compared with the image's MD5
    /// afterwards.
    pub async fn flash_data(
        &mut self,
        data: &[u8],
        offset: u32,
        verify: bool,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let blocks = self.flash_begin(data.len() as u32, offset).await?;
        let block_size = self.flash_write_size();

        if let Some(cb) = progress.as_mut() {
            cb.init(offset, blocks as usize)
        }

        for (sequence, block) in data.chunks(block_size).enumerate() {
            self.flash_block(block, sequence as u32).await?;

            if let Some(cb) = progress.as_mut() {
                cb.update(sequence + 1)
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish()
        }

        if verify {
            self.verify(data, offset).await?;
        }

        Ok(())
    }

    async fn verify(&mut self, data: &[u8], offset: u32) -> Result<(), Error> {
        let expected = Md5::digest(data);
        let actual = self.flash_md5(offset, data.len() as u32).await?;

        if actual[..] != expected[..] {
            debug!("Flash MD5 {actual:02x?} does not match {expected:02x?}");
            return Err(Error::VerifyFailed);
        }

        debug!("Verified {} bytes at {offset:#010x}", data.len());
        Ok(())
    }

    /// MD5 digest of a flash region, computed on the device
    pub async fn flash_md5(&mut self, offset: u32, size: u32) -> Result<[u8; 16], Error> {
        self.ensure_ready()?;
        if !self.use_stub && !self.chip_family()?.into_target().rom_supports_md5() {
            return Err(Error::StubRequired);
        }

        let response = self
            .connection
            .check_command(
                Command::FlashMd5 { offset, size },
                CommandType::FlashMd5.timeout_for_size(size),
            )
            .await?;

        parse_md5(&response.data)
    }

    /// Erase the entire flash
    pub async fn erase_flash(&mut self, timeout: Duration) -> Result<(), Error> {
        self.ensure_stub()?;
        debug!("Erasing the entire flash");

        self.connection
            .check_command(Command::EraseFlash, timeout)
            .await?;
        sleep(BAUD_SETTLE_DELAY).await;

        Ok(())
    }

    pub async fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        self.ensure_stub()?;
        debug!("Erasing region of 0x{:x}B at 0x{:08x}", size, offset);

        self.connection
            .check_command(
                Command::EraseRegion { offset, size },
                CommandType::EraseRegion.timeout_for_size(size),
            )
            .await?;

        Ok(())
    }

    fn ensure_synced(&self) -> Result<(), Error> {
        match self.state {
            FlasherState::Synced | FlasherState::Ready => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    fn ensure_ready(&self) -> Result<(), Error> {
        match self.state {
            FlasherState::Ready => Ok(()),
            _ => Err(Error::NotConnected),
        }
    }

    fn ensure_stub(&self) -> Result<(), Error> {
        self.ensure_ready()?;
        match self.use_stub {
            true => Ok(()),
            false => Err(Error::StubRequired),
        }
    }
}

async fn read_efuse_words(
    connection: &mut Connection,
    target: &dyn Target,
) -> Result<[u32; EFUSE_WORDS], Error> {
    let mut efuses = [0; EFUSE_WORDS];
    for (n, word) in efuses.iter_mut().enumerate() {
        *word = connection.read_reg(target.efuse_word_addr(n as u32)).await?;
    }

    Ok(efuses)
}

/// Size to announce in FLASH_BEGIN so the ESP8266 ROM erases all of `size`
///
/// Rounds up to whole sectors, adding a sector of slack for images smaller
/// than an erase block.
pub fn erase_size(size: u32) -> u32 {
    let sectors = size.div_ceil(FLASH_SECTOR_SIZE);
    let mut erase = sectors * FLASH_SECTOR_SIZE;
    if sectors < FLASH_SECTORS_PER_BLOCK {
        erase += FLASH_SECTOR_SIZE;
    }

    erase
}

/// The stub answers FLASH_MD5 with the raw digest, the ROM with hex digits
fn parse_md5(data: &[u8]) -> Result<[u8; 16], Error> {
    match data.len() {
        16 => {
            let mut digest = [0; 16];
            digest.copy_from_slice(data);
            Ok(digest)
        }
        32 => std::str::from_utf8(data)
            .ok()
            .and_then(|hex| u128::from_str_radix(hex, 16).ok())
            .map(u128::to_be_bytes)
            .ok_or_else(|| Error::InvalidResponse("FLASH_MD5 digest is not hexadecimal".into())),
        len => Err(Error::InvalidResponse(format!(
            "FLASH_MD5 digest of {len} bytes"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::channel::channel;

    #[test]
    fn erase_size_pads_small_images() {
        // One ROM block of 0x400 bytes
        let naive = 0x400u32.div_ceil(FLASH_WRITE_SIZE as u32) * FLASH_WRITE_SIZE as u32;
        assert!(erase_size(0x400) >= naive + FLASH_SECTOR_SIZE);
        assert_eq!(erase_size(0x400), 0x2000);
        assert_eq!(erase_size(1), 0x2000);
        assert_eq!(erase_size(0x1001), 0x3000);
        assert_eq!(erase_size(0), 0x1000);
    }

    #[test]
    fn erase_size_rounds_large_images_to_sectors() {
        assert_eq!(erase_size(0x10000), 0x10000);
        assert_eq!(erase_size(0x10001), 0x11000);
    }

    #[test]
    fn md5_from_stub_and_rom() {
        let raw: Vec<u8> = (0..16).collect();
        assert_eq!(parse_md5(&raw).unwrap().to_vec(), raw);

        let hex = b"000102030405060708090a0b0c0d0e0f";
        assert_eq!(parse_md5(hex).unwrap().to_vec(), raw);

        assert!(matches!(
            parse_md5(b"not a digest at all, not at all"),
            Err(Error::InvalidResponse(_))
        ));
        assert!(matches!(parse_md5(&[0; 4]), Err(Error::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn operations_need_a_connection() {
        let (transport, _device) = channel(115_200);
        let mut flasher = Flasher::new(Box::new(transport), &Config::default());

        assert_eq!(flasher.state(), FlasherState::Disconnected);
        assert!(matches!(flasher.chip_family(), Err(Error::NotConnected)));
        assert!(matches!(flasher.sync().await, Err(Error::NotConnected)));
        assert!(matches!(
            flasher.flash_begin(0x100, 0).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            flasher.erase_flash(ERASE_CHIP_TIMEOUT).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(flasher.disconnect().await, Ok(None)));
    }
}
