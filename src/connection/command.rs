//! Commands understood by the ROM bootloader and the flasher stub

use std::{mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::{Display, FromRepr};

use crate::buffer::{ByteBuffer, PackError};

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
/// Default timeout of a whole-chip erase
pub const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
const FLASH_MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
pub(crate) const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Seed of the XOR checksum over data block payloads
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Size of the fixed request/response header
pub const HEADER_LEN: usize = 8;

/// Types of commands that can be sent to a target device
///
/// https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html#supported-by-stub-loader-and-rom-loader
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    // Commands supported by every bootloader
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    // Commands supported by the ESP32 family bootloaders
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashMd5 = 0x13,
    // Stub-only commands
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::MemEnd => MEM_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => ERASE_CHIP_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout based on the size
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin | CommandType::EraseRegion => {
                calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData => calc_timeout(ERASE_WRITE_TIMEOUT_PER_MB, size),
            CommandType::FlashMd5 => calc_timeout(FLASH_MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        total_size: u32,
    },
    SpiAttach,
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
        }
    }

    /// Return a timeout based on the size
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    /// Write the header and payload of a command into `buffer`
    ///
    /// The buffer's escaping policy applies, so this writes the unframed
    /// request when escaping is off and its SLIP-escaped form otherwise.
    pub fn write(&self, buffer: &mut ByteBuffer) -> Result<(), PackError> {
        let op = self.command_type() as u32;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
            } => begin_command(buffer, op, size, blocks, block_size, offset, supports_encryption),
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => data_command(buffer, op, data, pad_to, pad_byte, sequence),
            Command::FlashEnd { reboot } => write_basic(buffer, op, &[u8::from(!reboot)], 0),
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => begin_command(buffer, op, size, blocks, block_size, offset, false),
            Command::MemData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => data_command(buffer, op, data, pad_to, pad_byte, sequence),
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(no_entry),
                    entry,
                };
                write_basic(buffer, op, bytes_of(&params), 0)
            }
            Command::Sync => write_basic(buffer, op, &SYNC_FRAME, 0),
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    address: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    address,
                    value,
                    mask: mask.unwrap_or(0xFFFF_FFFF),
                    delay_us: 0,
                };
                write_basic(buffer, op, bytes_of(&params), 0)
            }
            Command::ReadReg { address } => {
                buffer.pack("<BBHI", &[0, op, 4, 0])?;
                buffer.pack("<I", &[address])
            }
            Command::SpiSetParams { total_size } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct SpiSetParams {
                    fl_id: u32,
                    total_size: u32,
                    block_size: u32,
                    sector_size: u32,
                    page_size: u32,
                    status_mask: u32,
                }
                let params = SpiSetParams {
                    fl_id: 0,
                    total_size,
                    block_size: 0x1_0000,
                    sector_size: 0x1000,
                    page_size: 0x100,
                    status_mask: 0xFFFF,
                };
                write_basic(buffer, op, bytes_of(&params), 0)
            }
            Command::SpiAttach => write_basic(buffer, op, &[0; 8], 0),
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                buffer.pack("<BBHI", &[0, op, 8, 0])?;
                buffer.pack("<II", &[new_baud, prior_baud])
            }
            Command::FlashMd5 { offset, size } => {
                buffer.pack("<BBHI", &[0, op, 16, 0])?;
                buffer.pack("<IIII", &[offset, size, 0, 0])
            }
            Command::EraseFlash => write_basic(buffer, op, &[], 0),
            Command::EraseRegion { offset, size } => {
                buffer.pack("<BBHI", &[0, op, 8, 0])?;
                buffer.pack("<II", &[offset, size])
            }
        }
    }
}

/// Write a header, then a data array
fn write_basic(buffer: &mut ByteBuffer, op: u32, data: &[u8], checksum: u32) -> Result<(), PackError> {
    buffer.pack("<BBHI", &[0, op, payload_len(data.len())?, checksum])?;
    buffer.copy(data);
    Ok(())
}

/// Write a Begin command
fn begin_command(
    buffer: &mut ByteBuffer,
    op: u32,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    supports_encryption: bool,
) -> Result<(), PackError> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encrypted: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
        encrypted: 0,
    };

    let bytes = bytes_of(&params);
    let data = if !supports_encryption {
        // Only the ESP32-S2 ROM takes the `encrypted` word
        &bytes[..bytes.len() - 4]
    } else {
        bytes
    };
    write_basic(buffer, op, data, 0)
}

/// Write a Data command, padding the block to `pad_to` bytes
fn data_command(
    buffer: &mut ByteBuffer,
    op: u32,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> Result<(), PackError> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    buffer.pack("<BBHI", &[0, op, payload_len(total_length)?, check as u32])?;
    buffer.copy(bytes_of(&params));
    buffer.copy(block_data);
    buffer.fill(pad_byte, pad_length);
    Ok(())
}

/// Value of the header's length field
fn payload_len(len: usize) -> Result<u32, PackError> {
    u16::try_from(len)
        .map(u32::from)
        .map_err(|_| PackError::PayloadTooLarge(len))
}

/// Running XOR over `data`, starting from `checksum`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}
