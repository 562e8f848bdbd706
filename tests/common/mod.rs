//! A simulated ROM/stub loader on the far end of an in-memory transport
//!
//! The device decodes SLIP frames written by the host, checks payload
//! lengths, data checksums and block sequence numbers the way the ROM does,
//! and keeps its flash and RAM contents in memory for inspection.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use esploader::{
    buffer::{slip_decode, slip_encode, END},
    connection::command::{checksum, CHECKSUM_INIT},
    transport::channel::{channel, ChannelTransport, DeviceEnd, HostEvent, Incoming},
};
use md5::{Digest, Md5};
use tokio::sync::mpsc::UnboundedSender;

pub const FLASH_SIZE: usize = 0x40_0000;

pub const INVALID_MESSAGE: u8 = 0x05;
pub const BAD_DATA_LEN: u8 = 0xc0;
pub const BAD_DATA_CHECKSUM: u8 = 0xc1;
pub const INVALID_COMMAND: u8 = 0xc3;
pub const NOT_IN_FLASH_MODE: u8 = 0xc6;

const SYNC_PAYLOAD_LEN: usize = 36;
const BOOT_BANNER: &[u8] = b"ets Jun  8 2016 00:22:57\r\n\r\nrst:0x1 (POWERON_RESET),boot:0x3 (DOWNLOAD_BOOT(UART0/UART1/SDIO_REI_REO_V2))\r\nwaiting for download\r\n";

/// Chip specific register contents and ROM quirks
#[derive(Debug, Clone)]
pub struct Profile {
    pub magic: u32,
    pub efuse_base: u32,
    pub efuses: [u32; 4],
    pub clkdiv_reg: u32,
    pub clkdiv: u32,
    pub rom_status_len: usize,
    /// Words the ROM expects in FLASH_BEGIN
    pub flash_begin_words: usize,
    pub rom_md5: bool,
}

impl Profile {
    /// MAC 24:0a:c4:12:34:56, 40 MHz crystal
    pub fn esp32() -> Self {
        Profile {
            magic: 0x1512_2500,
            efuse_base: 0x3ff5_a000,
            efuses: [0, 0xc412_3456, 0x0000_240a, 0],
            clkdiv_reg: 0x3ff4_0014,
            clkdiv: 347,
            rom_status_len: 4,
            flash_begin_words: 4,
            rom_md5: true,
        }
    }

    /// MAC 7c:df:a1:01:02:03, 40 MHz crystal
    pub fn esp32s2() -> Self {
        Profile {
            magic: 0x0000_0500,
            efuse_base: 0x3f41_a044,
            efuses: [0xa101_0203, 0x0000_7cdf, 0, 0],
            clkdiv_reg: 0x3f40_0014,
            clkdiv: 347,
            rom_status_len: 4,
            flash_begin_words: 5,
            rom_md5: true,
        }
    }

    /// MAC 18:fe:34:ab:cd:ef, 26 MHz crystal
    pub fn esp8266() -> Self {
        Profile {
            magic: 0x0006_2000,
            efuse_base: 0x3ff0_0050,
            efuses: [0xef00_0000, 0x0000_abcd, 0, 0],
            clkdiv_reg: 0x6000_0014,
            clkdiv: 451,
            rom_status_len: 2,
            flash_begin_words: 4,
            rom_md5: false,
        }
    }
}

/// Misbehaviour to simulate
#[derive(Debug, Clone)]
pub struct Behaviour {
    /// Print a boot banner after every reset
    pub boot_banner: bool,
    /// Leave this many SYNC requests unanswered
    pub ignore_syncs: usize,
    /// Answers to each SYNC
    pub sync_replies: usize,
    pub reject_baud: bool,
    /// What the stub says once it runs
    pub stub_greeting: Vec<u8>,
    /// Flip a bit of every flash block written
    pub corrupt_flash: bool,
    /// Jump to the stub without answering MEM_END
    pub silent_mem_end: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Behaviour {
            boot_banner: true,
            ignore_syncs: 0,
            sync_replies: 4,
            reject_baud: false,
            stub_greeting: b"OHAI".to_vec(),
            corrupt_flash: false,
            silent_mem_end: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashBegin {
    pub size: u32,
    pub blocks: u32,
    pub block_size: u32,
    pub offset: u32,
    pub words: usize,
}

#[derive(Debug, Clone, Copy)]
struct Session {
    offset: u32,
    block_size: u32,
    next_sequence: u32,
}

/// Everything the device has seen and stored
#[derive(Debug)]
pub struct DeviceState {
    pub profile: Profile,
    pub behaviour: Behaviour,
    pub stub_running: bool,
    pub flash: Vec<u8>,
    pub ram_writes: Vec<(u32, Vec<u8>)>,
    pub registers: HashMap<u32, u32>,
    /// Opcodes of every well-formed request
    pub commands: Vec<u8>,
    pub resets: usize,
    /// Baud rate the host last switched to
    pub host_baud: Option<u32>,
    /// `(new, prior)` of every accepted CHANGE_BAUDRATE
    pub baud_changes: Vec<(u32, u32)>,
    pub flash_begins: Vec<FlashBegin>,
    pub spi_flash_size: Option<u32>,
    pub reboot: Option<bool>,
    pub entry: Option<u32>,
    pub rejected_sequences: Vec<u32>,
    /// Feeds the host's read side directly, e.g. with line errors
    pub line: UnboundedSender<Incoming>,
    syncs_seen: usize,
    flash_session: Option<Session>,
    mem_session: Option<Session>,
}

pub type Device = Arc<Mutex<DeviceState>>;

pub fn lock(device: &Device) -> MutexGuard<'_, DeviceState> {
    device.lock().unwrap()
}

/// Start a simulated device, returning the host's end of the link
pub fn spawn(profile: Profile, behaviour: Behaviour) -> (ChannelTransport, Device) {
    let (transport, device_end) = channel(115_200);
    let device = Arc::new(Mutex::new(DeviceState {
        profile,
        behaviour,
        stub_running: false,
        flash: vec![0xff; FLASH_SIZE],
        ram_writes: Vec::new(),
        registers: HashMap::new(),
        commands: Vec::new(),
        resets: 0,
        host_baud: None,
        baud_changes: Vec::new(),
        flash_begins: Vec::new(),
        spi_flash_size: None,
        reboot: None,
        entry: None,
        rejected_sequences: Vec::new(),
        line: device_end.sender(),
        syncs_seen: 0,
        flash_session: None,
        mem_session: None,
    }));

    tokio::spawn(run(device_end, device.clone()));

    (transport, device)
}

async fn run(mut end: DeviceEnd, device: Device) {
    let mut received = Vec::new();

    while let Some(event) = end.recv().await {
        match event {
            HostEvent::Reset => {
                received.clear();
                let banner = lock(&device).reset();
                if let Some(banner) = banner {
                    end.send(banner);
                }
            }
            HostEvent::Baud(baud) => lock(&device).host_baud = Some(baud),
            HostEvent::Data(bytes) => {
                received.extend(bytes);
                for frame in take_frames(&mut received) {
                    let replies = lock(&device).handle(&frame);
                    for reply in replies {
                        end.send(reply);
                    }
                }
            }
        }
    }
}

/// Split off every complete frame, keeping a trailing partial one
fn take_frames(received: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();

    loop {
        let Some(start) = received.iter().position(|&b| b == END) else {
            received.clear();
            break;
        };
        let Some(len) = received[start + 1..].iter().position(|&b| b == END) else {
            received.drain(..start);
            break;
        };

        let end = start + 1 + len;
        let frame = slip_decode(&received[start + 1..end]);
        received.drain(..end);
        if !frame.is_empty() {
            frames.push(frame);
        }
    }

    frames
}

fn framed(bytes: &[u8]) -> Vec<u8> {
    let mut frame = vec![END];
    frame.extend(slip_encode(bytes));
    frame.push(END);
    frame
}

fn words(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

impl DeviceState {
    fn reset(&mut self) -> Option<Vec<u8>> {
        self.resets += 1;
        self.stub_running = false;
        self.flash_session = None;
        self.mem_session = None;

        self.behaviour.boot_banner.then(|| BOOT_BANNER.to_vec())
    }

    fn status_len(&self) -> usize {
        match self.stub_running {
            true => 2,
            false => self.profile.rom_status_len,
        }
    }

    fn reply(&self, op: u8, value: u32, data: &[u8], error: Option<u8>) -> Vec<u8> {
        let mut status = vec![0; self.status_len()];
        if let Some(code) = error {
            status[0] = 1;
            status[1] = code;
        }

        let mut payload = data.to_vec();
        payload.extend(status);

        let mut message = vec![0x01, op];
        message.extend((payload.len() as u16).to_le_bytes());
        message.extend(value.to_le_bytes());
        message.extend(payload);

        framed(&message)
    }

    fn ok(&self, op: u8) -> Vec<Vec<u8>> {
        vec![self.reply(op, 0, &[], None)]
    }

    fn fail(&self, op: u8, code: u8) -> Vec<Vec<u8>> {
        vec![self.reply(op, 0, &[], Some(code))]
    }

    fn read_register(&self, address: u32) -> u32 {
        let profile = &self.profile;
        if address == 0x6000_0078 {
            return profile.magic;
        }
        if address == profile.clkdiv_reg {
            return profile.clkdiv;
        }
        if (profile.efuse_base..profile.efuse_base + 16).contains(&address) {
            return profile.efuses[((address - profile.efuse_base) / 4) as usize];
        }

        self.registers.get(&address).copied().unwrap_or(0)
    }

    fn handle(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        if frame.len() < 8 || frame[0] != 0x00 {
            return Vec::new();
        }

        let op = frame[1];
        let len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let data = &frame[8..];
        if data.len() != len {
            return self.fail(op, BAD_DATA_LEN);
        }
        self.commands.push(op);

        match op {
            // SYNC
            0x08 => {
                if data.len() != SYNC_PAYLOAD_LEN || data[..4] != [0x07, 0x07, 0x12, 0x20] {
                    return self.fail(op, INVALID_MESSAGE);
                }
                self.syncs_seen += 1;
                if self.syncs_seen <= self.behaviour.ignore_syncs {
                    return Vec::new();
                }
                (0..self.behaviour.sync_replies)
                    .map(|_| self.reply(op, 0, &[], None))
                    .collect()
            }
            // READ_REG
            0x0a => {
                let [address] = words(data)[..] else {
                    return self.fail(op, BAD_DATA_LEN);
                };
                vec![self.reply(op, self.read_register(address), &[], None)]
            }
            // WRITE_REG
            0x09 => {
                let [address, value, mask, _delay] = words(data)[..] else {
                    return self.fail(op, BAD_DATA_LEN);
                };
                let old = self.read_register(address);
                self.registers
                    .insert(address, (old & !mask) | (value & mask));
                self.ok(op)
            }
            // SPI_ATTACH
            0x0d => self.ok(op),
            // SPI_SET_PARAMS
            0x0b => {
                let params = words(data);
                if params.len() != 6 {
                    return self.fail(op, BAD_DATA_LEN);
                }
                self.spi_flash_size = Some(params[1]);
                self.ok(op)
            }
            // MEM_BEGIN
            0x05 => {
                let [_size, _blocks, block_size, offset] = words(data)[..] else {
                    return self.fail(op, BAD_DATA_LEN);
                };
                self.mem_session = Some(Session {
                    offset,
                    block_size,
                    next_sequence: 0,
                });
                self.ok(op)
            }
            // MEM_DATA
            0x07 => self.data_block(op, value, data, true),
            // MEM_END
            0x06 => {
                let [no_entry, entry] = words(data)[..] else {
                    return self.fail(op, BAD_DATA_LEN);
                };
                self.mem_session = None;
                let mut replies = match no_entry == 0 && self.behaviour.silent_mem_end {
                    true => Vec::new(),
                    false => self.ok(op),
                };
                if no_entry == 0 {
                    self.entry = Some(entry);
                    self.stub_running = true;
                    replies.push(framed(&self.behaviour.stub_greeting));
                }
                replies
            }
            // FLASH_BEGIN
            0x02 => {
                let params = words(data);
                let expected = match self.stub_running {
                    true => 4,
                    false => self.profile.flash_begin_words,
                };
                if params.len() != expected {
                    return self.fail(op, BAD_DATA_LEN);
                }

                let (size, blocks, block_size, offset) = (params[0], params[1], params[2], params[3]);
                let start = (offset as usize).min(FLASH_SIZE);
                let end = (offset as usize + size as usize).min(FLASH_SIZE);
                self.flash[start..end].fill(0xff);

                self.flash_begins.push(FlashBegin {
                    size,
                    blocks,
                    block_size,
                    offset,
                    words: params.len(),
                });
                self.flash_session = Some(Session {
                    offset,
                    block_size,
                    next_sequence: 0,
                });
                self.ok(op)
            }
            // FLASH_DATA
            0x03 => self.data_block(op, value, data, false),
            // FLASH_END
            0x04 => {
                if data.is_empty() {
                    return self.fail(op, BAD_DATA_LEN);
                }
                self.flash_session = None;
                self.reboot = Some(data[0] == 0);
                self.ok(op)
            }
            // CHANGE_BAUDRATE
            0x0f => {
                let [new_baud, prior_baud] = words(data)[..] else {
                    return self.fail(op, BAD_DATA_LEN);
                };
                if self.behaviour.reject_baud {
                    return self.fail(op, INVALID_COMMAND);
                }
                self.baud_changes.push((new_baud, prior_baud));
                self.ok(op)
            }
            // FLASH_MD5
            0x13 => {
                let [offset, size, _, _] = words(data)[..] else {
                    return self.fail(op, BAD_DATA_LEN);
                };
                if !self.stub_running && !self.profile.rom_md5 {
                    return self.fail(op, INVALID_COMMAND);
                }

                let digest = Md5::digest(&self.flash[offset as usize..(offset + size) as usize]);
                let digest = match self.stub_running {
                    true => digest.to_vec(),
                    false => digest
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<String>()
                        .into_bytes(),
                };
                vec![self.reply(op, 0, &digest, None)]
            }
            // ERASE_FLASH
            0xd0 => {
                if !self.stub_running {
                    return self.fail(op, INVALID_COMMAND);
                }
                self.flash.fill(0xff);
                self.ok(op)
            }
            // ERASE_REGION
            0xd1 => {
                let [offset, size] = words(data)[..] else {
                    return self.fail(op, BAD_DATA_LEN);
                };
                if !self.stub_running {
                    return self.fail(op, INVALID_COMMAND);
                }
                self.flash[offset as usize..(offset + size) as usize].fill(0xff);
                self.ok(op)
            }
            _ => self.fail(op, INVALID_COMMAND),
        }
    }

    fn data_block(&mut self, op: u8, value: u32, data: &[u8], ram: bool) -> Vec<Vec<u8>> {
        let session = match ram {
            true => self.mem_session,
            false => self.flash_session,
        };
        let Some(session) = session else {
            return self.fail(op, NOT_IN_FLASH_MODE);
        };
        if data.len() < 16 {
            return self.fail(op, BAD_DATA_LEN);
        }

        let header = words(&data[..16]);
        let (size, sequence) = (header[0], header[1]);
        let payload = &data[16..];
        if size as usize != payload.len() {
            return self.fail(op, BAD_DATA_LEN);
        }
        if u32::from(checksum(payload, CHECKSUM_INIT)) != value {
            return self.fail(op, BAD_DATA_CHECKSUM);
        }
        if sequence != session.next_sequence {
            self.rejected_sequences.push(sequence);
            return self.fail(op, INVALID_MESSAGE);
        }

        let address = session.offset + sequence * session.block_size;
        if ram {
            self.ram_writes.push((address, payload.to_vec()));
            if let Some(session) = self.mem_session.as_mut() {
                session.next_sequence += 1;
            }
        } else {
            let start = (address as usize).min(FLASH_SIZE);
            let end = (start + payload.len()).min(FLASH_SIZE);
            self.flash[start..end].copy_from_slice(&payload[..end - start]);
            if self.behaviour.corrupt_flash && end > start {
                self.flash[start] ^= 0x01;
            }
            if let Some(session) = self.flash_session.as_mut() {
                session.next_sequence += 1;
            }
        }

        self.ok(op)
    }
}
