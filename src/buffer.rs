//! Growable byte buffer with SLIP framing support
//!
//! [ByteBuffer] is used in two places: the [StreamReader](crate::StreamReader)
//! accumulates incoming bytes in one and extracts delimiter-bounded frames
//! from it, and every outgoing command is assembled in one before being
//! written to the transport.
//!
//! Escaping is an orthogonal [Escaping] policy rather than a separate buffer
//! type. While the policy is [Escaping::Slip], every write replaces `0xC0`
//! with `0xDB 0xDC` and `0xDB` with `0xDB 0xDD`. Frame extraction takes its
//! own policy argument, so a buffer filled with raw wire bytes can still hand
//! out decoded frames.
//!
//! See <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html#low-level-protocol>

use thiserror::Error;

/// SLIP frame delimiter
pub const END: u8 = 0xC0;
/// SLIP escape token
pub const ESC: u8 = 0xDB;
/// Escaped `END`
pub const ESC_END: u8 = 0xDC;
/// Escaped `ESC`
pub const ESC_ESC: u8 = 0xDD;

const DEFAULT_CAPACITY: usize = 64;

/// Byte substitution applied on writes, or undone on frame extraction
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Escaping {
    /// Bytes are stored and returned as they are
    #[default]
    None,
    /// SLIP escaping of `END` and `ESC`
    Slip,
}

/// Errors produced while packing integers into a buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    #[error("Pack format '{format}' expects {expected} values, {got} were supplied")]
    FormatMismatch {
        format: String,
        expected: usize,
        got: usize,
    },

    #[error("Unsupported character '{0}' in pack format")]
    UnsupportedToken(char),

    #[error("Payload of {0} bytes does not fit the 16-bit length field")]
    PayloadTooLarge(usize),
}

/// A growable byte accumulator with independent read and write cursors
///
/// The invariant `read_offset <= write_offset <= capacity` always holds.
/// Storage grows when a write would overflow and never shrinks; cursors are
/// reset to zero once everything written has been consumed.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    escaping: Escaping,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            storage: vec![0; capacity.max(1)],
            read_offset: 0,
            write_offset: 0,
            escaping: Escaping::None,
        }
    }

    /// Number of unread bytes
    pub fn len(&self) -> usize {
        self.write_offset - self.read_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn escaping(&self) -> Escaping {
        self.escaping
    }

    /// Select how subsequent writes are stored
    pub fn set_escaping(&mut self, escaping: Escaping) {
        self.escaping = escaping;
    }

    /// Zero both cursors and drop back to unescaped writes
    pub fn reset(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
        self.escaping = Escaping::None;
    }

    /// Consume a single byte
    pub fn shift(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }

        let byte = self.storage[self.read_offset];
        self.read_offset += 1;

        Some(byte)
    }

    /// Append `count` copies of `byte`
    pub fn fill(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.push(byte);
        }
    }

    /// Append a single byte, escaping it if the policy requires
    pub fn push(&mut self, byte: u8) {
        match (self.escaping, byte) {
            (Escaping::Slip, END) => self.write_raw(&[ESC, ESC_END]),
            (Escaping::Slip, ESC) => self.write_raw(&[ESC, ESC_ESC]),
            _ => self.write_raw(&[byte]),
        }
    }

    /// Append a slice of bytes, escaping them if the policy requires
    pub fn copy(&mut self, bytes: &[u8]) {
        match self.escaping {
            Escaping::None => self.write_raw(bytes),
            Escaping::Slip => bytes.iter().for_each(|&byte| self.push(byte)),
        }
    }

    /// Binary-encode `values` according to a compact format string
    ///
    /// `B`, `H` and `I` write 1, 2 and 4 bytes respectively. `<` switches to
    /// little endian (the default) and `>` to big endian for the tokens that
    /// follow. Nothing is written if the format is rejected.
    pub fn pack(&mut self, format: &str, values: &[u32]) -> Result<(), PackError> {
        let mut expected = 0;
        for token in format.chars() {
            match token {
                '<' | '>' => {}
                'B' | 'H' | 'I' => expected += 1,
                other => return Err(PackError::UnsupportedToken(other)),
            }
        }

        if expected != values.len() {
            return Err(PackError::FormatMismatch {
                format: format.to_string(),
                expected,
                got: values.len(),
            });
        }

        let mut little_endian = true;
        let mut values = values.iter();
        for token in format.chars() {
            let width = match token {
                '<' => {
                    little_endian = true;
                    continue;
                }
                '>' => {
                    little_endian = false;
                    continue;
                }
                'B' => 1,
                'H' => 2,
                _ => 4,
            };

            // Counted above, so there is always a value for this token
            let Some(&value) = values.next() else {
                break;
            };

            let bytes = value.to_le_bytes();
            let bytes = &bytes[..width];
            if little_endian {
                bytes.iter().for_each(|&byte| self.push(byte));
            } else {
                bytes.iter().rev().for_each(|&byte| self.push(byte));
            }
        }

        Ok(())
    }

    /// Extract the bytes between the next two `END` delimiters
    ///
    /// The read cursor advances past the closing delimiter. Two adjacent
    /// delimiters are a resynchronisation artifact: the empty span is skipped
    /// and the second delimiter opens the frame instead. Returns `None` until
    /// a complete frame is buffered. With [Escaping::Slip] the frame is
    /// decoded before being returned.
    pub fn packet(&mut self, escaping: Escaping) -> Option<Vec<u8>> {
        let mut start = None;
        let mut end = None;

        for i in self.read_offset..self.write_offset {
            if self.storage[i] != END {
                continue;
            }

            match start {
                Some(s) if s != i => {
                    end = Some(i);
                    break;
                }
                // First delimiter, or an empty frame right behind the last one
                _ => start = Some(i + 1),
            }
        }

        let (start, end) = (start?, end?);
        let frame = &self.storage[start..end];
        let frame = match escaping {
            Escaping::None => frame.to_vec(),
            Escaping::Slip => slip_decode(frame),
        };

        self.read_offset = end + 1;
        if self.read_offset == self.write_offset {
            self.read_offset = 0;
            self.write_offset = 0;
        }

        Some(frame)
    }

    /// Return every unread byte, optionally resetting the buffer
    pub fn view(&mut self, reset: bool) -> Vec<u8> {
        let bytes = self.storage[self.read_offset..self.write_offset].to_vec();
        if reset {
            self.reset();
        }

        bytes
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.storage[self.write_offset..self.write_offset + bytes.len()].copy_from_slice(bytes);
        self.write_offset += bytes.len();
    }

    fn ensure(&mut self, additional: usize) {
        let capacity = self.storage.len();
        if capacity - self.write_offset < additional {
            self.storage.resize(capacity + additional.max(capacity), 0);
        }
    }
}

/// Encode `data` with SLIP escaping, without delimiters
pub fn slip_encode(data: &[u8]) -> Vec<u8> {
    let mut buffer = ByteBuffer::with_capacity(data.len() + data.len() / 8 + 1);
    buffer.set_escaping(Escaping::Slip);
    buffer.copy(data);
    buffer.view(true)
}

/// Undo SLIP escaping
///
/// An `ESC` that isn't followed by `ESC_END` or `ESC_ESC` is kept as is.
pub fn slip_decode(data: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied().peekable();

    while let Some(byte) = bytes.next() {
        if byte == ESC {
            match bytes.peek() {
                Some(&ESC_END) => {
                    bytes.next();
                    decoded.push(END);
                    continue;
                }
                Some(&ESC_ESC) => {
                    bytes.next();
                    decoded.push(ESC);
                    continue;
                }
                _ => {}
            }
        }
        decoded.push(byte);
    }

    decoded
}
