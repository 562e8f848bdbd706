//! Establish a connection with a target device
//!
//! The [Connection] struct owns the transport and the [StreamReader] on its
//! read side, frames outgoing commands, matches incoming responses to the
//! request they answer, and provides the low-level operations (sync, register
//! access, baud rate switching) the [Flasher](crate::Flasher) builds on.

use std::time::Duration;

use log::{debug, warn};
use tokio::time::{sleep, Instant};

use self::command::{Command, CommandType, HEADER_LEN};
use crate::{
    buffer::{ByteBuffer, Escaping, END},
    error::{ConnectionError, Error, ResultExt, RomError},
    reader::{ListenGuard, StreamReader},
    transport::Transport,
};

pub mod command;

pub(crate) const MAX_CONNECT_ATTEMPTS: usize = 7;
const MAX_SYNC_ATTEMPTS: usize = 5;
/// The ROM may answer a single SYNC up to eight times
const MAX_SYNC_REPLIES: usize = 8;
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);
/// How long the line must stay quiet after a reset or sync
const SILENCE_TIMEOUT: Duration = Duration::from_millis(100);
const SILENCE_RETRIES: usize = 20;

/// Direction byte of a response
pub const DIRECTION_RESPONSE: u8 = 0x01;

/// A response from a target device following a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub return_op: u8,
    /// The 32-bit value field of the header
    pub value: u32,
    /// The payload, including the trailing status bytes until checked
    pub data: Vec<u8>,
}

impl CommandResponse {
    /// Parse a decoded frame, returning `None` if it isn't a response
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < HEADER_LEN || frame[0] != DIRECTION_RESPONSE {
            return None;
        }

        let length = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        let data = &frame[HEADER_LEN..];
        if data.len() < length {
            return None;
        }

        Some(CommandResponse {
            return_op: frame[1],
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            data: data[..length].to_vec(),
        })
    }
}

/// An established connection with a target device
pub struct Connection {
    transport: Box<dyn Transport>,
    reader: StreamReader,
    status_len: Option<usize>,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let reader = StreamReader::new(transport.source());

        Connection {
            transport,
            reader,
            status_len: None,
        }
    }

    /// Start the reader if needed, then reset the device into its bootloader
    /// and synchronise, up to `attempts` times
    pub async fn begin(&mut self, attempts: usize) -> Result<(), Error> {
        if self.reader.has_loop() && !self.reader.is_running() {
            if let Some(err) = self.reader.stop().await? {
                warn!("Restarting reader which had stopped: {err}");
            }
        }
        if !self.reader.has_loop() {
            self.reader.start()?;
        }
        self.status_len = None;

        for attempt in 1..=attempts {
            match self.connect_attempt().await {
                Ok(()) => return Ok(()),
                Err(err) => debug!("Connect attempt {attempt}/{attempts} failed: {err}"),
            }
        }

        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    async fn connect_attempt(&mut self) -> Result<(), Error> {
        self.transport.reset_to_bootloader().await?;

        if !self
            .reader
            .wait_silent(SILENCE_RETRIES, SILENCE_TIMEOUT)
            .await?
        {
            debug!("Device kept talking after reset");
        }

        let mut last_err = Error::Connection(ConnectionError::NoSyncReply);
        for _ in 0..MAX_SYNC_ATTEMPTS {
            match self.sync().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_timeout() => {
                    last_err = err;
                    sleep(SYNC_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err)
    }

    /// Exchange a SYNC with the bootloader
    ///
    /// Duplicate replies are drained and the line is given time to go quiet
    /// before returning.
    pub async fn sync(&mut self) -> Result<(), Error> {
        {
            let _listen = self.reader.listen()?;
            self.send_command(Command::Sync).await?;
            self.get_response(CommandType::Sync, CommandType::Sync.timeout())
                .await
                .for_command(CommandType::Sync)?;

            for _ in 1..MAX_SYNC_REPLIES {
                match self
                    .get_response(CommandType::Sync, CommandType::Sync.timeout())
                    .await
                {
                    Ok(_) => continue,
                    Err(err) if err.is_timeout() => break,
                    Err(err) => return Err(err),
                }
            }
        }

        if !self
            .reader
            .wait_silent(SILENCE_RETRIES, SILENCE_TIMEOUT)
            .await?
        {
            warn!("Line did not go quiet after sync");
        }

        Ok(())
    }

    /// Start buffering responses
    ///
    /// Hold the guard from before a command is sent until its response has
    /// been read, or a fast reply may be dropped.
    pub fn listen(&self) -> Result<ListenGuard, Error> {
        self.reader.listen()
    }

    /// Frame a command and write it to the transport
    pub async fn send_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing {} command", command.command_type());

        let mut buffer = ByteBuffer::with_capacity(256);
        buffer.push(END);
        buffer.set_escaping(Escaping::Slip);
        command.write(&mut buffer)?;
        buffer.set_escaping(Escaping::None);
        buffer.push(END);

        self.transport.write(&buffer.view(true)).await?;

        Ok(())
    }

    /// Wait for a response to `command_type`
    ///
    /// Frames that aren't responses, or that answer a different command, are
    /// discarded until the deadline passes.
    pub async fn get_response(
        &mut self,
        command_type: CommandType,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.reader.packet(HEADER_LEN, remaining).await?;

            match CommandResponse::parse(&frame) {
                Some(response) if response.return_op == command_type as u8 => {
                    return Ok(response);
                }
                Some(response) => debug!(
                    "Discarding response to {:#04x} while waiting for {command_type}",
                    response.return_op
                ),
                None => debug!("Discarding frame which is not a response: {:02x?}", frame),
            }
        }
    }

    /// Send a command, wait for its response and check the reported status
    ///
    /// Returns the response with the status bytes stripped from its data.
    pub async fn check_command(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();

        let _listen = self.reader.listen()?;
        self.send_command(command).await?;
        let response = self.get_response(ty, timeout).await.for_command(ty)?;

        self.check_status(ty, response)
    }

    /// Like [check_command](Self::check_command), using the command's default
    /// timeout
    pub async fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let timeout = command.command_type().timeout();
        self.check_command(command, timeout).await
    }

    /// Check the status trailer of `response`, stripping it from the data
    pub fn check_status(
        &self,
        command_type: CommandType,
        mut response: CommandResponse,
    ) -> Result<CommandResponse, Error> {
        let status_len = self.status_len.unwrap_or(match response.data.len() {
            4 => 4,
            _ => 2,
        });

        if response.data.len() < status_len {
            return Err(Error::InvalidResponse(format!(
                "{command_type} response carries {} bytes, expected at least {status_len}",
                response.data.len()
            )));
        }

        let status_at = response.data.len() - status_len;
        let (failed, error) = (response.data[status_at], response.data[status_at + 1]);
        if failed != 0 {
            return Err(RomError::new(command_type, error).into());
        }

        response.data.truncate(status_at);
        Ok(response)
    }

    /// Fix the length of the status trailer once the loader is known
    pub fn set_status_len(&mut self, status_len: usize) {
        self.status_len = Some(status_len);
    }

    pub fn status_len(&self) -> Option<usize> {
        self.status_len
    }

    /// Read a 32-bit register
    pub async fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        let response = self.command(Command::ReadReg { address }).await?;

        Ok(response.value)
    }

    /// Write a 32-bit register, optionally only the bits in `mask`
    pub async fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.command(Command::WriteReg {
            address,
            value,
            mask,
        })
        .await?;

        Ok(())
    }

    /// Switch the host side to a new baud rate
    ///
    /// The reader is restarted around the switch so no bytes received at the
    /// old rate linger in its buffer.
    pub async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        if let Some(err) = self.reader.stop().await? {
            debug!("Reader had stopped: {err}");
        }
        let result = self.transport.set_baud_rate(baud).await;
        self.reader.start()?;

        result.map_err(Error::from)
    }

    pub fn baud(&self) -> u32 {
        self.transport.baud_rate()
    }

    /// Stop reading from the transport
    ///
    /// Returns the error that had terminated the reader, if any.
    pub async fn close(&mut self) -> Result<Option<Error>, Error> {
        self.status_len = None;
        if !self.reader.has_loop() {
            return Ok(None);
        }

        self.reader.stop().await
    }

    pub fn reader(&self) -> &StreamReader {
        &self.reader
    }

    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }
}
