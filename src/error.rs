//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::{buffer::PackError, connection::command::CommandType, targets::Chip};

/// All possible errors returned by esploader
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Timeout while waiting for {0}response")]
    #[diagnostic(
        code(esploader::timeout),
        help("Make sure the device is in download mode and the baud rate matches")
    )]
    Timeout(TimedOutCommand),

    #[error("The stream reader is already running")]
    #[diagnostic(code(esploader::reader::already_running))]
    AlreadyRunning,

    #[error("The stream reader is not running")]
    #[diagnostic(code(esploader::reader::not_running))]
    NotRunning,

    #[error("Read attempted without an active listener")]
    #[diagnostic(
        code(esploader::reader::not_listening),
        help("Hold a `ListenGuard` from `StreamReader::listen` for the duration of the read")
    )]
    NotListening,

    #[error("Another read is already waiting for data")]
    #[diagnostic(code(esploader::reader::read_in_progress))]
    ReadAlreadyInProgress,

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    CommandFailed(#[from] RomError),

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Failed to change baud rate from {from} to {to}")]
    #[diagnostic(
        code(esploader::baud_rate),
        help("The connection has been restored at the previous baud rate")
    )]
    BaudRate {
        from: u32,
        to: u32,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    #[diagnostic(code(esploader::pack))]
    Pack(#[from] PackError),

    #[error("Unrecognized magic value: {0:#x}")]
    #[diagnostic(
        code(esploader::chip_detect_error),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetect(u32),

    #[error("Invalid response from the device: {0}")]
    #[diagnostic(code(esploader::invalid_response))]
    InvalidResponse(String),

    #[error("This command requires using the RAM stub")]
    #[diagnostic(
        code(esploader::stub_required),
        help("Load a stub with `--stub` before running this command")
    )]
    StubRequired,

    #[error("The device is not connected")]
    #[diagnostic(
        code(esploader::not_connected),
        help("Call `connect` before issuing commands")
    )]
    NotConnected,

    #[error("Block of {len} bytes does not fit the {max} byte block size of this session")]
    #[diagnostic(code(esploader::block_too_large))]
    BlockTooLarge { len: usize, max: usize },

    #[error("Verification of flash content failed")]
    #[diagnostic(code(esploader::verify_failed))]
    VerifyFailed,

    #[error("The stub descriptor is invalid")]
    #[diagnostic(transparent)]
    InvalidStub(#[from] StubError),

    #[error("Failed to load configuration")]
    #[diagnostic(code(esploader::config))]
    Config(#[from] toml::de::Error),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(esploader::file_open))]
    FileOpen(String, #[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl Error {
    /// Whether this error is a response timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esploader::connection_failed),
        help("Ensure that the device is connected and the reset and boot pins are not being held down")
    )]
    ConnectionFailed,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Invalid stub handshake response received")]
    #[diagnostic(
        code(esploader::stub_handshake),
        help("The stub image may not match the connected chip")
    )]
    InvalidStubHandshake,

    #[error("Download mode successfully detected, but getting no sync reply")]
    #[diagnostic(
        code(esploader::no_sync_reply),
        help("The serial TX path seems to be down")
    )]
    NoSyncReply,

    #[error("IO error while using the transport: {0}")]
    #[diagnostic(code(esploader::transport_error))]
    Transport(#[source] io::Error),

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Transport(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

/// A wait which has timed out, and the command it was waiting on if known
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl TimedOutCommand {
    pub fn command(&self) -> Option<CommandType> {
        self.command
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esploader::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(esploader::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esploader::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(esploader::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(esploader::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(esploader::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(esploader::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(esploader::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(esploader::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(esploader::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(esploader::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(esploader::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(esploader::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(esploader::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// A non-success status reported by the device for a command
#[derive(Clone, Copy, Debug, Diagnostic, Error, PartialEq, Eq)]
#[error("Error while running {command} command (status {status:#04x})")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    status: u8,
    #[source]
    #[diagnostic_source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, status: u8) -> RomError {
        RomError {
            command,
            status,
            kind: RomErrorKind::from(status),
        }
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    /// The raw status code reported by the device
    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

/// Invalid stub descriptor
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum StubError {
    #[error("Failed to parse stub descriptor")]
    #[diagnostic(code(esploader::stub::parse))]
    Parse(#[from] toml::de::Error),

    #[error("Segment '{0}' is not valid base64")]
    #[diagnostic(code(esploader::stub::base64))]
    Base64(&'static str, #[source] base64::DecodeError),
}

pub(crate) trait ResultExt {
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Timeout(_)) => Err(Error::Timeout(command.into())),
            res => res,
        }
    }
}
