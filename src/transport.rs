//! The byte-stream transport a loader talks through
//!
//! The loader never opens devices itself. It is handed something implementing
//! [Transport], which provides a writable sink, out-of-band control (reset
//! into the bootloader, baud rate) and a [ByteSource] from which the
//! [StreamReader](crate::StreamReader) acquires read handles.
//!
//! Read handles are acquired and released repeatedly: a handle that reports
//! end-of-stream or a [transient](is_transient) line error is dropped and a
//! fresh one is opened after a short delay.

use std::{io, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

pub mod channel;
#[cfg(feature = "serialport")]
pub mod serial;

/// Exclusive read access to the incoming byte stream
#[async_trait]
pub trait ReadHandle: Send {
    /// Read some bytes into `buf`, returning how many were read
    ///
    /// `Ok(0)` signals end-of-stream for this handle.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Something read handles can be opened on
pub trait ByteSource: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn ReadHandle>>;
}

/// A connection to a device's bootloader UART
#[async_trait]
pub trait Transport: Send {
    /// The readable side of the transport
    fn source(&self) -> Arc<dyn ByteSource>;

    /// Write all of `data` to the device
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Drive the device into its ROM bootloader
    async fn reset_to_bootloader(&mut self) -> io::Result<()>;

    /// Change the baud rate used on the host side
    async fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;

    /// The baud rate currently used on the host side
    fn baud_rate(&self) -> u32;
}

/// Line conditions a UART reports which don't invalidate the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("framing error on the serial line")]
    Framing,
    #[error("parity error on the serial line")]
    Parity,
    #[error("receive buffer overrun")]
    BufferOverrun,
    #[error("break condition on the serial line")]
    Break,
}

impl From<LineError> for io::Error {
    fn from(err: LineError) -> Self {
        io::Error::other(err)
    }
}

/// Whether a read error should be recovered from by reopening the handle
pub fn is_transient(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Interrupted {
        return true;
    }

    err.get_ref()
        .is_some_and(|inner| inner.is::<LineError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_errors_are_transient() {
        for err in [
            LineError::Framing,
            LineError::Parity,
            LineError::BufferOverrun,
            LineError::Break,
        ] {
            assert!(is_transient(&err.into()));
        }
    }

    #[test]
    fn interrupted_is_transient() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
    }

    #[test]
    fn other_errors_are_fatal() {
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_transient(&io::Error::other("device unplugged")));
    }
}
