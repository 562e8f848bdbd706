//! In-memory transport backed by tokio channels
//!
//! [channel] returns a [ChannelTransport] for the loader and a [DeviceEnd]
//! through which whatever plays the device (a simulator, a test, a bridge to
//! another byte source) observes what the host does and feeds bytes back.

use std::{io, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::transport::{ByteSource, ReadHandle, Transport};

/// Something the host did to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// Bytes written by the host
    Data(Vec<u8>),
    /// The host asked for a reset into the bootloader
    Reset,
    /// The host switched to a new baud rate
    Baud(u32),
}

/// Something delivered to the host's read side
#[derive(Debug)]
pub enum Incoming {
    Data(Vec<u8>),
    /// End of stream for the current read handle
    Eof,
    /// A read error for the current read handle
    Error(io::Error),
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Incoming>>>;

/// Create a connected transport and device end
pub fn channel(baud: u32) -> (ChannelTransport, DeviceEnd) {
    let (host_tx, host_rx) = mpsc::unbounded_channel();
    let (device_tx, device_rx) = mpsc::unbounded_channel();

    let transport = ChannelTransport {
        events: host_tx,
        source: Arc::new(ChannelSource {
            incoming: Arc::new(Mutex::new(device_rx)),
        }),
        baud,
    };
    let device = DeviceEnd {
        events: host_rx,
        incoming: device_tx,
    };

    (transport, device)
}

/// The host side of an in-memory link
pub struct ChannelTransport {
    events: mpsc::UnboundedSender<HostEvent>,
    source: Arc<ChannelSource>,
    baud: u32,
}

impl ChannelTransport {
    fn emit(&self, event: HostEvent) -> io::Result<()> {
        self.events
            .send(event)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn source(&self) -> Arc<dyn ByteSource> {
        self.source.clone()
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.emit(HostEvent::Data(data.to_vec()))
    }

    async fn reset_to_bootloader(&mut self) -> io::Result<()> {
        self.emit(HostEvent::Reset)
    }

    async fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.emit(HostEvent::Baud(baud))?;
        self.baud = baud;

        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }
}

struct ChannelSource {
    incoming: SharedReceiver,
}

impl ByteSource for ChannelSource {
    fn open(&self) -> io::Result<Box<dyn ReadHandle>> {
        Ok(Box::new(ChannelReadHandle {
            incoming: self.incoming.clone(),
            pending: Vec::new(),
        }))
    }
}

struct ChannelReadHandle {
    incoming: SharedReceiver,
    pending: Vec<u8>,
}

#[async_trait]
impl ReadHandle for ChannelReadHandle {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.incoming.lock().await.recv().await {
                Some(Incoming::Data(bytes)) => self.pending = bytes,
                Some(Incoming::Eof) => return Ok(0),
                Some(Incoming::Error(err)) => return Err(err),
                // The device end is gone; nothing will ever arrive
                None => std::future::pending::<()>().await,
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);

        Ok(n)
    }
}

/// The device side of an in-memory link
pub struct DeviceEnd {
    events: mpsc::UnboundedReceiver<HostEvent>,
    incoming: mpsc::UnboundedSender<Incoming>,
}

impl DeviceEnd {
    /// Wait for the next thing the host does
    ///
    /// Returns `None` once the transport has been dropped.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HostEvent> {
        self.events.try_recv().ok()
    }

    /// Deliver bytes to the host
    pub fn send(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.incoming.send(Incoming::Data(bytes.into()));
    }

    /// Deliver an end-of-stream or error to the host's current read handle
    pub fn send_incoming(&self, incoming: Incoming) {
        let _ = self.incoming.send(incoming);
    }

    /// A cloneable handle for feeding the host from elsewhere
    pub fn sender(&self) -> mpsc::UnboundedSender<Incoming> {
        self.incoming.clone()
    }
}
