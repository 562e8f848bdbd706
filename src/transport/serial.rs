//! [Transport] over a local serial port
//!
//! The `serialport` crate is blocking, so every port access runs on tokio's
//! blocking pool. Reads use a short port timeout and are re-issued until data
//! arrives, which keeps each blocking call bounded and lets the
//! [StreamReader](crate::StreamReader) cancel a read between attempts.

use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use log::debug;
use serialport::SerialPort;
use tokio::{task::spawn_blocking, time::sleep};

use crate::{
    transport::{ByteSource, ReadHandle, Transport},
    Error,
};

/// Upper bound of a single blocking read
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Time the chip is held in reset
const RESET_HOLD: Duration = Duration::from_millis(100);
/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(50);
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: Duration = Duration::from_millis(550);

type Port = Arc<Mutex<Box<dyn SerialPort>>>;

fn lock(port: &Port) -> MutexGuard<'_, Box<dyn SerialPort>> {
    port.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A serial port connected to the bootloader UART
pub struct SerialTransport {
    port: Port,
    source: Arc<SerialSource>,
    baud: u32,
    resets: usize,
}

impl SerialTransport {
    /// Open `port_name` at `baud`
    pub fn open(port_name: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(port_name, baud)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader = port.try_clone()?;
        debug!("Opened {port_name} at {baud} baud");

        Ok(SerialTransport {
            port: Arc::new(Mutex::new(port)),
            source: Arc::new(SerialSource {
                port: Arc::new(Mutex::new(reader)),
            }),
            baud,
            resets: 0,
        })
    }

    pub fn name(&self) -> Option<String> {
        lock(&self.port).name()
    }

    fn set_lines(&self, dtr: bool, rts: bool) -> io::Result<()> {
        let mut port = lock(&self.port);
        port.write_data_terminal_ready(dtr)?;
        port.write_request_to_send(rts)?;

        Ok(())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn source(&self) -> Arc<dyn ByteSource> {
        self.source.clone()
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port.clone();
        let data = data.to_vec();

        spawn_blocking(move || {
            let mut port = lock(&port);
            port.write_all(&data)?;
            port.flush()
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Classic reset sequence, sets DTR and RTS sequentially
    ///
    /// Every other attempt waits longer before releasing IO0.
    async fn reset_to_bootloader(&mut self) -> io::Result<()> {
        let delay = match self.resets % 2 {
            0 => DEFAULT_RESET_DELAY,
            _ => EXTRA_RESET_DELAY,
        };
        self.resets += 1;
        debug!("Using Classic reset strategy with delay of {}ms", delay.as_millis());

        self.set_lines(false, true)?; // IO0 = HIGH, EN = LOW, chip in reset
        sleep(RESET_HOLD).await;

        self.set_lines(true, false)?; // IO0 = LOW, EN = HIGH, chip out of reset
        sleep(delay).await;

        lock(&self.port).write_data_terminal_ready(false)?; // IO0 = HIGH, done

        Ok(())
    }

    async fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        lock(&self.port).set_baud_rate(baud)?;
        self.baud = baud;

        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }
}

struct SerialSource {
    port: Port,
}

impl ByteSource for SerialSource {
    fn open(&self) -> io::Result<Box<dyn ReadHandle>> {
        let port = lock(&self.port).try_clone()?;

        Ok(Box::new(SerialReadHandle { port: Some(port) }))
    }
}

struct SerialReadHandle {
    /// Lent to the blocking pool while a read is in flight
    port: Option<Box<dyn SerialPort>>,
}

#[async_trait]
impl ReadHandle for SerialReadHandle {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // A cancelled read never hands the port back
            let Some(mut port) = self.port.take() else {
                return Ok(0);
            };

            let len = buf.len();
            let (port, result) = spawn_blocking(move || {
                let mut chunk = vec![0; len];
                let result = port.read(&mut chunk).map(|n| {
                    chunk.truncate(n);
                    chunk
                });
                (port, result)
            })
            .await
            .map_err(io::Error::other)?;
            self.port = Some(port);

            match result {
                Ok(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    return Ok(chunk.len());
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => continue,
                Err(err) => return Err(err),
            }
        }
    }
}
