//! A library for talking to the serial bootloader of Espressif SoCs
//!
//! The crate drives the ROM loader of the ESP8266, ESP32 and ESP32-S2 (and
//! the stub loader that can replace it) over any byte-stream [Transport]:
//! synchronising after reset, identifying the chip, uploading a stub to RAM
//! and writing, verifying or erasing flash.
//!
//! ## As an application
//!
//! With the `cli` feature (on by default) an `esploader` binary is built:
//!
//! ```bash
//! esploader board-info --port /dev/ttyUSB0
//! esploader write-bin 0x10000 app.bin --stub stubs/esp32.toml
//! ```
//!
//! ## As a library
//!
//! ```toml
//! esploader = { version = "0.1", default-features = false, features = ["serialport"] }
//! ```
//!
//! The [Flasher] is the entry point; [Connection] and [StreamReader] expose
//! the command and framing layers underneath it.

pub use self::{
    buffer::{ByteBuffer, Escaping},
    config::Config,
    connection::Connection,
    error::Error,
    flasher::{stubs::FlashStub, Flasher, ProgressCallbacks},
    reader::{ListenGuard, StreamReader},
    targets::Chip,
    transport::Transport,
};

pub mod buffer;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod reader;
pub mod targets;
pub mod transport;
