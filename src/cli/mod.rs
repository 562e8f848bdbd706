//! Command-line helpers for the `esploader` binary
//!
//! No stability guaranties apply

use std::{fs, path::PathBuf};

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, LevelFilter};
use miette::{miette, IntoDiagnostic, Result, WrapErr};

use crate::{
    flasher::{ProgressCallbacks, ERASE_CHIP_TIMEOUT},
    transport::serial::SerialTransport,
    Config, FlashStub, Flasher,
};

/// Establish a connection with a target device
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "ESPLOADER_PORT")]
    pub port: Option<String>,
    /// Baud rate to switch to once connected
    #[arg(short = 'b', long, env = "ESPLOADER_BAUD")]
    pub baud: Option<u32>,
    /// Stub descriptor (TOML) to upload before flashing
    #[arg(long)]
    pub stub: Option<PathBuf>,
    /// Configuration file (TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
    /// Log protocol traffic
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Writes a binary file to a specific address in the chip's flash
#[derive(Debug, Args)]
pub struct WriteBinArgs {
    /// Address at which to write the binary file
    #[arg(value_parser = parse_u32)]
    pub addr: u32,
    /// File containing the binary data to write
    pub bin_file: PathBuf,
    /// Compare the flash content with the file afterwards
    #[arg(long)]
    pub verify: bool,
    /// Stay in the bootloader instead of running the new image
    #[arg(long)]
    pub no_reboot: bool,

    #[command(flatten)]
    pub connect_args: ConnectArgs,
}

/// Parse a decimal or `0x`-prefixed hexadecimal address
pub fn parse_u32(input: &str) -> Result<u32, String> {
    let parsed = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => input.replace('_', "").parse(),
    };

    parsed.map_err(|err| format!("invalid address '{input}': {err}"))
}

/// Initialize the logger with the given [LevelFilter], unless `RUST_LOG`
/// says otherwise
pub fn initialize_logger(filter: LevelFilter) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(filter.as_str()),
    )
    .format_target(false)
    .init();
}

/// Merge the configuration file, if any, with the command-line arguments
pub fn resolve_config(args: &ConnectArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(port) = &args.port {
        config.port = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.baud = Some(baud);
    }
    if let Some(stub) = &args.stub {
        config.stub = Some(stub.clone());
    }

    debug!("Effective configuration: {config:?}");
    Ok(config)
}

/// Open the serial port, connect to the bootloader and start the stub if one
/// is configured
pub async fn connect(config: &Config) -> Result<Flasher> {
    let port = config
        .port
        .as_deref()
        .ok_or_else(|| miette!("No serial port given, use `--port` or set `port` in the configuration"))?;

    info!("Serial port: '{port}'");
    info!("Connecting...");
    let transport = SerialTransport::open(port, config.rom_baud)
        .wrap_err_with(|| format!("Failed to open serial port {port}"))?;

    let mut flasher = Flasher::new(Box::new(transport), config);
    flasher.connect().await?;

    match &config.stub {
        Some(path) => {
            let stub = FlashStub::load(path)?;
            info!("Using flash stub");
            flasher.load_stub(&stub).await?;
        }
        None => {
            if let Some(baud) = config.baud {
                flasher.set_baud_rate(config.rom_baud, baud).await?;
            }
        }
    }

    Ok(flasher)
}

/// Connect to a target device and print information about it
pub async fn board_info(args: ConnectArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let mut flasher = connect(&config).await?;

    let info = flasher.device_info().await?;
    println!("Chip type:         {}", info.name);
    println!("Crystal frequency: {}", info.crystal_frequency);
    println!("MAC address:       {}", info.mac_address);
    println!("Loader:            {}", if info.stub { "stub" } else { "ROM" });

    disconnect(flasher).await
}

/// Write a binary file to flash
pub async fn write_bin(args: WriteBinArgs) -> Result<()> {
    let config = resolve_config(&args.connect_args)?;
    let data = fs::read(&args.bin_file)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open {}", args.bin_file.display()))?;

    let mut flasher = connect(&config).await?;
    let mut progress = EsploaderProgress::default();
    flasher
        .flash_data(&data, args.addr, args.verify, Some(&mut progress))
        .await?;
    flasher.flash_finish(!args.no_reboot).await?;
    info!("Binary successfully written to flash!");

    disconnect(flasher).await
}

/// Erase the entire flash; requires a stub
pub async fn erase_flash(args: ConnectArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    if config.stub.is_none() {
        return Err(miette!("Erasing the flash needs a stub, pass one with `--stub`"));
    }

    let mut flasher = connect(&config).await?;
    info!("Erasing flash...");
    flasher.erase_flash(ERASE_CHIP_TIMEOUT).await?;
    info!("Flash has been erased!");

    disconnect(flasher).await
}

async fn disconnect(mut flasher: Flasher) -> Result<()> {
    if let Some(err) = flasher.disconnect().await? {
        debug!("Reader stopped with: {err}");
    }

    Ok(())
}

/// Progress callback implementations for use in `esploader`
#[derive(Default)]
pub struct EsploaderProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for EsploaderProgress {
    /// Initialize the progress bar
    fn init(&mut self, addr: u32, len: usize) {
        let pb = ProgressBar::new(len as u64)
            .with_message(format!("{addr:#X}"))
            .with_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40}] {pos:>7}/{len:7} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );

        self.pb = Some(pb);
    }

    /// Update the progress bar
    fn update(&mut self, current: usize) {
        if let Some(ref pb) = self.pb {
            pb.set_position(current as u64);
        }
    }

    /// End the progress bar
    fn finish(&mut self) {
        if let Some(ref pb) = self.pb {
            pb.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() {
        assert_eq!(parse_u32("0x10000"), Ok(0x1_0000));
        assert_eq!(parse_u32("0X1_0000"), Ok(0x1_0000));
        assert_eq!(parse_u32("4096"), Ok(4096));
        assert!(parse_u32("0xzz").is_err());
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn arguments_override_config() {
        let args = ConnectArgs {
            port: Some("/dev/ttyUSB1".into()),
            baud: Some(460_800),
            stub: None,
            config: None,
            verbose: false,
        };

        let config = resolve_config(&args).unwrap();
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.baud, Some(460_800));
        assert_eq!(config.stub, None);
        assert_eq!(config.rom_baud, 115_200);
    }
}
