use clap::{Parser, Subcommand};
use esploader::cli::{self, initialize_logger, ConnectArgs, WriteBinArgs};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Display information about the connected board and exit without flashing
    BoardInfo(ConnectArgs),
    WriteBin(WriteBinArgs),
    /// Erase the entire flash of the connected board (needs a stub)
    EraseFlash(ConnectArgs),
}

impl Commands {
    fn connect_args(&self) -> &ConnectArgs {
        match self {
            Commands::BoardInfo(args) | Commands::EraseFlash(args) => args,
            Commands::WriteBin(args) => &args.connect_args,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse().subcommand;

    initialize_logger(match args.connect_args().verbose {
        true => LevelFilter::Debug,
        false => LevelFilter::Info,
    });
    debug!("{:#?}", args);

    match args {
        Commands::BoardInfo(args) => cli::board_info(args).await,
        Commands::WriteBin(args) => cli::write_bin(args).await,
        Commands::EraseFlash(args) => cli::erase_flash(args).await,
    }
}
