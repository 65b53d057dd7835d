use clap::{Args, Parser, Subcommand};
use log::{debug, LevelFilter};
use meditador_flash::{
    cli::{self, config::Config, ConnectArgs, FlashArgs, SelectionArgs},
    logging::initialize_logger,
};
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
    /// Flash a firmware variant onto the connected board
    Flash(FlashArgs),
    /// Print the path of the image a selection resolves to
    Path(PathArgs),
}

#[derive(Debug, Args)]
struct PathArgs {
    #[clap(flatten)]
    selection: SelectionArgs,
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match args {
        Commands::BoardInfo(args) => cli::board_info(&args, &config),
        Commands::Flash(args) => cli::flash(&args, &config),
        Commands::Path(args) => path(&args, &config),
    }
}

fn path(args: &PathArgs, config: &Config) -> Result<()> {
    let selection = cli::selection(&args.selection, config)?;
    println!("{}", selection.resource_path());

    Ok(())
}
