//! Command-line interface building blocks
//!
//! No stability guaranties apply

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use miette::{Report, Result};

use self::{config::Config, serial::InteractiveChooser};
use crate::{
    firmware::{source_for, FirmwareSelection},
    flasher::{FlashFrequency, FlashMode, FlashSize, FlashSizePolicy, WriteFlashOptions},
    orchestrator::{self, FlashOrchestrator},
    progress::{ProgressEvent, ProgressSink},
    serial::SerialBackend,
    session::{ConnectionPolicy, Session},
};

pub mod config;
mod serial;

const DEFAULT_RHYTHM: &str = "corto";
const DEFAULT_PERSONALITY: &str = "minimalista";
const DEFAULT_FIRMWARE_LOCATION: &str = ".";

/// Session talking to real hardware through an interactively chosen port
pub type SerialSession = Session<SerialBackend<InteractiveChooser>>;

/// Establish a connection with a target device
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "MEDITADOR_PORT")]
    pub port: Option<String>,
    /// When to put the device into its bootloader
    #[arg(long, value_enum)]
    pub policy: Option<ConnectionPolicy>,
    /// Log every frame exchanged with the device
    #[arg(long)]
    pub trace: bool,
}

/// Which firmware variant to use
#[derive(Debug, Args)]
pub struct SelectionArgs {
    /// Breathing rhythm, e.g. `corto` or `largo`
    #[arg(long, conflicts_with = "profile")]
    pub rhythm: Option<String>,
    /// Pet personality, e.g. `minimalista`
    #[arg(long, conflicts_with = "profile")]
    pub personality: Option<String>,
    /// Predefined profile instead of a rhythm and personality
    #[arg(long)]
    pub profile: Option<String>,
}

/// Flash parameters written into the image header
#[derive(Debug, Args)]
pub struct FlashConfigArgs {
    /// Flash frequency
    #[arg(short = 'f', long, value_enum)]
    pub flash_freq: Option<FlashFrequency>,
    /// Flash mode to use
    #[arg(short = 'm', long, value_enum)]
    pub flash_mode: Option<FlashMode>,
    /// Flash size of the target, the image's own is kept when omitted
    #[arg(short = 's', long, value_enum)]
    pub flash_size: Option<FlashSize>,
    /// Send the image uncompressed
    #[arg(long)]
    pub no_compress: bool,
}

/// Flash a firmware variant onto a device
#[derive(Debug, Args)]
pub struct FlashArgs {
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    #[clap(flatten)]
    pub selection: SelectionArgs,
    #[clap(flatten)]
    pub flash_config_args: FlashConfigArgs,
    /// Directory or URL containing the `firmwares/` folder
    #[arg(long, env = "MEDITADOR_FIRMWARE")]
    pub firmware: Option<String>,
}

/// Progress bar for the terminal
#[derive(Default)]
pub struct CliProgress {
    pb: Option<ProgressBar>,
}

impl CliProgress {
    fn bar(&mut self, total: usize) -> &ProgressBar {
        self.pb.get_or_insert_with(|| {
            let style = ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-");

            ProgressBar::new(100)
                .with_style(style)
                .with_message(format!("{total} bytes"))
        })
    }
}

impl ProgressSink for CliProgress {
    fn on_progress(&mut self, event: &ProgressEvent, percent: u8) {
        self.bar(event.bytes_total).set_position(percent.into());
    }

    fn on_finish(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish_with_message("done");
        }
    }
}

/// Resolve the selection from the arguments, falling back to the
/// configured and finally the built-in defaults
pub fn selection(args: &SelectionArgs, config: &Config) -> Result<FirmwareSelection> {
    if let Some(profile) = &args.profile {
        return Ok(FirmwareSelection::profile(profile)?);
    }

    let defaults = &config.project_config.selection;
    let rhythm = args
        .rhythm
        .as_deref()
        .or(defaults.rhythm.as_deref())
        .unwrap_or(DEFAULT_RHYTHM);
    let personality = args
        .personality
        .as_deref()
        .or(defaults.personality.as_deref())
        .unwrap_or(DEFAULT_PERSONALITY);

    Ok(FirmwareSelection::breathing(rhythm, personality)?)
}

/// Combine command-line flash parameters with the configured ones
pub fn flash_options(args: &FlashConfigArgs, config: &Config) -> WriteFlashOptions {
    let settings = &config.project_config.flash;
    let defaults = WriteFlashOptions::default();

    let flash_size = match args.flash_size.or(settings.size) {
        Some(size) => FlashSizePolicy::Size(size),
        None => FlashSizePolicy::Keep,
    };

    WriteFlashOptions {
        flash_size,
        flash_mode: args
            .flash_mode
            .or(settings.mode)
            .unwrap_or(defaults.flash_mode),
        flash_freq: args
            .flash_freq
            .or(settings.freq)
            .unwrap_or(defaults.flash_freq),
        erase_all: false,
        compress: !args.no_compress,
    }
}

/// Build a session and connect it to the selected port
pub fn connect(args: &ConnectArgs, config: &Config) -> Result<SerialSession> {
    let policy = args
        .policy
        .or(config.project_config.policy)
        .unwrap_or_default();
    let trace = args.trace || config.project_config.trace;

    let chooser = InteractiveChooser::new(args.port.clone(), config);
    let mut session = Session::new(SerialBackend::new(chooser), policy).with_trace(trace);

    info!("Connecting ({policy} policy)");
    session.connect()?;

    Ok(session)
}

/// Print the chip of the connected board
pub fn board_info(args: &ConnectArgs, config: &Config) -> Result<()> {
    let mut session = connect(args, config)?;
    let device = orchestrator::board_info(&mut session);
    session.disconnect();
    let device = device?;

    println!("Chip type:         {}", device.chip);

    Ok(())
}

/// Flash the selected variant onto the connected board
pub fn flash(args: &FlashArgs, config: &Config) -> Result<()> {
    let selection = selection(&args.selection, config)?;
    let location = args
        .firmware
        .as_deref()
        .or(config.project_config.firmware.as_deref())
        .unwrap_or(DEFAULT_FIRMWARE_LOCATION);

    let orchestrator = FlashOrchestrator::new(source_for(location)?)
        .with_options(flash_options(&args.flash_config_args, config));

    let mut session = connect(&args.connect_args, config)?;
    let report = orchestrator.flash(&mut session, &selection, &mut CliProgress::default());
    session.disconnect();
    let report = report?;

    for warning in report.warnings {
        eprintln!("{:?}", Report::new(warning));
    }

    println!(
        "\nFlashed {} ({} bytes) to the {}",
        report.selection, report.bytes_written, report.device.chip
    );

    Ok(())
}
