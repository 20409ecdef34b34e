use std::{fs, io, path::PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use dfuflash::{
    cli::{
        cancel_on_ctrlc, config::Config, connect, detach, device_info, print_device_list,
        ConnectArgs, FlashProgress,
    },
    logging::initialize_logger,
    FirmwareImage,
};
use log::{debug, LevelFilter};
use miette::{IntoDiagnostic, Result, WrapErr};

#[derive(Debug, Parser)]
#[clap(about, propagate_version = true, version)]
struct Cli {
    #[clap(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate completions for the given shell
    Completions(CompletionsArgs),
    /// Ask a run-time device to detach into its DFU bootloader, without
    /// flashing anything
    Detach(ConnectArgs),
    /// Flash a firmware image to a target device
    Flash(FlashArgs),
    /// Display information about the connected device and exit without
    /// flashing
    Info(ConnectArgs),
    /// List DFU-capable devices currently on the bus
    List,
    /// Read the device's current firmware back into a file
    ReadBack(ReadBackArgs),
}

#[derive(Debug, Args)]
struct CompletionsArgs {
    /// Shell to create completions for
    shell: Shell,
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Firmware image to flash
    image: PathBuf,

    #[clap(flatten)]
    connect_args: ConnectArgs,

    /// Read the firmware back after flashing and compare it against the image
    #[clap(long)]
    verify: bool,
}

#[derive(Debug, Args)]
struct ReadBackArgs {
    /// File to save the firmware to
    file: PathBuf,

    #[clap(flatten)]
    connect_args: ConnectArgs,
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

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match args {
        Commands::Completions(args) => completions(args),
        Commands::Detach(args) => detach(args),
        Commands::Flash(args) => flash(args, &config),
        Commands::Info(args) => device_info(args, &config),
        Commands::List => print_device_list(),
        Commands::ReadBack(args) => read_back(args, &config),
    }
}

fn completions(args: CompletionsArgs) -> Result<()> {
    clap_complete::generate(
        args.shell,
        &mut Cli::command(),
        "dfuflash",
        &mut io::stdout(),
    );

    Ok(())
}

fn flash(args: FlashArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config, args.verify)?;

    // Read the firmware from the given path and load it to the target.
    let data = fs::read(&args.image)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open image {}", args.image.display()))?;
    let image = FirmwareImage::new(data);

    let cancel = cancel_on_ctrlc()?;
    let mut progress = FlashProgress::default();
    flasher.upload_firmware(&image, Some(&mut progress), &cancel)?;

    Ok(())
}

fn read_back(args: ReadBackArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config, false)?;

    let data = flasher.read_firmware()?;
    fs::write(&args.file, &data)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to save firmware to {}", args.file.display()))?;

    Ok(())
}
