//! CLI utilities for the dfuflash binary
//!
//! No stability guaranties apply

use std::io::{stdin, IsTerminal};

use clap::Args;
use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};
use dialoguer::{theme::ColorfulTheme, Select};
use indicatif::{ProgressBar, ProgressStyle};
use miette::{IntoDiagnostic, Result};

use self::config::Config;
use crate::{
    error::Error,
    flasher::{DeviceInfo, Flasher},
    progress::{CancelToken, ProgressCallbacks},
    targets::{Chip, ProfileRegistry},
    transport::{usb::UsbTransport, DeviceIdentity, Transport},
};

pub mod config;

/// Common connection arguments
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Target chip, overriding what the USB identity resolves to
    #[clap(short, long)]
    pub chip: Option<Chip>,
    /// USB identity of the device to operate on
    #[clap(short, long, env = "DFUFLASH_DEVICE", value_name = "VID:PID", value_parser = parse_usb_id)]
    pub device: Option<(u16, u16)>,
}

/// Parse a `vid:pid` pair of hexadecimal USB identifiers
fn parse_usb_id(input: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = input
        .split_once(':')
        .ok_or_else(|| format!("'{input}' does not have the form vid:pid"))?;

    let parse = |id: &str| {
        u16::from_str_radix(id.trim_start_matches("0x"), 16)
            .map_err(|_| format!("'{id}' is not a hexadecimal USB identifier"))
    };

    Ok((parse(vid)?, parse(pid)?))
}

/// Select a USB device and connect to it, returning a [Flasher] ready for
/// transfers.
pub fn connect(args: &ConnectArgs, config: &Config, verify: bool) -> Result<Flasher> {
    let mut registry = ProfileRegistry::new();
    config.extend_registry(&mut registry)?;

    let mut transport = UsbTransport::new();
    let devices = transport.enumerate().map_err(Error::from)?;
    let device = select_device(devices, args)?;

    println!("USB device: {device}");
    println!("Connecting...\n");

    Ok(Flasher::connect(
        Box::new(transport),
        &device,
        args.chip,
        &registry,
        verify,
    )?)
}

fn select_device(
    devices: Vec<DeviceIdentity>,
    args: &ConnectArgs,
) -> Result<DeviceIdentity, Error> {
    let mut candidates = devices;
    if let Some((vid, pid)) = args.device {
        candidates.retain(|device| device.matches_id(vid, pid));
        if candidates.is_empty() {
            return Err(Error::DeviceNotFound(format!("{vid:04x}:{pid:04x}")));
        }
    }

    match candidates.len() {
        0 => Err(Error::NoDevice),
        1 => Ok(candidates.remove(0)),
        count => {
            // Prompting requires a terminal; scripts have to disambiguate
            // with `--device` instead.
            if !stdin().is_terminal() {
                return Err(Error::AmbiguousDevice(count));
            }

            println!("Detected {count} DFU devices. Select which to use:\n");

            let items = candidates
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();

            let index = Select::with_theme(&ColorfulTheme::default())
                .items(&items)
                .default(0)
                .interact_opt()?
                .ok_or(Error::Cancelled)?;

            Ok(candidates.swap_remove(index))
        }
    }
}

/// Connect to the selected device and print what it reports about itself.
pub fn device_info(args: ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args, config, false)?;
    let info = flasher.device_info()?;
    print_device_info(&info, flasher.profile().name());

    Ok(())
}

fn print_device_info(info: &DeviceInfo, profile: &str) {
    println!("Device:        {}", info.device);
    println!("Mode:          {}", info.mode);
    println!("State:         {}", info.state);
    println!("Status:        {}", info.status);
    println!("Profile:       {profile}");

    if let Some(descriptor) = info.descriptor {
        let mut capabilities = Vec::new();
        if descriptor.can_download() {
            capabilities.push("download");
        }
        if descriptor.can_upload() {
            capabilities.push("upload");
        }
        if descriptor.manifestation_tolerant() {
            capabilities.push("manifestation-tolerant");
        }
        if descriptor.will_detach() {
            capabilities.push("will-detach");
        }

        println!("Capabilities:  {}", capabilities.join(", "));
        println!("Transfer size: {}B", descriptor.transfer_size);
        println!(
            "DFU version:   {:x}.{:02x}",
            descriptor.dfu_version >> 8,
            descriptor.dfu_version & 0xff
        );
    }
}

/// Ask the selected device to detach into its DFU bootloader.
pub fn detach(args: ConnectArgs) -> Result<()> {
    let mut transport = UsbTransport::new();
    let devices = transport.enumerate().map_err(Error::from)?;
    let device = select_device(devices, &args)?;

    Flasher::detach_only(Box::new(transport), &device)?;

    Ok(())
}

/// Print a table of DFU-capable devices currently on the bus.
pub fn print_device_list() -> Result<()> {
    let mut transport = UsbTransport::new();
    let devices = transport.enumerate().map_err(Error::from)?;

    if devices.is_empty() {
        println!("No DFU-capable devices found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Identity")
                .fg(Color::Green)
                .add_attribute(Attribute::Bold),
            Cell::new("Bus")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("Address")
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new("Product")
                .fg(Color::Magenta)
                .add_attribute(Attribute::Bold),
            Cell::new("Serial")
                .fg(Color::Yellow)
                .add_attribute(Attribute::Bold),
        ]);
    for device in &devices {
        table.add_row(vec![
            Cell::new(format!("{:04x}:{:04x}", device.vendor_id, device.product_id))
                .fg(Color::Green),
            Cell::new(device.bus).fg(Color::Cyan),
            Cell::new(device.address).fg(Color::Cyan),
            Cell::new(device.product.clone().unwrap_or_default()).fg(Color::Magenta),
            Cell::new(device.serial.clone().unwrap_or_default()).fg(Color::Yellow),
        ]);
    }
    println!("{table}");

    Ok(())
}

/// Cancel the returned token on Ctrl-C, so an interrupted flash stops at the
/// next block boundary instead of killing the process mid-transfer.
pub fn cancel_on_ctrlc() -> Result<CancelToken> {
    let token = CancelToken::new();
    let handle = token.clone();
    ctrlc::set_handler(move || handle.cancel()).into_diagnostic()?;

    Ok(token)
}

/// Progress bar for firmware downloads
#[derive(Default)]
pub struct FlashProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for FlashProgress {
    fn init(&mut self, total: usize) {
        let pb = ProgressBar::new(total as u64).with_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );
        self.pb = Some(pb);
    }

    fn update(&mut self, current: usize) {
        if let Some(pb) = &self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = &self.pb {
            pb.finish();
        }
    }
}
