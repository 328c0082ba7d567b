//! `beagle` — command-line interface for Beagle ML accelerator hardware.
//!
//! ```text
//! USAGE:
//!   beagle enumerate                     List all devices
//!   beagle info <index>                  Descriptors for one device
//!   beagle flash <index> <image.bin>     Flash firmware over DFU
//!   beagle read-csr <index> <offset>     Read a 64-bit CSR
//!   beagle write-csr <index> <offset> <value>
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beagle_driver::{
    find_dfu_interfaces, DeviceManager, DfuCommands, DriverOptions, MlCommands, StandardCommands,
    UsbDeviceInterface,
};

#[derive(Parser)]
#[command(name = "beagle", about = "Beagle ML accelerator CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all Beagle devices on the bus.
    Enumerate,
    /// Print descriptors and mode for one device.
    Info {
        /// Device index from `enumerate`.
        index: usize,
    },
    /// Flash a firmware image over DFU (device must be in DFU mode).
    Flash {
        /// Device index from `enumerate`.
        index: usize,
        /// Firmware image file.
        image: std::path::PathBuf,
        /// Read the image back and verify after flashing.
        #[arg(long)]
        verify: bool,
    },
    /// Read a 64-bit CSR.
    ReadCsr {
        /// Device index from `enumerate`.
        index: usize,
        /// Register offset (hex accepted with 0x prefix).
        offset: String,
    },
    /// Write a 64-bit CSR.
    WriteCsr {
        /// Device index from `enumerate`.
        index: usize,
        /// Register offset (hex accepted with 0x prefix).
        offset: String,
        /// Value (hex accepted with 0x prefix).
        value: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Info { index } => cmd_info(index)?,
        Cmd::Flash {
            index,
            image,
            verify,
        } => cmd_flash(index, &image, verify)?,
        Cmd::ReadCsr { index, offset } => cmd_read_csr(index, &offset)?,
        Cmd::WriteCsr {
            index,
            offset,
            value,
        } => cmd_write_csr(index, &offset, &value)?,
    }

    Ok(())
}

fn parse_u64(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        trimmed.parse()
    };
    parsed.with_context(|| format!("invalid number: {raw}"))
}

fn cmd_enumerate() -> Result<()> {
    let manager = DeviceManager::enumerate()?;

    println!("Beagle devices: {}", manager.device_count());
    println!();
    for info in manager.devices() {
        println!(
            "[{}] {:?} in {:?} mode  ({:04x}:{:04x})  bus {} addr {}",
            info.index,
            info.variant,
            info.mode,
            info.vendor_id,
            info.product_id,
            info.bus_number,
            info.address
        );
    }
    Ok(())
}

fn cmd_info(index: usize) -> Result<()> {
    let manager = DeviceManager::enumerate()?;
    let info = manager.device(index)?.clone();
    let device = Arc::new(manager.open(index)?) as Arc<dyn UsbDeviceInterface>;
    let commands = StandardCommands::new(device, DriverOptions::from_env().default_timeout);

    let descriptor = commands.get_device_descriptor()?;
    println!("Device       : [{}] bus {} addr {}", info.index, info.bus_number, info.address);
    println!("Mode         : {:?}", info.mode);
    println!("USB version  : {:x}.{:02x}", descriptor.usb_version >> 8, descriptor.usb_version & 0xFF);
    println!("IDs          : {:04x}:{:04x}", descriptor.vendor_id, descriptor.product_id);
    println!("Firmware rev : {:#06x}", descriptor.device_version);

    let config = commands.get_configuration_descriptor(0, 4096)?;
    println!("Interfaces   : {}", config.num_interfaces);
    for interface in &config.interfaces {
        println!(
            "  #{} class {:#04x}/{:#04x} proto {:#04x}, {} endpoint(s)",
            interface.interface_number,
            interface.class,
            interface.sub_class,
            interface.protocol,
            interface.num_endpoints
        );
    }
    if let Ok(dfu) = find_dfu_interfaces(&config) {
        for found in dfu {
            let f = found.functional;
            println!(
                "  DFU on #{}: transfer {} B, detach {} ms, dnload={} upload={}",
                found.interface_number,
                f.transfer_size,
                f.detach_timeout_ms,
                f.can_download(),
                f.can_upload()
            );
        }
    }
    Ok(())
}

fn cmd_flash(index: usize, image_path: &std::path::Path, verify: bool) -> Result<()> {
    let image = Bytes::from(std::fs::read(image_path).with_context(|| {
        format!("reading firmware image {}", image_path.display())
    })?);

    let manager = DeviceManager::enumerate()?;
    let info = manager.device(index)?.clone();
    let device = Arc::new(manager.open(index)?) as Arc<dyn UsbDeviceInterface>;
    let commands = StandardCommands::new(device, DriverOptions::from_env().default_timeout);

    let config = commands.get_configuration_descriptor(0, 4096)?;
    let interfaces = find_dfu_interfaces(&config)?;
    let target = interfaces[0];

    if info.mode == beagle_chip::DeviceMode::Application {
        // Running firmware: ask the device to drop to the bootloader, then
        // the operator re-runs flash against the re-enumerated device.
        commands.claim_interface(target.interface_number)?;
        let dfu = DfuCommands::new(commands);
        dfu.set_dfu_interface(target.interface_number);
        dfu.dfu_detach(target.functional.detach_timeout_ms)?;
        println!("Detach requested; re-run `beagle flash` once the device re-enumerates in DFU mode.");
        return Ok(());
    }

    commands.set_configuration(config.configuration_value)?;
    commands.claim_interface(target.interface_number)?;
    let dfu = DfuCommands::new(commands);
    dfu.set_dfu_interface(target.interface_number);

    println!(
        "Flashing {} ({} bytes, {} byte blocks)...",
        image_path.display(),
        image.len(),
        target.functional.transfer_size
    );
    dfu.update_firmware(&target.functional, &image)?;
    println!("Download complete.");

    if verify {
        if target.functional.can_upload() {
            dfu.validate_firmware(&target.functional, &image)?;
            println!("Read-back verification passed.");
        } else {
            println!("Device does not support upload; skipping verification.");
        }
    }
    println!("Reset the device (or re-plug) to boot the new firmware.");
    Ok(())
}

fn open_ml(manager: &DeviceManager, index: usize) -> Result<MlCommands> {
    let options = DriverOptions::from_env();
    let device = Arc::new(manager.open(index)?) as Arc<dyn UsbDeviceInterface>;
    let commands = StandardCommands::new(device, options.default_timeout);
    Ok(MlCommands::new(commands, options))
}

fn cmd_read_csr(index: usize, offset: &str) -> Result<()> {
    let offset = parse_u64(offset)?;
    let manager = DeviceManager::enumerate()?;
    let ml = open_ml(&manager, index)?;
    let value = ml.read_csr64(offset)?;
    println!("{offset:#010x} = {value:#018x}");
    Ok(())
}

fn cmd_write_csr(index: usize, offset: &str, value: &str) -> Result<()> {
    let offset = parse_u64(offset)?;
    let value = parse_u64(value)?;
    let manager = DeviceManager::enumerate()?;
    let ml = open_ml(&manager, index)?;
    ml.write_csr64(offset, value)?;
    println!("{offset:#010x} <= {value:#018x}");
    Ok(())
}
