//! Pure Rust USB driver for the Beagle ML accelerator.
//!
//! No vendor runtime, no C shim: device discovery, register access, data
//! streaming, firmware update over DFU, and chip reset/interrupt control,
//! all over libusb.
//!
//! # Stack
//!
//! ```text
//! application
//!   ├── MlCommands ──────── register access + data streams
//!   ├── DfuCommands ─────── firmware update (DFU 1.1)
//!   │     └── StandardCommands ── default timeouts, descriptors
//!   │           └── UsbDeviceInterface ── sync/async transfer primitives
//!   │                 ├── RusbDevice (hardware, via libusb)
//!   │                 └── FakeUsbDevice (emulated, for tests)
//!   └── BeagleTopLevelHandler / InterruptManager ── CSR sequencing
//!         └── Registers ── UsbRegisters adapter over MlCommands
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use beagle_driver::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> beagle_driver::Result<()> {
//! let manager = DeviceManager::enumerate()?;
//! let device = Arc::new(manager.open_first()?);
//!
//! let options = DriverOptions::from_env();
//! let commands = StandardCommands::new(device, options.default_timeout);
//! let ml = Arc::new(MlCommands::new(commands, options));
//! let chip_id = ml.read_csr32(0x0000)?;
//! println!("chip id {chip_id:#010x}");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

mod discovery;
mod error;
pub mod interrupt;
mod options;
pub mod registers;
pub mod top_level;
pub mod usb;

pub use discovery::{DeviceInfo, DeviceManager};
pub use error::{BeagleError, Result};
pub use interrupt::{
    GroupedInterruptController, InterruptController, InterruptControllerInterface,
};
pub use options::{DriverOptions, OperatingMode};
pub use registers::Registers;
pub use top_level::{
    BeagleTopLevelHandler, BeagleTopLevelInterruptManager, Performance, ResetState,
    TopLevelInterrupt,
};
pub use usb::descriptor::{ConfigurationDescriptor, DeviceDescriptor, InterfaceDescriptor};
pub use usb::device::UsbDeviceInterface;
pub use usb::dfu::{
    find_dfu_interfaces, DfuCommands, DfuFunctionalDescriptor, DfuInterfaceInfo, DfuState,
    DfuStatus, DfuStatusCode,
};
pub use usb::fake::FakeUsbDevice;
pub use usb::ml::{EventNotification, MlCommands, StreamTag, UsbRegisters};
pub use usb::rusb_device::RusbDevice;
pub use usb::standard::StandardCommands;
pub use usb::transfer::{SetupPacket, TransferBuffer, TransferStatus};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BeagleError, BeagleTopLevelHandler, BeagleTopLevelInterruptManager, DeviceInfo,
        DeviceManager, DfuCommands, DriverOptions, MlCommands, Performance, Registers, Result,
        RusbDevice, StandardCommands, StreamTag, UsbDeviceInterface, UsbRegisters,
    };
}
