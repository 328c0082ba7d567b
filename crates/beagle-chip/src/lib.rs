//! Hardware constants for the Beagle ML accelerator.
//!
//! This crate holds everything that is a property of the silicon rather than
//! of the driver: USB identity (vendor/product IDs, operating mode), the CSR
//! offsets the driver touches, and the per-variant chip configuration table.
//!
//! The full Beagle CSR map runs to hundreds of named registers; only the
//! registers the transport, interrupt, and reset paths actually drive are
//! carried here.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod csr;
pub mod usb_ids;

pub use config::{Accessor, ChipConfig, ConfigError};
pub use csr::{InterruptCsrOffsets, CSR_OFFSET_INVALID};
pub use usb_ids::{ChipVariant, DeviceMode};
