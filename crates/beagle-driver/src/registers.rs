//! Register access interface.
//!
//! Offsets are absolute addresses within the chip's CSR region, sourced from
//! the [`beagle_chip::ChipConfig`] table. The USB transport implements this
//! trait via vendor control transfers ([`crate::usb::ml::UsbRegisters`]); a
//! PCIe transport would implement it over BAR MMIO.

use crate::error::Result;

/// Read/write access to chip CSRs.
pub trait Registers: Send + Sync + std::fmt::Debug {
    /// Read a 64-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport fails.
    fn read(&self, offset: u64) -> Result<u64>;

    /// Write a 64-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport fails.
    fn write(&self, offset: u64, value: u64) -> Result<()>;

    /// Read a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport fails.
    fn read32(&self, offset: u64) -> Result<u32>;

    /// Write a 32-bit register.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport fails.
    fn write32(&self, offset: u64, value: u32) -> Result<()>;
}
