//! USB identity constants.
//!
//! A Beagle module enumerates twice over its lifetime: first as a DFU-class
//! bootloader device, then — once firmware is running — as the vendor-specific
//! ML accelerator. The two modes carry different vendor/product IDs.

/// Vendor ID the chip reports in application (runtime) mode.
pub const APP_VENDOR_ID: u16 = 0x18D1;

/// Vendor ID the boot ROM reports in DFU mode.
pub const DFU_VENDOR_ID: u16 = 0x1A6E;

/// Product IDs for the Beagle family.
pub mod product_id {
    /// Application mode, firmware running (`lsusb: 18d1:9302`).
    pub const BEAGLE_APP: u16 = 0x9302;
    /// DFU bootloader mode (`lsusb: 1a6e:089a`).
    pub const BEAGLE_DFU: u16 = 0x089A;
}

/// Which personality a device is currently presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Firmware is running; vendor-specific ML interface is available.
    Application,
    /// Boot ROM is running; only the DFU interface is available.
    Dfu,
}

/// Chip variant discovered at enumeration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipVariant {
    /// Beagle — single-context USB/PCIe ML accelerator.
    Beagle,
    /// Unknown / future variant.
    Unknown(u16),
}

impl ChipVariant {
    /// Identify variant from a USB product ID.
    #[must_use]
    pub const fn from_product_id(id: u16) -> Self {
        match id {
            product_id::BEAGLE_APP | product_id::BEAGLE_DFU => Self::Beagle,
            other => Self::Unknown(other),
        }
    }
}

/// Classify a `(vendor, product)` pair, or `None` if it is not a Beagle.
#[must_use]
pub const fn identify(vendor: u16, product: u16) -> Option<DeviceMode> {
    match (vendor, product) {
        (APP_VENDOR_ID, product_id::BEAGLE_APP) => Some(DeviceMode::Application),
        (DFU_VENDOR_ID, product_id::BEAGLE_DFU) => Some(DeviceMode::Dfu),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_both_modes() {
        assert_eq!(identify(0x18D1, 0x9302), Some(DeviceMode::Application));
        assert_eq!(identify(0x1A6E, 0x089A), Some(DeviceMode::Dfu));
        assert_eq!(identify(0x18D1, 0x089A), None);
    }

    #[test]
    fn variant_from_product_id() {
        assert_eq!(
            ChipVariant::from_product_id(product_id::BEAGLE_APP),
            ChipVariant::Beagle
        );
        assert!(matches!(
            ChipVariant::from_product_id(0xBEEF),
            ChipVariant::Unknown(0xBEEF)
        ));
    }
}
