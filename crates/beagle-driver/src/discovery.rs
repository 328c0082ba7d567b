//! Runtime device discovery.
//!
//! Scans the USB bus for Beagle vendor/product IDs and reports what was
//! found, including whether each module is running firmware or sitting in
//! the DFU bootloader. No hardcoded device lists beyond the ID table in
//! `beagle-chip`.

use rusb::UsbContext;

use beagle_chip::usb_ids::{self, ChipVariant, DeviceMode};

use crate::error::{BeagleError, Result};
use crate::options::DriverOptions;
use crate::usb::rusb_device::RusbDevice;

/// Device manager for runtime discovery and access.
pub struct DeviceManager {
    devices: Vec<(DeviceInfo, rusb::Device<rusb::Context>)>,
    options: DriverOptions,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("devices", &self.devices.iter().map(|(info, _)| info).collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

/// Information about a discovered device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device index (0, 1, 2, ...) in bus/address order.
    pub index: usize,
    /// USB bus number.
    pub bus_number: u8,
    /// Address on the bus.
    pub address: u8,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Product ID.
    pub product_id: u16,
    /// Chip variant.
    pub variant: ChipVariant,
    /// Application or DFU personality.
    pub mode: DeviceMode,
}

impl DeviceManager {
    /// Discover all Beagle devices, with options read from the environment
    /// once.
    ///
    /// # Errors
    ///
    /// Returns [`NoDevicesFound`](BeagleError::NoDevicesFound) if nothing on
    /// the bus matches, or a USB stack error.
    pub fn enumerate() -> Result<Self> {
        Self::enumerate_with(DriverOptions::from_env())
    }

    /// Discover all Beagle devices with explicit options.
    ///
    /// # Errors
    ///
    /// Returns [`NoDevicesFound`](BeagleError::NoDevicesFound) if nothing on
    /// the bus matches, or a USB stack error.
    pub fn enumerate_with(options: DriverOptions) -> Result<Self> {
        tracing::info!("Discovering Beagle devices...");
        let context = rusb::Context::new()?;

        let mut devices = Vec::new();
        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    tracing::debug!("Skipping unreadable device: {err}");
                    continue;
                }
            };

            let vendor_id = descriptor.vendor_id();
            let product_id = descriptor.product_id();
            let Some(mode) = usb_ids::identify(vendor_id, product_id) else {
                continue;
            };

            let info = DeviceInfo {
                index: devices.len(),
                bus_number: device.bus_number(),
                address: device.address(),
                vendor_id,
                product_id,
                variant: ChipVariant::from_product_id(product_id),
                mode,
            };
            tracing::info!(
                "Device {}: {:?} in {:?} mode at bus {} addr {}",
                info.index,
                info.variant,
                info.mode,
                info.bus_number,
                info.address
            );
            devices.push((info, device));
        }

        if devices.is_empty() {
            tracing::error!("No Beagle devices found");
            return Err(BeagleError::NoDevicesFound);
        }

        tracing::info!("Discovered {} Beagle device(s)", devices.len());
        Ok(Self { devices, options })
    }

    /// Number of discovered devices.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// All discovered devices.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter().map(|(info, _)| info)
    }

    /// Device info by index.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidIndex`](BeagleError::InvalidIndex) if out of bounds.
    pub fn device(&self, index: usize) -> Result<&DeviceInfo> {
        self.devices
            .get(index)
            .map(|(info, _)| info)
            .ok_or(BeagleError::InvalidIndex {
                index,
                count: self.devices.len(),
            })
    }

    /// Open a device by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is invalid or the device cannot be
    /// opened (permissions, detach race).
    pub fn open(&self, index: usize) -> Result<RusbDevice> {
        let (info, device) = self.devices.get(index).ok_or(BeagleError::InvalidIndex {
            index,
            count: self.devices.len(),
        })?;
        tracing::debug!("Opening device {} at bus {} addr {}", info.index, info.bus_number, info.address);
        let handle = device.open()?;
        RusbDevice::new(handle, &self.options)
    }

    /// Open the first discovered device.
    ///
    /// # Errors
    ///
    /// Returns an error if no devices are available or the open fails.
    pub fn open_first(&self) -> Result<RusbDevice> {
        if self.devices.is_empty() {
            return Err(BeagleError::NoDevicesFound);
        }
        self.open(0)
    }
}
