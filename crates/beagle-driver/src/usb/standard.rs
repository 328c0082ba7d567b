//! Standard command layer.
//!
//! A thin session wrapper holding one device and a default timeout. The
//! protocol layers (DFU, ML) hold a clone of this rather than re-deriving
//! timeouts per call; underlying transfer errors propagate unchanged.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{BeagleError, Result};
use crate::usb::descriptor::{descriptor_type, ConfigurationDescriptor, DeviceDescriptor};
use crate::usb::device::UsbDeviceInterface;
use crate::usb::transfer::{InTransferCallback, SetupPacket, TransferBuffer};

const CONFIGURATION_HEADER_LEN: usize = 9;

/// Device session with a default timeout substituted on every operation.
#[derive(Debug, Clone)]
pub struct StandardCommands {
    device: Arc<dyn UsbDeviceInterface>,
    default_timeout: Duration,
}

impl StandardCommands {
    /// Wrap a device with a default timeout.
    #[must_use]
    pub fn new(device: Arc<dyn UsbDeviceInterface>, default_timeout: Duration) -> Self {
        Self {
            device,
            default_timeout,
        }
    }

    /// The wrapped device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn UsbDeviceInterface> {
        &self.device
    }

    /// Default timeout applied to every operation.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Select a device configuration.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn set_configuration(&self, configuration: u8) -> Result<()> {
        self.device.set_configuration(configuration)
    }

    /// Claim an interface.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn claim_interface(&self, interface: u8) -> Result<()> {
        self.device.claim_interface(interface)
    }

    /// Release an interface.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn release_interface(&self, interface: u8) -> Result<()> {
        self.device.release_interface(interface)
    }

    /// Control command with no data stage.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn send_control_command(&self, setup: &SetupPacket) -> Result<()> {
        self.device.send_control_command(setup, self.default_timeout)
    }

    /// Control command with a host-to-device data stage.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn send_control_command_with_data_out(
        &self,
        setup: &SetupPacket,
        data: &[u8],
    ) -> Result<()> {
        self.device
            .send_control_command_with_data_out(setup, data, self.default_timeout)
    }

    /// Control command with a device-to-host data stage.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn send_control_command_with_data_in(
        &self,
        setup: &SetupPacket,
        buffer: &mut [u8],
    ) -> Result<usize> {
        self.device
            .send_control_command_with_data_in(setup, buffer, self.default_timeout)
    }

    /// Synchronous bulk-out of the whole of `data`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error, including short writes.
    pub fn bulk_out_transfer(&self, endpoint: u8, data: &[u8]) -> Result<()> {
        self.device
            .bulk_out_transfer(endpoint, data, self.default_timeout)
    }

    /// Synchronous bulk-in; returns the actual byte count.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn bulk_in_transfer(&self, endpoint: u8, buffer: &mut [u8]) -> Result<usize> {
        self.device
            .bulk_in_transfer(endpoint, buffer, self.default_timeout)
    }

    /// Synchronous interrupt-in; returns the actual byte count.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transfer error.
    pub fn interrupt_in_transfer(&self, endpoint: u8, buffer: &mut [u8]) -> Result<usize> {
        self.device
            .interrupt_in_transfer(endpoint, buffer, self.default_timeout)
    }

    /// Async bulk-in with the default timeout.
    ///
    /// # Errors
    ///
    /// Propagates the underlying submission error.
    pub fn async_bulk_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        callback: InTransferCallback,
    ) -> Result<()> {
        self.device
            .async_bulk_in_transfer(endpoint, buffer, self.default_timeout, callback)
    }

    /// Async interrupt-in with the default timeout.
    ///
    /// # Errors
    ///
    /// Propagates the underlying submission error.
    pub fn async_interrupt_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        callback: InTransferCallback,
    ) -> Result<()> {
        self.device
            .async_interrupt_in_transfer(endpoint, buffer, self.default_timeout, callback)
    }

    /// Fetch and parse the device descriptor.
    ///
    /// # Errors
    ///
    /// Propagates transfer errors; malformed descriptor bytes yield
    /// [`MalformedDescriptor`](BeagleError::MalformedDescriptor).
    pub fn get_device_descriptor(&self) -> Result<DeviceDescriptor> {
        let mut raw = [0u8; 18];
        let received = self.device.get_descriptor(
            descriptor_type::DEVICE,
            0,
            &mut raw,
            self.default_timeout,
        )?;
        DeviceDescriptor::parse(&raw[..received])
    }

    /// Fetch and parse configuration descriptor `index`, reading at most
    /// `max_extra_bytes` beyond the 9-byte header.
    ///
    /// # Errors
    ///
    /// Propagates transfer errors; malformed descriptor bytes yield
    /// [`MalformedDescriptor`](BeagleError::MalformedDescriptor).
    pub fn get_configuration_descriptor(
        &self,
        index: u8,
        max_extra_bytes: usize,
    ) -> Result<ConfigurationDescriptor> {
        // First read just the header to learn wTotalLength.
        let mut header = [0u8; CONFIGURATION_HEADER_LEN];
        let received = self.device.get_descriptor(
            descriptor_type::CONFIGURATION,
            index,
            &mut header,
            self.default_timeout,
        )?;
        if received < CONFIGURATION_HEADER_LEN {
            return Err(BeagleError::malformed_descriptor(format!(
                "configuration header: {received} bytes"
            )));
        }
        let total_length = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let want = total_length.min(CONFIGURATION_HEADER_LEN + max_extra_bytes);

        let mut raw = vec![0u8; want];
        let received = self.device.get_descriptor(
            descriptor_type::CONFIGURATION,
            index,
            &mut raw,
            self.default_timeout,
        )?;
        ConfigurationDescriptor::parse(&raw[..received])
    }
}
