//! USB device interface — the transfer primitive layer.
//!
//! One implementation instance exclusively owns one open device handle.
//! [`RusbDevice`](crate::usb::rusb_device::RusbDevice) drives physical
//! hardware; [`FakeUsbDevice`](crate::usb::fake::FakeUsbDevice) is the
//! emulated device used by the tests.

use std::time::Duration;

use crate::error::Result;
use crate::usb::transfer::{
    InTransferCallback, OutTransferCallback, SetupPacket, TransferBuffer,
};

/// Synchronous and asynchronous transfer operations on one open USB device.
///
/// Semantics common to all implementations:
///
/// - Bulk-out short transfer is an error ([`ShortWrite`]); bulk-in and
///   interrupt-in short transfers are not — the actual count is returned.
/// - Async callbacks fire exactly once, from an implementation-chosen
///   thread, for every submitted transfer — including cancelled ones.
/// - [`try_cancel_all_transfers`] is best-effort and asynchronous with
///   respect to completion; callers needing quiescence close the device or
///   otherwise wait for outstanding callbacks.
/// - [`close`] is idempotent and returns only after all in-flight transfers
///   have completed or been positively cancelled.
///
/// [`ShortWrite`]: crate::error::BeagleError::ShortWrite
/// [`try_cancel_all_transfers`]: UsbDeviceInterface::try_cancel_all_transfers
/// [`close`]: UsbDeviceInterface::close
pub trait UsbDeviceInterface: Send + Sync + std::fmt::Debug {
    /// Select a device configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed or the transfer fails.
    fn set_configuration(&self, configuration: u8) -> Result<()>;

    /// Claim an interface for exclusive use by this handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed or the claim fails.
    fn claim_interface(&self, interface: u8) -> Result<()>;

    /// Release a previously claimed interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed or the release fails.
    fn release_interface(&self, interface: u8) -> Result<()>;

    /// Fetch a descriptor by type and index into `buffer`; returns the byte
    /// count the device produced.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    fn get_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Issue a control command with no data stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    fn send_control_command(&self, setup: &SetupPacket, timeout: Duration) -> Result<()>;

    /// Issue a control command with a host-to-device data stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails or sends short.
    fn send_control_command_with_data_out(
        &self,
        setup: &SetupPacket,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()>;

    /// Issue a control command with a device-to-host data stage; returns the
    /// byte count received.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    fn send_control_command_with_data_in(
        &self,
        setup: &SetupPacket,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Synchronous bulk-out transfer of the whole of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`ShortWrite`](crate::error::BeagleError::ShortWrite) if fewer
    /// bytes than requested were sent, or a transport error.
    fn bulk_out_transfer(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<()>;

    /// Synchronous bulk-in transfer; returns the byte count received, which
    /// may be less than the buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails.
    fn bulk_in_transfer(&self, endpoint: u8, buffer: &mut [u8], timeout: Duration)
        -> Result<usize>;

    /// Synchronous interrupt-in transfer; short reads are not errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails.
    fn interrupt_in_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Submit an async bulk-out transfer. The callback receives the final
    /// status and the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed or async slots are exhausted;
    /// in that case the callback is never invoked.
    fn async_bulk_out_transfer(
        &self,
        endpoint: u8,
        data: TransferBuffer,
        timeout: Duration,
        callback: OutTransferCallback,
    ) -> Result<()>;

    /// Submit an async bulk-in transfer. The callback receives the status,
    /// the buffer, and the byte count.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed or async slots are exhausted.
    fn async_bulk_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
        callback: InTransferCallback,
    ) -> Result<()>;

    /// Submit an async interrupt-in transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed or async slots are exhausted.
    fn async_interrupt_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
        callback: InTransferCallback,
    ) -> Result<()>;

    /// Request cancellation of all outstanding async transfers. Best-effort:
    /// returns immediately; affected callbacks still fire later with a
    /// cancellation status.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed.
    fn try_cancel_all_transfers(&self) -> Result<()>;

    /// Allocate a transfer buffer of `len` bytes from the device's pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed or allocation fails.
    fn allocate_transfer_buffer(&self, len: usize) -> Result<TransferBuffer>;

    /// Return a buffer to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is closed.
    fn release_transfer_buffer(&self, buffer: TransferBuffer) -> Result<()>;

    /// Close the device. Idempotent; cancels and awaits all in-flight
    /// transfers before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if releasing device resources fails.
    fn close(&self) -> Result<()>;
}
