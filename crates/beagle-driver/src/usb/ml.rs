//! ML command layer.
//!
//! Maps chip register access and data streaming onto USB transfers:
//! CSR reads/writes become vendor control transfers with the offset split
//! across the setup packet's wValue/wIndex, data streams go over the
//! vendor-specific bulk endpoints, and event notifications arrive on the
//! interrupt endpoint.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{BeagleError, Result};
use crate::options::{DriverOptions, OperatingMode};
use crate::registers::Registers;
use crate::usb::standard::StandardCommands;
use crate::usb::transfer::SetupPacket;

/// Vendor-specific endpoint addresses.
pub mod endpoint {
    /// Instruction stream, host to device.
    pub const INSTRUCTIONS_OUT: u8 = 0x01;
    /// Input activation stream, host to device.
    pub const INPUT_ACTIVATIONS_OUT: u8 = 0x02;
    /// Parameter stream, host to device.
    pub const PARAMETERS_OUT: u8 = 0x03;
    /// Output activation stream, device to host.
    pub const OUTPUT_IN: u8 = 0x81;
    /// Event notifications, device to host.
    pub const EVENT_IN: u8 = 0x82;
    /// Multiplexed out endpoint in single-endpoint mode.
    pub const SINGLE_BULK_OUT: u8 = 0x01;
    /// Multiplexed in endpoint in single-endpoint mode.
    pub const SINGLE_BULK_IN: u8 = 0x81;
}

/// Vendor control request for 64-bit CSR access.
const VENDOR_REQUEST_CSR64: u8 = 0x00;
/// Vendor control request for 32-bit CSR access.
const VENDOR_REQUEST_CSR32: u8 = 0x01;

const VENDOR_OUT: u8 = 0x40;
const VENDOR_IN: u8 = 0xC0;

/// Wire size of an event notification packet.
const EVENT_PACKET_LEN: usize = 16;

/// Size of the software hint header prepended to tagged streams.
const HINT_HEADER_LEN: usize = 8;

/// Which data stream a bulk-out payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamTag {
    /// Executable instruction stream.
    Instructions = 0,
    /// Input activations.
    InputActivations = 1,
    /// Layer parameters.
    Parameters = 2,
}

impl StreamTag {
    const fn dedicated_endpoint(self) -> u8 {
        match self {
            Self::Instructions => endpoint::INSTRUCTIONS_OUT,
            Self::InputActivations => endpoint::INPUT_ACTIVATIONS_OUT,
            Self::Parameters => endpoint::PARAMETERS_OUT,
        }
    }
}

/// Event notification read from the interrupt endpoint.
#[derive(Debug, Clone, Copy)]
pub struct EventNotification {
    /// Bitmask of pending interrupt sources.
    pub pending_sources: u32,
}

/// Split a CSR offset across wValue (low 16 bits) and wIndex (high 16 bits).
#[must_use]
pub const fn split_offset(offset: u32) -> (u16, u16) {
    ((offset & 0xFFFF) as u16, (offset >> 16) as u16)
}

/// Register access and data streaming over USB for one device.
#[derive(Debug)]
pub struct MlCommands {
    commands: StandardCommands,
    options: DriverOptions,
    // Serializes bulk traffic unless overlap was opted into.
    io_lock: Mutex<()>,
}

impl MlCommands {
    /// Create the ML command layer over a standard command layer.
    #[must_use]
    pub fn new(commands: StandardCommands, options: DriverOptions) -> Self {
        Self {
            commands,
            options,
            io_lock: Mutex::new(()),
        }
    }

    fn checked_offset(offset: u64) -> Result<u32> {
        u32::try_from(offset).map_err(|_| {
            BeagleError::invalid_state(format!("CSR offset {offset:#x} exceeds the 32-bit window"))
        })
    }

    fn bulk_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if self.options.enable_overlapping_bulk_in_and_out {
            None
        } else {
            Some(self.io_lock.lock().expect("ML io lock poisoned"))
        }
    }

    /// Read a 32-bit CSR.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails or returns short.
    pub fn read_csr32(&self, offset: u64) -> Result<u32> {
        let (value, index) = split_offset(Self::checked_offset(offset)?);
        let mut data = [0u8; 4];
        let received = self.commands.send_control_command_with_data_in(
            &SetupPacket {
                request_type: VENDOR_IN,
                request: VENDOR_REQUEST_CSR32,
                value,
                index,
                length: 4,
            },
            &mut data,
        )?;
        if received != 4 {
            return Err(BeagleError::transfer_failed(format!(
                "CSR read at {offset:#x}: {received} of 4 bytes"
            )));
        }
        Ok(u32::from_le_bytes(data))
    }

    /// Write a 32-bit CSR.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    pub fn write_csr32(&self, offset: u64, value_bits: u32) -> Result<()> {
        let (value, index) = split_offset(Self::checked_offset(offset)?);
        self.commands.send_control_command_with_data_out(
            &SetupPacket {
                request_type: VENDOR_OUT,
                request: VENDOR_REQUEST_CSR32,
                value,
                index,
                length: 4,
            },
            &value_bits.to_le_bytes(),
        )
    }

    /// Read a 64-bit CSR.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails or returns short.
    pub fn read_csr64(&self, offset: u64) -> Result<u64> {
        let (value, index) = split_offset(Self::checked_offset(offset)?);
        let mut data = [0u8; 8];
        let received = self.commands.send_control_command_with_data_in(
            &SetupPacket {
                request_type: VENDOR_IN,
                request: VENDOR_REQUEST_CSR64,
                value,
                index,
                length: 8,
            },
            &mut data,
        )?;
        if received != 8 {
            return Err(BeagleError::transfer_failed(format!(
                "CSR read at {offset:#x}: {received} of 8 bytes"
            )));
        }
        Ok(u64::from_le_bytes(data))
    }

    /// Write a 64-bit CSR.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    pub fn write_csr64(&self, offset: u64, value_bits: u64) -> Result<()> {
        let (value, index) = split_offset(Self::checked_offset(offset)?);
        self.commands.send_control_command_with_data_out(
            &SetupPacket {
                request_type: VENDOR_OUT,
                request: VENDOR_REQUEST_CSR64,
                value,
                index,
                length: 8,
            },
            &value_bits.to_le_bytes(),
        )
    }

    /// Send one tagged data stream, chunked to the configured bulk-out size.
    ///
    /// Routing depends on the operating mode: dedicated endpoints under
    /// hardware control, dedicated endpoints plus software hints under
    /// software query, or the multiplexed endpoint plus hints in
    /// single-endpoint mode.
    ///
    /// # Errors
    ///
    /// Returns an error if any chunk transfer fails; a short write surfaces
    /// as [`ShortWrite`](BeagleError::ShortWrite).
    pub fn send_stream(&self, tag: StreamTag, data: &[u8]) -> Result<()> {
        let _guard = self.bulk_guard();
        let endpoint = match self.options.mode {
            OperatingMode::SingleEndpoint => endpoint::SINGLE_BULK_OUT,
            _ => tag.dedicated_endpoint(),
        };

        for chunk in data.chunks(self.options.max_bulk_out_chunk_size.max(1)) {
            if self.options.mode.uses_software_hints() {
                let mut hinted = Vec::with_capacity(HINT_HEADER_LEN + chunk.len());
                hinted.push(tag as u8);
                hinted.extend_from_slice(&[0u8; 3]);
                hinted.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
                hinted.extend_from_slice(chunk);
                self.commands.bulk_out_transfer(endpoint, &hinted)?;
            } else {
                self.commands.bulk_out_transfer(endpoint, chunk)?;
            }
        }
        tracing::trace!("Sent {} byte {tag:?} stream", data.len());
        Ok(())
    }

    /// Read output activations; returns the actual byte count.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails.
    pub fn read_output(&self, buffer: &mut [u8]) -> Result<usize> {
        let _guard = self.bulk_guard();
        let endpoint = match self.options.mode {
            OperatingMode::SingleEndpoint => endpoint::SINGLE_BULK_IN,
            _ => endpoint::OUTPUT_IN,
        };
        self.commands.bulk_in_transfer(endpoint, buffer)
    }

    /// Read one event notification from the interrupt endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails or the packet is truncated.
    pub fn read_event(&self) -> Result<EventNotification> {
        let mut packet = [0u8; EVENT_PACKET_LEN];
        let received = self
            .commands
            .interrupt_in_transfer(endpoint::EVENT_IN, &mut packet)?;
        if received < 4 {
            return Err(BeagleError::transfer_failed(format!(
                "event packet: {received} bytes"
            )));
        }
        Ok(EventNotification {
            pending_sources: u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]),
        })
    }

    /// Queue capacity configured for completed bulk-in data.
    #[must_use]
    pub fn bulk_in_queue_capacity(&self) -> usize {
        self.options.bulk_in_queue_capacity
    }
}

/// [`Registers`] adapter over the ML command layer: CSR access for the
/// interrupt and reset managers, tunnelled through vendor control transfers.
#[derive(Debug)]
pub struct UsbRegisters {
    ml: Arc<MlCommands>,
}

impl UsbRegisters {
    /// Adapt an ML command layer to the register interface.
    #[must_use]
    pub fn new(ml: Arc<MlCommands>) -> Self {
        Self { ml }
    }
}

impl Registers for UsbRegisters {
    fn read(&self, offset: u64) -> Result<u64> {
        self.ml.read_csr64(offset)
    }

    fn write(&self, offset: u64, value: u64) -> Result<()> {
        self.ml.write_csr64(offset, value)
    }

    fn read32(&self, offset: u64) -> Result<u32> {
        self.ml.read_csr32(offset)
    }

    fn write32(&self, offset: u64, value: u32) -> Result<()> {
        self.ml.write_csr32(offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_offset_matches_wire_layout() {
        let (value, index) = split_offset(0x0004_C058);
        assert_eq!(value, 0xC058);
        assert_eq!(index, 0x0004);
    }

    #[test]
    fn stream_tags_map_to_dedicated_endpoints() {
        assert_eq!(
            StreamTag::Instructions.dedicated_endpoint(),
            endpoint::INSTRUCTIONS_OUT
        );
        assert_eq!(
            StreamTag::Parameters.dedicated_endpoint(),
            endpoint::PARAMETERS_OUT
        );
    }
}
