//! USB Device Firmware Update (DFU 1.1) protocol.
//!
//! Drives the class-standard DFU handshake to push a firmware image into the
//! Beagle boot ROM: detach, block download, status polling, manifestation,
//! and optional read-back verification.
//!
//! The device-side state machine is authoritative. Every transition here is
//! observed by polling `GETSTATUS`/`GETSTATE`; the driver never assumes a
//! state it has not read back. The local copy is advisory only.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{BeagleError, Result};
use crate::usb::descriptor::ConfigurationDescriptor;
use crate::usb::standard::StandardCommands;
use crate::usb::transfer::SetupPacket;

/// DFU class / subclass codes carried by the DFU interface descriptor.
pub const DFU_CLASS: u8 = 0xFE;
/// DFU subclass.
pub const DFU_SUBCLASS: u8 = 0x01;
/// Descriptor type of the DFU functional descriptor.
pub const DFU_FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;

/// DFU class request codes.
pub mod request {
    /// Leave application mode for the bootloader.
    pub const DETACH: u8 = 0;
    /// Download one firmware block.
    pub const DNLOAD: u8 = 1;
    /// Upload one firmware block.
    pub const UPLOAD: u8 = 2;
    /// Read status, poll timeout, and state.
    pub const GETSTATUS: u8 = 3;
    /// Clear an error condition.
    pub const CLRSTATUS: u8 = 4;
    /// Read the bare state byte.
    pub const GETSTATE: u8 = 5;
    /// Abort back to idle.
    pub const ABORT: u8 = 6;
}

/// Device-side DFU state machine positions (DFU 1.1 §A.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuState {
    /// Application mode, idle.
    AppIdle = 0,
    /// Application mode, waiting for reset after a detach request.
    AppDetach = 1,
    /// DFU mode, idle.
    DfuIdle = 2,
    /// Block received, host must poll status.
    DownloadSync = 3,
    /// Device is programming the block.
    DownloadBusy = 4,
    /// Ready for the next block.
    DownloadIdle = 5,
    /// Final block received, host must poll status.
    ManifestSync = 6,
    /// Device is manifesting the new firmware.
    Manifest = 7,
    /// Manifestation done, device awaits USB reset.
    ManifestWaitReset = 8,
    /// Mid-upload.
    UploadIdle = 9,
    /// Terminal error; only `CLRSTATUS` leaves this state.
    Error = 10,
}

impl DfuState {
    /// Decode the wire state byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::AppIdle),
            1 => Some(Self::AppDetach),
            2 => Some(Self::DfuIdle),
            3 => Some(Self::DownloadSync),
            4 => Some(Self::DownloadBusy),
            5 => Some(Self::DownloadIdle),
            6 => Some(Self::ManifestSync),
            7 => Some(Self::Manifest),
            8 => Some(Self::ManifestWaitReset),
            9 => Some(Self::UploadIdle),
            10 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Device-reported result of the previous request (DFU 1.1 §6.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)] // names mirror the DFU specification table
pub enum DfuStatusCode {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0A,
    ErrVendor = 0x0B,
    ErrUsbReset = 0x0C,
    ErrPowerOnReset = 0x0D,
    ErrUnknown = 0x0E,
    ErrStalledPkt = 0x0F,
}

impl DfuStatusCode {
    /// Decode the wire status byte; unknown codes collapse to `ErrUnknown`.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotDone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbReset,
            0x0D => Self::ErrPowerOnReset,
            0x0F => Self::ErrStalledPkt,
            _ => Self::ErrUnknown,
        }
    }
}

/// Response to `GETSTATUS`.
#[derive(Debug, Clone, Copy)]
pub struct DfuStatus {
    /// Result of the previous request.
    pub status: DfuStatusCode,
    /// Minimum wait before the next request while busy, in milliseconds.
    pub poll_timeout_ms: u32,
    /// State the device entered on receiving `GETSTATUS`.
    pub state: DfuState,
    /// Index of a vendor status string descriptor, 0 if none.
    pub string_index: u8,
}

impl DfuStatus {
    const WIRE_LEN: usize = 6;

    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return Err(BeagleError::malformed_descriptor(format!(
                "DFU status: {} bytes, need {}",
                bytes.len(),
                Self::WIRE_LEN
            )));
        }
        let state = DfuState::from_raw(bytes[4]).ok_or_else(|| {
            BeagleError::malformed_descriptor(format!("DFU status: state byte {:#04x}", bytes[4]))
        })?;
        Ok(Self {
            status: DfuStatusCode::from_raw(bytes[0]),
            poll_timeout_ms: u32::from(bytes[1])
                | (u32::from(bytes[2]) << 8)
                | (u32::from(bytes[3]) << 16),
            state,
            string_index: bytes[5],
        })
    }
}

/// Parsed DFU functional descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuFunctionalDescriptor {
    /// Capability bitmap (`bmAttributes`).
    pub attributes: u8,
    /// How long the device waits for reset after `DETACH`, in milliseconds.
    pub detach_timeout_ms: u16,
    /// Largest block the device accepts per `DNLOAD`/`UPLOAD`.
    pub transfer_size: u16,
    /// DFU specification release, BCD.
    pub dfu_version: u16,
}

impl DfuFunctionalDescriptor {
    const WIRE_LEN: usize = 9;

    /// Whether the device accepts downloads.
    #[must_use]
    pub const fn can_download(&self) -> bool {
        self.attributes & 0x01 != 0
    }

    /// Whether the device supports read-back uploads.
    #[must_use]
    pub const fn can_upload(&self) -> bool {
        self.attributes & 0x02 != 0
    }

    /// Whether the device stays attached through manifestation.
    #[must_use]
    pub const fn manifestation_tolerant(&self) -> bool {
        self.attributes & 0x04 != 0
    }

    /// Whether the device detaches itself after `DETACH`.
    #[must_use]
    pub const fn will_detach(&self) -> bool {
        self.attributes & 0x08 != 0
    }

    /// Scan concatenated class-specific descriptor bytes for a functional
    /// descriptor.
    #[must_use]
    pub fn find_in_extra(extra: &[u8]) -> Option<Self> {
        let mut at = 0;
        while at + 2 <= extra.len() {
            let len = usize::from(extra[at]);
            if len < 2 || at + len > extra.len() {
                return None;
            }
            if extra[at + 1] == DFU_FUNCTIONAL_DESCRIPTOR_TYPE && len >= Self::WIRE_LEN {
                let body = &extra[at..at + len];
                return Some(Self {
                    attributes: body[2],
                    detach_timeout_ms: u16::from_le_bytes([body[3], body[4]]),
                    transfer_size: u16::from_le_bytes([body[5], body[6]]),
                    dfu_version: u16::from_le_bytes([body[7], body[8]]),
                });
            }
            at += len;
        }
        None
    }
}

/// A DFU-capable interface located in a configuration descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DfuInterfaceInfo {
    /// Interface number to bind DFU requests to.
    pub interface_number: u8,
    /// The interface's functional descriptor.
    pub functional: DfuFunctionalDescriptor,
}

/// Locate DFU-class interfaces and their functional descriptors in a parsed
/// configuration descriptor.
///
/// # Errors
///
/// Returns [`NotFound`](BeagleError::NotFound) if no DFU interface is
/// present, or [`MalformedDescriptor`](BeagleError::MalformedDescriptor) if a
/// DFU interface lacks its functional descriptor.
pub fn find_dfu_interfaces(config: &ConfigurationDescriptor) -> Result<Vec<DfuInterfaceInfo>> {
    let mut found = Vec::new();
    for interface in &config.interfaces {
        if interface.class != DFU_CLASS || interface.sub_class != DFU_SUBCLASS {
            continue;
        }
        let functional = DfuFunctionalDescriptor::find_in_extra(&interface.extra)
            .or_else(|| DfuFunctionalDescriptor::find_in_extra(&config.extra))
            .ok_or_else(|| {
                BeagleError::malformed_descriptor(format!(
                    "interface {} is DFU class but has no functional descriptor",
                    interface.interface_number
                ))
            })?;
        found.push(DfuInterfaceInfo {
            interface_number: interface.interface_number,
            functional,
        });
    }
    if found.is_empty() {
        return Err(BeagleError::not_found("DFU interface"));
    }
    Ok(found)
}

const CLASS_INTERFACE_OUT: u8 = 0x21;
const CLASS_INTERFACE_IN: u8 = 0xA1;

/// DFU command driver for one device handle.
///
/// Holds (does not subclass) the standard command layer. One session at a
/// time: `update_firmware` and `validate_firmware` hold the session lock for
/// their whole run, since the device-side state machine has no concept of
/// concurrent sessions.
#[derive(Debug)]
pub struct DfuCommands {
    commands: StandardCommands,
    interface: Mutex<Option<u8>>,
    session: Mutex<()>,
}

impl DfuCommands {
    /// Create a DFU driver over a standard command layer.
    #[must_use]
    pub fn new(commands: StandardCommands) -> Self {
        Self {
            commands,
            interface: Mutex::new(None),
            session: Mutex::new(()),
        }
    }

    /// Bind subsequent DFU requests to interface `n`. Must be called before
    /// any download/upload/status command.
    pub fn set_dfu_interface(&self, n: u8) {
        *self.interface.lock().expect("DFU interface lock poisoned") = Some(n);
    }

    fn bound_interface(&self) -> Result<u16> {
        self.interface
            .lock()
            .expect("DFU interface lock poisoned")
            .map(u16::from)
            .ok_or_else(|| BeagleError::invalid_state("no DFU interface bound"))
    }

    /// Ask an application-mode device to drop to the bootloader.
    ///
    /// Does not itself confirm the transition — expect the device to
    /// re-enumerate (within `timeout_ms` unless it `will_detach`s itself).
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    pub fn dfu_detach(&self, timeout_ms: u16) -> Result<()> {
        let interface = self.bound_interface()?;
        tracing::info!("DFU detach, device re-enumeration expected within {timeout_ms}ms");
        self.commands.send_control_command(&SetupPacket {
            request_type: CLASS_INTERFACE_OUT,
            request: request::DETACH,
            value: timeout_ms,
            index: interface,
            length: 0,
        })
    }

    /// Download one firmware block. Blocks number sequentially from 0; the
    /// device uses the numbering to detect dropped or reordered blocks and
    /// reports a mismatch on the next `GETSTATUS`.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails or is rejected.
    pub fn dfu_download_block(&self, block_number: u16, data: &[u8]) -> Result<()> {
        let interface = self.bound_interface()?;
        self.commands.send_control_command_with_data_out(
            &SetupPacket {
                request_type: CLASS_INTERFACE_OUT,
                request: request::DNLOAD,
                value: block_number,
                index: interface,
                length: data.len() as u16,
            },
            data,
        )
    }

    /// Upload one firmware block into `buffer`; returns the byte count the
    /// device produced (short means end of image).
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails or is rejected.
    pub fn dfu_upload_block(&self, block_number: u16, buffer: &mut [u8]) -> Result<usize> {
        let interface = self.bound_interface()?;
        self.commands.send_control_command_with_data_in(
            &SetupPacket {
                request_type: CLASS_INTERFACE_IN,
                request: request::UPLOAD,
                value: block_number,
                index: interface,
                length: buffer.len() as u16,
            },
            buffer,
        )
    }

    /// Poll device status. While the reply says `DownloadBusy`, wait at
    /// least `poll_timeout_ms` before the next request.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails or the reply is
    /// malformed.
    pub fn dfu_get_status(&self) -> Result<DfuStatus> {
        let interface = self.bound_interface()?;
        let mut reply = [0u8; DfuStatus::WIRE_LEN];
        let received = self.commands.send_control_command_with_data_in(
            &SetupPacket {
                request_type: CLASS_INTERFACE_IN,
                request: request::GETSTATUS,
                value: 0,
                index: interface,
                length: reply.len() as u16,
            },
            &mut reply,
        )?;
        DfuStatus::parse(&reply[..received])
    }

    /// Read the bare state byte without side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails or the state byte is
    /// unknown.
    pub fn dfu_get_state(&self) -> Result<DfuState> {
        let interface = self.bound_interface()?;
        let mut reply = [0u8; 1];
        let received = self.commands.send_control_command_with_data_in(
            &SetupPacket {
                request_type: CLASS_INTERFACE_IN,
                request: request::GETSTATE,
                value: 0,
                index: interface,
                length: 1,
            },
            &mut reply,
        )?;
        if received < 1 {
            return Err(BeagleError::malformed_descriptor("empty DFU state reply"));
        }
        DfuState::from_raw(reply[0]).ok_or_else(|| {
            BeagleError::malformed_descriptor(format!("DFU state byte {:#04x}", reply[0]))
        })
    }

    /// Clear a device-side error. The only way out of [`DfuState::Error`].
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    pub fn dfu_clear_status(&self) -> Result<()> {
        let interface = self.bound_interface()?;
        self.commands.send_control_command(&SetupPacket {
            request_type: CLASS_INTERFACE_OUT,
            request: request::CLRSTATUS,
            value: 0,
            index: interface,
            length: 0,
        })
    }

    /// Abort back to `DfuIdle` from an idle download/upload state.
    ///
    /// # Errors
    ///
    /// Returns an error if the control transfer fails.
    pub fn dfu_abort(&self) -> Result<()> {
        let interface = self.bound_interface()?;
        self.commands.send_control_command(&SetupPacket {
            request_type: CLASS_INTERFACE_OUT,
            request: request::ABORT,
            value: 0,
            index: interface,
            length: 0,
        })
    }

    /// Push a firmware image to the device.
    ///
    /// Downloads blocks of at most `descriptor.transfer_size` bytes,
    /// terminates with a zero-length block, then polls status through
    /// manifestation until the device reports `ManifestWaitReset` (or
    /// `DfuIdle` for manifestation-tolerant devices).
    ///
    /// The operation is atomic from the caller's perspective: on any failure
    /// the partial download is unrecoverable and a retry restarts from
    /// block 0 in a fresh session. No internal retry is attempted.
    ///
    /// # Errors
    ///
    /// Returns an error on transfer failure or a device-reported DFU error;
    /// `dfu_abort` is attempted best-effort before surfacing either.
    pub fn update_firmware(
        &self,
        descriptor: &DfuFunctionalDescriptor,
        image: &Bytes,
    ) -> Result<()> {
        let _session = self.session.lock().expect("DFU session lock poisoned");

        if !descriptor.can_download() {
            return Err(BeagleError::unsupported("DFU download"));
        }

        self.ensure_idle()?;

        let block_size = usize::from(descriptor.transfer_size);
        if block_size == 0 {
            return Err(BeagleError::malformed_descriptor("DFU transfer size 0"));
        }

        tracing::info!(
            "Downloading {} byte firmware image in {} byte blocks",
            image.len(),
            block_size
        );

        let mut block_number: u16 = 0;
        for chunk in image.chunks(block_size) {
            self.download_and_sync(block_number, chunk)?;
            block_number = block_number.wrapping_add(1);
        }

        // Zero-length block signals end of image and starts manifestation.
        self.dfu_download_block(block_number, &[])
            .map_err(|err| self.abort_on(err))?;

        loop {
            let status = self.dfu_get_status().map_err(|err| self.abort_on(err))?;
            match status.state {
                DfuState::ManifestSync | DfuState::Manifest => {
                    std::thread::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms)));
                }
                DfuState::ManifestWaitReset | DfuState::DfuIdle => {
                    tracing::info!("Firmware manifestation complete ({:?})", status.state);
                    return Ok(());
                }
                DfuState::Error => {
                    return Err(BeagleError::DfuProtocol {
                        status: status.status,
                        state: status.state,
                    });
                }
                other => {
                    return Err(BeagleError::invalid_state(format!(
                        "unexpected DFU state {other:?} during manifestation"
                    )));
                }
            }
        }
    }

    /// Read the image back and compare byte-for-byte against `image`.
    /// Only meaningful on devices with upload support.
    ///
    /// # Errors
    ///
    /// Returns [`Unsupported`](BeagleError::Unsupported) if the device cannot
    /// upload, [`FirmwareMismatch`](BeagleError::FirmwareMismatch) on the
    /// first differing byte, or a transfer error.
    pub fn validate_firmware(
        &self,
        descriptor: &DfuFunctionalDescriptor,
        image: &Bytes,
    ) -> Result<()> {
        let _session = self.session.lock().expect("DFU session lock poisoned");

        if !descriptor.can_upload() {
            return Err(BeagleError::unsupported("DFU upload"));
        }

        let block_size = usize::from(descriptor.transfer_size);
        if block_size == 0 {
            return Err(BeagleError::malformed_descriptor("DFU transfer size 0"));
        }
        let mut uploaded = Vec::with_capacity(image.len());
        let mut block = vec![0u8; block_size];
        let mut block_number: u16 = 0;

        while uploaded.len() < image.len() {
            let received = self.dfu_upload_block(block_number, &mut block)?;
            uploaded.extend_from_slice(&block[..received]);
            block_number = block_number.wrapping_add(1);
            if received < block_size {
                break; // device signalled end of image
            }
        }

        for (offset, (got, want)) in uploaded.iter().zip(image.iter()).enumerate() {
            if got != want {
                return Err(BeagleError::FirmwareMismatch { offset });
            }
        }
        if uploaded.len() < image.len() {
            return Err(BeagleError::FirmwareMismatch {
                offset: uploaded.len(),
            });
        }

        tracing::info!("Firmware read-back verified, {} bytes", image.len());
        Ok(())
    }

    /// Download one block and poll status until the device is ready for the
    /// next one.
    fn download_and_sync(&self, block_number: u16, data: &[u8]) -> Result<()> {
        self.dfu_download_block(block_number, data)
            .map_err(|err| self.abort_on(err))?;

        loop {
            let status = self.dfu_get_status().map_err(|err| self.abort_on(err))?;
            match status.state {
                DfuState::DownloadBusy => {
                    std::thread::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms)));
                }
                DfuState::DownloadSync | DfuState::DownloadIdle | DfuState::DfuIdle => {
                    return Ok(());
                }
                DfuState::Error => {
                    let err = BeagleError::DfuProtocol {
                        status: status.status,
                        state: status.state,
                    };
                    return Err(self.abort_on(err));
                }
                other => {
                    return Err(BeagleError::invalid_state(format!(
                        "unexpected DFU state {other:?} after block {block_number}"
                    )));
                }
            }
        }
    }

    /// Bring the device to `DfuIdle`, aborting a stale session if needed.
    /// A device stuck in `Error` is surfaced to the caller, who must clear
    /// status explicitly.
    fn ensure_idle(&self) -> Result<()> {
        let status = self.dfu_get_status()?;
        match status.state {
            DfuState::DfuIdle => Ok(()),
            DfuState::Error => Err(BeagleError::DfuProtocol {
                status: status.status,
                state: status.state,
            }),
            other => {
                tracing::debug!("DFU device in {other:?}, aborting stale session");
                self.dfu_abort()?;
                let status = self.dfu_get_status()?;
                if status.state == DfuState::DfuIdle {
                    Ok(())
                } else {
                    Err(BeagleError::invalid_state(format!(
                        "device did not return to DfuIdle (now {:?})",
                        status.state
                    )))
                }
            }
        }
    }

    /// Best-effort abort before surfacing `err`.
    fn abort_on(&self, err: BeagleError) -> BeagleError {
        tracing::warn!("DFU operation failed, sending abort: {err}");
        if let Err(abort_err) = self.dfu_abort() {
            tracing::debug!("DFU abort also failed: {abort_err}");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for raw in 0..=10u8 {
            let state = DfuState::from_raw(raw).unwrap();
            assert_eq!(state as u8, raw);
        }
        assert_eq!(DfuState::from_raw(11), None);
    }

    #[test]
    fn status_parse() {
        // status OK, poll 250ms, state dfuDNBUSY
        let status = DfuStatus::parse(&[0x00, 0xFA, 0x00, 0x00, 0x04, 0x00]).unwrap();
        assert_eq!(status.status, DfuStatusCode::Ok);
        assert_eq!(status.poll_timeout_ms, 250);
        assert_eq!(status.state, DfuState::DownloadBusy);
    }

    #[test]
    fn functional_descriptor_from_extra() {
        // can_download | can_upload, detach 1000ms, transfer 2048, v1.10
        let extra = [9, 0x21, 0x03, 0xE8, 0x03, 0x00, 0x08, 0x10, 0x01];
        let fd = DfuFunctionalDescriptor::find_in_extra(&extra).unwrap();
        assert!(fd.can_download());
        assert!(fd.can_upload());
        assert!(!fd.manifestation_tolerant());
        assert_eq!(fd.detach_timeout_ms, 1000);
        assert_eq!(fd.transfer_size, 2048);
        assert_eq!(fd.dfu_version, 0x0110);
    }

    #[test]
    fn functional_descriptor_absent() {
        let extra = [4, 0x30, 0x00, 0x00];
        assert_eq!(DfuFunctionalDescriptor::find_in_extra(&extra), None);
    }
}
