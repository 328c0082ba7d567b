//! Emulated USB device.
//!
//! An in-memory Beagle: a CSR map served over vendor control transfers,
//! loopback bulk/interrupt endpoints, and a device-side DFU state machine
//! faithful enough to exercise every host-side transition. The transfer
//! primitive layer runs against this exactly as it does against hardware,
//! which is what the integration tests do.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{BeagleError, Result};
use crate::usb::device::UsbDeviceInterface;
use crate::usb::dfu::{request, DfuState, DfuStatusCode, DFU_CLASS, DFU_SUBCLASS};
use crate::usb::transfer::{
    BufferPool, InTransferCallback, OutTransferCallback, SetupPacket, TransferBuffer,
    TransferStatus, TransferTracker,
};

const CONTROL_DIR_IN: u8 = 0x80;
const CONTROL_TYPE_MASK: u8 = 0x60;
const CONTROL_TYPE_CLASS: u8 = 0x20;
const CONTROL_TYPE_VENDOR: u8 = 0x40;

const VENDOR_REQUEST_CSR64: u8 = 0x00;
const VENDOR_REQUEST_CSR32: u8 = 0x01;

/// Poll interval of the async completion threads.
const ASYNC_POLL: Duration = Duration::from_millis(1);

/// Transfer size advertised by the emulated DFU functional descriptor.
pub const FAKE_DFU_TRANSFER_SIZE: u16 = 2048;

/// Device-side DFU model.
#[derive(Debug)]
struct DfuDeviceModel {
    state: DfuState,
    status: DfuStatusCode,
    busy_cycles: u8,
    next_block: u16,
    storage: Vec<u8>,
    blocks_received: usize,
}

impl DfuDeviceModel {
    fn new(initial_state: DfuState) -> Self {
        Self {
            state: initial_state,
            status: DfuStatusCode::Ok,
            busy_cycles: 0,
            next_block: 0,
            storage: Vec::new(),
            blocks_received: 0,
        }
    }

    fn fail(&mut self, status: DfuStatusCode) {
        self.state = DfuState::Error;
        self.status = status;
    }

    fn handle_out(&mut self, req: u8, value: u16, data: &[u8]) -> Result<()> {
        match req {
            request::DETACH => {
                if self.state == DfuState::AppIdle {
                    self.state = DfuState::AppDetach;
                    Ok(())
                } else {
                    Err(BeagleError::Stall)
                }
            }
            request::DNLOAD => self.handle_download(value, data),
            request::CLRSTATUS => {
                if self.state == DfuState::Error {
                    self.state = DfuState::DfuIdle;
                    self.status = DfuStatusCode::Ok;
                    self.next_block = 0;
                    Ok(())
                } else {
                    Err(BeagleError::Stall)
                }
            }
            request::ABORT => match self.state {
                DfuState::DfuIdle | DfuState::DownloadIdle | DfuState::UploadIdle => {
                    self.state = DfuState::DfuIdle;
                    self.next_block = 0;
                    Ok(())
                }
                _ => Err(BeagleError::Stall),
            },
            _ => Err(BeagleError::Stall),
        }
    }

    fn handle_download(&mut self, block: u16, data: &[u8]) -> Result<()> {
        // A device in Error rejects everything without side effects until
        // status is cleared.
        if self.state == DfuState::Error {
            return Err(BeagleError::Stall);
        }
        if data.is_empty() {
            // Zero-length block terminates the image.
            if self.state == DfuState::DownloadIdle {
                self.state = DfuState::ManifestSync;
                Ok(())
            } else {
                self.fail(DfuStatusCode::ErrNotDone);
                Err(BeagleError::Stall)
            }
        } else {
            match self.state {
                DfuState::DfuIdle | DfuState::DownloadIdle => {
                    if data.len() > usize::from(FAKE_DFU_TRANSFER_SIZE) {
                        self.fail(DfuStatusCode::ErrUnknown);
                        return Err(BeagleError::Stall);
                    }
                    if self.state == DfuState::DfuIdle {
                        // Fresh session restarts from block 0.
                        self.storage.clear();
                        self.next_block = 0;
                        self.blocks_received = 0;
                    }
                    if block != self.next_block {
                        // Dropped or reordered block, reported on next GETSTATUS.
                        self.fail(DfuStatusCode::ErrAddress);
                        return Ok(());
                    }
                    self.storage.extend_from_slice(data);
                    self.next_block = self.next_block.wrapping_add(1);
                    self.blocks_received += 1;
                    self.busy_cycles = 1;
                    self.state = DfuState::DownloadSync;
                    Ok(())
                }
                _ => Err(BeagleError::Stall),
            }
        }
    }

    fn handle_in(&mut self, req: u8, value: u16, buffer: &mut [u8]) -> Result<usize> {
        match req {
            request::GETSTATUS => {
                let reported = self.status_transition();
                if buffer.len() < 6 {
                    return Err(BeagleError::Stall);
                }
                buffer[0] = self.status as u8;
                // Tiny poll timeout keeps the host loops fast.
                buffer[1..4].copy_from_slice(&[1, 0, 0]);
                buffer[4] = reported as u8;
                buffer[5] = 0;
                Ok(6)
            }
            request::GETSTATE => {
                if buffer.is_empty() {
                    return Err(BeagleError::Stall);
                }
                buffer[0] = self.state as u8;
                Ok(1)
            }
            request::UPLOAD => self.handle_upload(value, buffer),
            _ => Err(BeagleError::Stall),
        }
    }

    /// State reported by (and entered after) a `GETSTATUS`.
    fn status_transition(&mut self) -> DfuState {
        match self.state {
            DfuState::DownloadSync => {
                if self.busy_cycles > 0 {
                    self.busy_cycles -= 1;
                    DfuState::DownloadBusy
                } else {
                    self.state = DfuState::DownloadIdle;
                    DfuState::DownloadIdle
                }
            }
            DfuState::ManifestSync => {
                self.state = DfuState::Manifest;
                DfuState::Manifest
            }
            DfuState::Manifest => {
                // Not manifestation tolerant: park until USB reset.
                self.state = DfuState::ManifestWaitReset;
                DfuState::ManifestWaitReset
            }
            other => other,
        }
    }

    fn handle_upload(&mut self, block: u16, buffer: &mut [u8]) -> Result<usize> {
        match self.state {
            DfuState::DfuIdle | DfuState::UploadIdle => {
                let offset = usize::from(block) * usize::from(FAKE_DFU_TRANSFER_SIZE);
                let remaining = self.storage.len().saturating_sub(offset);
                let n = remaining.min(buffer.len());
                buffer[..n].copy_from_slice(&self.storage[offset..offset + n]);
                self.state = if n < buffer.len() {
                    DfuState::DfuIdle
                } else {
                    DfuState::UploadIdle
                };
                Ok(n)
            }
            _ => Err(BeagleError::Stall),
        }
    }
}

#[derive(Debug)]
struct FakeState {
    open: bool,
    configuration: Option<u8>,
    claimed: BTreeSet<u8>,
    registers: HashMap<u64, u64>,
    bulk_out: HashMap<u8, Vec<Vec<u8>>>,
    in_queues: HashMap<u8, VecDeque<Vec<u8>>>,
    short_next_bulk_out: Option<usize>,
    dfu: DfuDeviceModel,
    device_descriptor: Vec<u8>,
    config_descriptor: Vec<u8>,
}

#[derive(Debug)]
struct FakeInner {
    state: Mutex<FakeState>,
    data_ready: Condvar,
    tracker: TransferTracker,
    pool: BufferPool,
}

/// Emulated Beagle USB device.
///
/// Starts in DFU mode by default (the personality a fresh module presents);
/// [`FakeUsbDevice::new_application_mode`] starts with firmware "running".
#[derive(Debug, Clone)]
pub struct FakeUsbDevice {
    inner: Arc<FakeInner>,
}

fn build_device_descriptor(vendor: u16, product: u16) -> Vec<u8> {
    let mut bytes = vec![18, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 64];
    bytes.extend_from_slice(&vendor.to_le_bytes());
    bytes.extend_from_slice(&product.to_le_bytes());
    bytes.extend_from_slice(&[0x00, 0x01, 0, 0, 0, 1]);
    bytes
}

fn build_config_descriptor() -> Vec<u8> {
    let mut bytes = vec![9, 0x02, 0, 0, 1, 1, 0, 0x80, 50];
    // DFU interface.
    bytes.extend_from_slice(&[9, 0x04, 0, 0, 0, DFU_CLASS, DFU_SUBCLASS, 0x02, 0]);
    // DFU functional descriptor: can download + upload, detach 1000ms,
    // transfer size 2048, DFU 1.10.
    bytes.push(9);
    bytes.push(0x21);
    bytes.push(0x03);
    bytes.extend_from_slice(&1000u16.to_le_bytes());
    bytes.extend_from_slice(&FAKE_DFU_TRANSFER_SIZE.to_le_bytes());
    bytes.extend_from_slice(&0x0110u16.to_le_bytes());
    let total = bytes.len() as u16;
    bytes[2..4].copy_from_slice(&total.to_le_bytes());
    bytes
}

impl Default for FakeUsbDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUsbDevice {
    /// New emulated device in DFU mode.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial_state(
            DfuState::DfuIdle,
            beagle_chip::usb_ids::DFU_VENDOR_ID,
            beagle_chip::usb_ids::product_id::BEAGLE_DFU,
        )
    }

    /// New emulated device in application mode (firmware running).
    #[must_use]
    pub fn new_application_mode() -> Self {
        Self::with_initial_state(
            DfuState::AppIdle,
            beagle_chip::usb_ids::APP_VENDOR_ID,
            beagle_chip::usb_ids::product_id::BEAGLE_APP,
        )
    }

    fn with_initial_state(dfu_state: DfuState, vendor: u16, product: u16) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                state: Mutex::new(FakeState {
                    open: true,
                    configuration: None,
                    claimed: BTreeSet::new(),
                    registers: HashMap::new(),
                    bulk_out: HashMap::new(),
                    in_queues: HashMap::new(),
                    short_next_bulk_out: None,
                    dfu: DfuDeviceModel::new(dfu_state),
                    device_descriptor: build_device_descriptor(vendor, product),
                    config_descriptor: build_config_descriptor(),
                }),
                data_ready: Condvar::new(),
                tracker: TransferTracker::new(16),
                pool: BufferPool::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.inner.state.lock().expect("fake device state poisoned")
    }

    fn lock_open(&self) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        let state = self.lock();
        if state.open {
            Ok(state)
        } else {
            Err(BeagleError::NotOpen)
        }
    }

    // ── emulator controls (test surface) ────────────────────────────────

    /// Configuration selected by the host, if any.
    #[must_use]
    pub fn active_configuration(&self) -> Option<u8> {
        self.lock().configuration
    }

    /// Interfaces currently claimed by the host.
    #[must_use]
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.lock().claimed.iter().copied().collect()
    }

    /// Queue data to be returned by the next in-transfer on `endpoint`.
    pub fn queue_in_data(&self, endpoint: u8, data: Vec<u8>) {
        let mut state = self.lock();
        state.in_queues.entry(endpoint).or_default().push_back(data);
        self.inner.data_ready.notify_all();
    }

    /// Payloads written to `endpoint` so far.
    #[must_use]
    pub fn bulk_out_log(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.lock().bulk_out.get(&endpoint).cloned().unwrap_or_default()
    }

    /// Make the next bulk-out accept only `sent` bytes.
    pub fn inject_short_bulk_out(&self, sent: usize) {
        self.lock().short_next_bulk_out = Some(sent);
    }

    /// Read back an emulated CSR.
    #[must_use]
    pub fn register_value(&self, offset: u64) -> u64 {
        self.lock().registers.get(&offset).copied().unwrap_or(0)
    }

    /// Preload an emulated CSR.
    pub fn set_register(&self, offset: u64, value: u64) {
        self.lock().registers.insert(offset, value);
    }

    /// Current device-side DFU state.
    #[must_use]
    pub fn dfu_state(&self) -> DfuState {
        self.lock().dfu.state
    }

    /// Force the device-side DFU state (for error-path tests).
    pub fn force_dfu_state(&self, state: DfuState, status: DfuStatusCode) {
        let mut guard = self.lock();
        guard.dfu.state = state;
        guard.dfu.status = status;
    }

    /// Firmware bytes the device has accepted.
    #[must_use]
    pub fn dfu_storage(&self) -> Vec<u8> {
        self.lock().dfu.storage.clone()
    }

    /// Non-empty download blocks the device has accepted.
    #[must_use]
    pub fn dfu_blocks_received(&self) -> usize {
        self.lock().dfu.blocks_received
    }

    // ── control dispatch ────────────────────────────────────────────────

    fn control_out(&self, setup: &SetupPacket, data: &[u8]) -> Result<()> {
        let mut state = self.lock_open()?;
        match setup.request_type & CONTROL_TYPE_MASK {
            CONTROL_TYPE_CLASS => state.dfu.handle_out(setup.request, setup.value, data),
            CONTROL_TYPE_VENDOR => {
                let offset =
                    u64::from(setup.value) | (u64::from(setup.index) << 16);
                match (setup.request, data.len()) {
                    (VENDOR_REQUEST_CSR32, 4) => {
                        let value =
                            u64::from(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                        state.registers.insert(offset, value);
                        Ok(())
                    }
                    (VENDOR_REQUEST_CSR64, 8) => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(data);
                        state.registers.insert(offset, u64::from_le_bytes(raw));
                        Ok(())
                    }
                    _ => Err(BeagleError::Stall),
                }
            }
            _ => Err(BeagleError::Stall),
        }
    }

    fn control_in(&self, setup: &SetupPacket, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.lock_open()?;
        match setup.request_type & CONTROL_TYPE_MASK {
            CONTROL_TYPE_CLASS => state.dfu.handle_in(setup.request, setup.value, buffer),
            CONTROL_TYPE_VENDOR => {
                let offset =
                    u64::from(setup.value) | (u64::from(setup.index) << 16);
                let value = state.registers.get(&offset).copied().unwrap_or(0);
                match (setup.request, buffer.len()) {
                    (VENDOR_REQUEST_CSR32, n) if n >= 4 => {
                        buffer[..4].copy_from_slice(&(value as u32).to_le_bytes());
                        Ok(4)
                    }
                    (VENDOR_REQUEST_CSR64, n) if n >= 8 => {
                        buffer[..8].copy_from_slice(&value.to_le_bytes());
                        Ok(8)
                    }
                    _ => Err(BeagleError::Stall),
                }
            }
            _ => Err(BeagleError::Stall),
        }
    }

    fn pop_in_data(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_open()?;
        loop {
            if let Some(data) = state
                .in_queues
                .get_mut(&endpoint)
                .and_then(VecDeque::pop_front)
            {
                let n = data.len().min(buffer.len());
                buffer[..n].copy_from_slice(&data[..n]);
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BeagleError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                });
            }
            let (next, _) = self
                .inner
                .data_ready
                .wait_timeout(state, deadline - now)
                .expect("fake device state poisoned");
            state = next;
            if !state.open {
                return Err(BeagleError::NotOpen);
            }
        }
    }

    fn spawn_async_in(
        &self,
        endpoint: u8,
        mut buffer: TransferBuffer,
        timeout: Duration,
        callback: InTransferCallback,
    ) -> Result<()> {
        self.lock_open()?;
        let token = self.inner.tracker.register()?;
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            loop {
                if !inner.tracker.is_current(token) {
                    callback(TransferStatus::Cancelled, buffer, 0);
                    break;
                }
                {
                    let mut state = inner.state.lock().expect("fake device state poisoned");
                    if let Some(data) = state
                        .in_queues
                        .get_mut(&endpoint)
                        .and_then(VecDeque::pop_front)
                    {
                        let n = data.len().min(buffer.len());
                        buffer[..n].copy_from_slice(&data[..n]);
                        drop(state);
                        callback(TransferStatus::Completed, buffer, n);
                        break;
                    }
                }
                if Instant::now() >= deadline {
                    callback(TransferStatus::TimedOut, buffer, 0);
                    break;
                }
                std::thread::sleep(ASYNC_POLL);
            }
            inner.tracker.complete();
        });
        Ok(())
    }

    fn record_bulk_out(state: &mut FakeState, endpoint: u8, data: &[u8]) -> Result<()> {
        let requested = data.len();
        let sent = state
            .short_next_bulk_out
            .take()
            .map_or(requested, |n| n.min(requested));
        state
            .bulk_out
            .entry(endpoint)
            .or_default()
            .push(data[..sent].to_vec());
        if sent != requested {
            return Err(BeagleError::ShortWrite {
                endpoint,
                expected: requested,
                actual: sent,
            });
        }
        Ok(())
    }
}

impl UsbDeviceInterface for FakeUsbDevice {
    fn set_configuration(&self, configuration: u8) -> Result<()> {
        self.lock_open()?.configuration = Some(configuration);
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        self.lock_open()?.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        self.lock_open()?.claimed.remove(&interface);
        Ok(())
    }

    fn get_descriptor(
        &self,
        descriptor_type: u8,
        _index: u8,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let state = self.lock_open()?;
        let source = match descriptor_type {
            0x01 => &state.device_descriptor,
            0x02 => &state.config_descriptor,
            _ => return Err(BeagleError::Stall),
        };
        let n = source.len().min(buffer.len());
        buffer[..n].copy_from_slice(&source[..n]);
        Ok(n)
    }

    fn send_control_command(&self, setup: &SetupPacket, _timeout: Duration) -> Result<()> {
        if setup.request_type & CONTROL_DIR_IN == 0 {
            self.control_out(setup, &[])
        } else {
            self.control_in(setup, &mut []).map(|_| ())
        }
    }

    fn send_control_command_with_data_out(
        &self,
        setup: &SetupPacket,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        self.control_out(setup, data)
    }

    fn send_control_command_with_data_in(
        &self,
        setup: &SetupPacket,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        self.control_in(setup, buffer)
    }

    fn bulk_out_transfer(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<()> {
        let mut state = self.lock_open()?;
        Self::record_bulk_out(&mut state, endpoint, data)
    }

    fn bulk_in_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.pop_in_data(endpoint, buffer, timeout)
    }

    fn interrupt_in_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.pop_in_data(endpoint, buffer, timeout)
    }

    fn async_bulk_out_transfer(
        &self,
        endpoint: u8,
        data: TransferBuffer,
        _timeout: Duration,
        callback: OutTransferCallback,
    ) -> Result<()> {
        self.lock_open()?;
        let token = self.inner.tracker.register()?;
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            if inner.tracker.is_current(token) {
                let result = {
                    let mut state = inner.state.lock().expect("fake device state poisoned");
                    FakeUsbDevice::record_bulk_out(&mut state, endpoint, &data)
                };
                let status = match result {
                    Ok(()) => TransferStatus::Completed,
                    Err(_) => TransferStatus::Failed,
                };
                callback(status, data);
            } else {
                callback(TransferStatus::Cancelled, data);
            }
            inner.tracker.complete();
        });
        Ok(())
    }

    fn async_bulk_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
        callback: InTransferCallback,
    ) -> Result<()> {
        self.spawn_async_in(endpoint, buffer, timeout, callback)
    }

    fn async_interrupt_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
        callback: InTransferCallback,
    ) -> Result<()> {
        self.spawn_async_in(endpoint, buffer, timeout, callback)
    }

    fn try_cancel_all_transfers(&self) -> Result<()> {
        self.lock_open()?;
        self.inner.tracker.cancel_all();
        Ok(())
    }

    fn allocate_transfer_buffer(&self, len: usize) -> Result<TransferBuffer> {
        self.lock_open()?;
        Ok(self.inner.pool.allocate(len))
    }

    fn release_transfer_buffer(&self, buffer: TransferBuffer) -> Result<()> {
        self.lock_open()?;
        self.inner.pool.release(buffer);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if !state.open {
                return Ok(());
            }
            state.open = false;
        }
        self.inner.tracker.begin_close();
        self.inner.data_ready.notify_all();
        self.inner.tracker.wait_quiesced();
        Ok(())
    }
}
