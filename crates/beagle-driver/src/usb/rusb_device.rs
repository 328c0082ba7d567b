//! Physical device implementation over libusb (`rusb`).
//!
//! Async transfers are executed by one or more background worker threads per
//! open device; completion callbacks run on those threads. Handle-level state
//! (open flag, claimed interfaces) and async bookkeeping are guarded by
//! separate locks so completion accounting never queues behind a slow
//! synchronous call.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{BeagleError, Result};
use crate::options::DriverOptions;
use crate::usb::device::UsbDeviceInterface;
use crate::usb::transfer::{
    BufferPool, InTransferCallback, OutTransferCallback, SetupPacket, TransferBuffer,
    TransferStatus, TransferTracker,
};

const CONTROL_DIR_IN: u8 = 0x80;
const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

struct HandleState {
    open: bool,
    claimed: BTreeSet<u8>,
}

enum JobKind {
    BulkOut { callback: OutTransferCallback },
    BulkIn { callback: InTransferCallback },
    InterruptIn { callback: InTransferCallback },
}

struct TransferJob {
    endpoint: u8,
    buffer: TransferBuffer,
    timeout: Duration,
    token: u64,
    kind: JobKind,
}

/// Open connection to one physical Beagle over libusb.
pub struct RusbDevice {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    speed: rusb::Speed,
    state: Mutex<HandleState>,
    tracker: Arc<TransferTracker>,
    pool: BufferPool,
    sender: Mutex<Option<Sender<TransferJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for RusbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("device state poisoned");
        f.debug_struct("RusbDevice")
            .field("open", &state.open)
            .field("claimed", &state.claimed)
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl RusbDevice {
    /// Wrap an already-opened libusb handle and start the worker threads.
    pub(crate) fn new(
        handle: rusb::DeviceHandle<rusb::Context>,
        options: &DriverOptions,
    ) -> Result<Self> {
        let speed = handle.device().speed();
        let handle = Arc::new(handle);
        let tracker = Arc::new(TransferTracker::new(options.max_async_transfers));
        let (tx, rx) = mpsc::channel();
        let rx = Arc::new(Mutex::new(rx));

        let worker_count = if options.enable_overlapping_requests {
            options.max_async_transfers.max(1)
        } else {
            1
        };
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let handle = Arc::clone(&handle);
            let rx = Arc::clone(&rx);
            let tracker = Arc::clone(&tracker);
            let worker = std::thread::Builder::new()
                .name(format!("beagle-usb-{i}"))
                .spawn(move || worker_loop(&handle, &rx, &tracker))
                .map_err(|e| {
                    BeagleError::resource_exhausted(format!("USB worker thread: {e}"))
                })?;
            workers.push(worker);
        }

        tracing::debug!("Opened Beagle USB device, speed {speed:?}, {worker_count} worker(s)");

        Ok(Self {
            handle,
            speed,
            state: Mutex::new(HandleState {
                open: true,
                claimed: BTreeSet::new(),
            }),
            tracker,
            pool: BufferPool::default(),
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Negotiated bus speed at enumeration.
    #[must_use]
    pub fn negotiated_speed(&self) -> rusb::Speed {
        self.speed
    }

    /// Whether the transport allocates true DMA-capable buffers.
    ///
    /// libusb's safe surface does not expose device-memory allocation, so
    /// buffers come from a recycling heap pool with identical semantics.
    #[must_use]
    pub fn supports_zero_copy(&self) -> bool {
        false
    }

    fn check_open(&self) -> Result<()> {
        let state = self.state.lock().expect("device state poisoned");
        if state.open {
            Ok(())
        } else {
            Err(BeagleError::NotOpen)
        }
    }

    fn submit(&self, job: TransferJob) -> Result<()> {
        let sender = self.sender.lock().expect("sender poisoned");
        match sender.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| {
                self.tracker.complete();
                BeagleError::NotOpen
            }),
            None => {
                self.tracker.complete();
                Err(BeagleError::NotOpen)
            }
        }
    }
}

fn worker_loop(
    handle: &rusb::DeviceHandle<rusb::Context>,
    rx: &Arc<Mutex<Receiver<TransferJob>>>,
    tracker: &TransferTracker,
) {
    loop {
        let job = {
            let rx = rx.lock().expect("worker receiver poisoned");
            rx.recv()
        };
        let Ok(job) = job else {
            break; // channel closed, device closing
        };
        run_job(handle, tracker, job);
        tracker.complete();
    }
}

fn run_job(
    handle: &rusb::DeviceHandle<rusb::Context>,
    tracker: &TransferTracker,
    job: TransferJob,
) {
    let TransferJob {
        endpoint,
        mut buffer,
        timeout,
        token,
        kind,
    } = job;

    let cancelled = !tracker.is_current(token);
    match kind {
        JobKind::BulkOut { callback } => {
            if cancelled {
                callback(TransferStatus::Cancelled, buffer);
                return;
            }
            let status = match handle.write_bulk(endpoint, &buffer, timeout) {
                Ok(sent) if sent == buffer.len() => TransferStatus::Completed,
                Ok(sent) => {
                    tracing::warn!(
                        "Short async bulk-out on {endpoint:#04x}: {sent} of {}",
                        buffer.len()
                    );
                    TransferStatus::Failed
                }
                Err(err) => TransferStatus::from_rusb(err),
            };
            callback(status, buffer);
        }
        JobKind::BulkIn { callback } => {
            if cancelled {
                callback(TransferStatus::Cancelled, buffer, 0);
                return;
            }
            match handle.read_bulk(endpoint, &mut buffer, timeout) {
                Ok(received) => callback(TransferStatus::Completed, buffer, received),
                Err(err) => callback(TransferStatus::from_rusb(err), buffer, 0),
            }
        }
        JobKind::InterruptIn { callback } => {
            if cancelled {
                callback(TransferStatus::Cancelled, buffer, 0);
                return;
            }
            match handle.read_interrupt(endpoint, &mut buffer, timeout) {
                Ok(received) => callback(TransferStatus::Completed, buffer, received),
                Err(err) => callback(TransferStatus::from_rusb(err), buffer, 0),
            }
        }
    }
}

impl UsbDeviceInterface for RusbDevice {
    fn set_configuration(&self, configuration: u8) -> Result<()> {
        let state = self.state.lock().expect("device state poisoned");
        if !state.open {
            return Err(BeagleError::NotOpen);
        }
        self.handle.set_active_configuration(configuration)?;
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.state.lock().expect("device state poisoned");
        if !state.open {
            return Err(BeagleError::NotOpen);
        }
        self.handle.claim_interface(interface)?;
        state.claimed.insert(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<()> {
        let mut state = self.state.lock().expect("device state poisoned");
        if !state.open {
            return Err(BeagleError::NotOpen);
        }
        self.handle.release_interface(interface)?;
        state.claimed.remove(&interface);
        Ok(())
    }

    fn get_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.check_open()?;
        let value = (u16::from(descriptor_type) << 8) | u16::from(index);
        self.handle
            .read_control(CONTROL_DIR_IN, REQUEST_GET_DESCRIPTOR, value, 0, buffer, timeout)
            .map_err(|e| BeagleError::from_transfer(e, timeout))
    }

    fn send_control_command(&self, setup: &SetupPacket, timeout: Duration) -> Result<()> {
        self.check_open()?;
        if setup.request_type & CONTROL_DIR_IN == 0 {
            self.handle
                .write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &[],
                    timeout,
                )
                .map_err(|e| BeagleError::from_transfer(e, timeout))?;
        } else {
            self.handle
                .read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut [],
                    timeout,
                )
                .map_err(|e| BeagleError::from_transfer(e, timeout))?;
        }
        Ok(())
    }

    fn send_control_command_with_data_out(
        &self,
        setup: &SetupPacket,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        self.check_open()?;
        let sent = self
            .handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                timeout,
            )
            .map_err(|e| BeagleError::from_transfer(e, timeout))?;
        if sent != data.len() {
            return Err(BeagleError::ShortWrite {
                endpoint: 0,
                expected: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    fn send_control_command_with_data_in(
        &self,
        setup: &SetupPacket,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.check_open()?;
        self.handle
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                buffer,
                timeout,
            )
            .map_err(|e| BeagleError::from_transfer(e, timeout))
    }

    fn bulk_out_transfer(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<()> {
        self.check_open()?;
        let sent = self
            .handle
            .write_bulk(endpoint, data, timeout)
            .map_err(|e| BeagleError::from_transfer(e, timeout))?;
        if sent != data.len() {
            return Err(BeagleError::ShortWrite {
                endpoint,
                expected: data.len(),
                actual: sent,
            });
        }
        Ok(())
    }

    fn bulk_in_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.check_open()?;
        self.handle
            .read_bulk(endpoint, buffer, timeout)
            .map_err(|e| BeagleError::from_transfer(e, timeout))
    }

    fn interrupt_in_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.check_open()?;
        self.handle
            .read_interrupt(endpoint, buffer, timeout)
            .map_err(|e| BeagleError::from_transfer(e, timeout))
    }

    fn async_bulk_out_transfer(
        &self,
        endpoint: u8,
        data: TransferBuffer,
        timeout: Duration,
        callback: OutTransferCallback,
    ) -> Result<()> {
        self.check_open()?;
        let token = self.tracker.register()?;
        self.submit(TransferJob {
            endpoint,
            buffer: data,
            timeout,
            token,
            kind: JobKind::BulkOut { callback },
        })
    }

    fn async_bulk_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
        callback: InTransferCallback,
    ) -> Result<()> {
        self.check_open()?;
        let token = self.tracker.register()?;
        self.submit(TransferJob {
            endpoint,
            buffer,
            timeout,
            token,
            kind: JobKind::BulkIn { callback },
        })
    }

    fn async_interrupt_in_transfer(
        &self,
        endpoint: u8,
        buffer: TransferBuffer,
        timeout: Duration,
        callback: InTransferCallback,
    ) -> Result<()> {
        self.check_open()?;
        let token = self.tracker.register()?;
        self.submit(TransferJob {
            endpoint,
            buffer,
            timeout,
            token,
            kind: JobKind::InterruptIn { callback },
        })
    }

    fn try_cancel_all_transfers(&self) -> Result<()> {
        self.check_open()?;
        self.tracker.cancel_all();
        Ok(())
    }

    fn allocate_transfer_buffer(&self, len: usize) -> Result<TransferBuffer> {
        self.check_open()?;
        Ok(self.pool.allocate(len))
    }

    fn release_transfer_buffer(&self, buffer: TransferBuffer) -> Result<()> {
        self.check_open()?;
        self.pool.release(buffer);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("device state poisoned");
            if !state.open {
                return Ok(());
            }
            state.open = false;
        }

        // Stop accepting submissions, flush queued transfers as cancelled,
        // and wait for every callback to fire before touching the handle.
        self.tracker.begin_close();
        drop(self.sender.lock().expect("sender poisoned").take());
        self.tracker.wait_quiesced();
        for worker in self.workers.lock().expect("workers poisoned").drain(..) {
            if worker.join().is_err() {
                tracing::error!("USB worker thread panicked");
            }
        }

        let claimed: Vec<u8> = {
            let mut state = self.state.lock().expect("device state poisoned");
            std::mem::take(&mut state.claimed).into_iter().collect()
        };
        for interface in claimed {
            if let Err(err) = self.handle.release_interface(interface) {
                tracing::debug!("Releasing interface {interface} on close: {err}");
            }
        }

        tracing::info!("Closed Beagle USB device");
        Ok(())
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!("Close during drop: {err}");
        }
    }
}
