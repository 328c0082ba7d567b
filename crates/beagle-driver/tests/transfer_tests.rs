//! Transfer primitive semantics against the emulated device.
//!
//! Short-transfer rules, cancellation, and close quiescence — the contracts
//! every `UsbDeviceInterface` implementation must hold.

use std::sync::mpsc;
use std::time::Duration;

use beagle_driver::{BeagleError, FakeUsbDevice, TransferStatus, UsbDeviceInterface};

const TIMEOUT: Duration = Duration::from_millis(1000);

#[test]
fn configuration_and_interface_claims_are_tracked() {
    let device = FakeUsbDevice::new();
    device.set_configuration(1).unwrap();
    device.claim_interface(0).unwrap();
    assert_eq!(device.active_configuration(), Some(1));
    assert_eq!(device.claimed_interfaces(), vec![0]);
    device.release_interface(0).unwrap();
    assert!(device.claimed_interfaces().is_empty());
}

#[test]
fn bulk_out_short_transfer_is_an_error() {
    let device = FakeUsbDevice::new();
    device.inject_short_bulk_out(100);

    let err = device
        .bulk_out_transfer(0x01, &[0xAB; 512], TIMEOUT)
        .unwrap_err();
    match err {
        BeagleError::ShortWrite {
            endpoint,
            expected,
            actual,
        } => {
            assert_eq!(endpoint, 0x01);
            assert_eq!(expected, 512);
            assert_eq!(actual, 100);
        }
        other => panic!("expected ShortWrite, got {other:?}"),
    }

    // A full-length write on the same endpoint then succeeds.
    device.bulk_out_transfer(0x01, &[0xAB; 512], TIMEOUT).unwrap();
    assert_eq!(device.bulk_out_log(0x01).len(), 2);
}

#[test]
fn bulk_in_short_transfer_reports_actual_count() {
    let device = FakeUsbDevice::new();
    device.queue_in_data(0x81, vec![0x5A; 64]);

    let mut buffer = [0u8; 4096];
    let received = device.bulk_in_transfer(0x81, &mut buffer, TIMEOUT).unwrap();
    assert_eq!(received, 64);
    assert!(buffer[..64].iter().all(|&b| b == 0x5A));
}

#[test]
fn interrupt_in_short_transfer_reports_actual_count() {
    let device = FakeUsbDevice::new();
    device.queue_in_data(0x82, vec![1, 2, 3]);

    let mut buffer = [0u8; 16];
    let received = device
        .interrupt_in_transfer(0x82, &mut buffer, TIMEOUT)
        .unwrap();
    assert_eq!(received, 3);
    assert_eq!(&buffer[..3], &[1, 2, 3]);
}

#[test]
fn bulk_in_with_no_data_times_out() {
    let device = FakeUsbDevice::new();
    let mut buffer = [0u8; 16];
    let err = device
        .bulk_in_transfer(0x81, &mut buffer, Duration::from_millis(20))
        .unwrap_err();
    assert!(matches!(err, BeagleError::Timeout { .. }));
}

#[test]
fn cancelled_async_bulk_in_fires_callback_exactly_once() {
    let device = FakeUsbDevice::new();
    let buffer = device.allocate_transfer_buffer(4096).unwrap();
    let (tx, rx) = mpsc::channel();

    device
        .async_bulk_in_transfer(
            0x81,
            buffer,
            TIMEOUT,
            Box::new(move |status, _buffer, received| {
                tx.send((status, received)).unwrap();
            }),
        )
        .unwrap();

    device.try_cancel_all_transfers().unwrap();

    let (status, received) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(
        status,
        TransferStatus::Cancelled | TransferStatus::TimedOut
    ));
    assert!(received <= 4096);
    if status == TransferStatus::Cancelled {
        assert_eq!(received, 0);
    }

    // Exactly once: the sender is gone after the first invocation, and no
    // second message ever arrives.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn every_submitted_callback_fires_after_cancel_all() {
    let device = FakeUsbDevice::new();
    let (tx, rx) = mpsc::channel();

    for _ in 0..4 {
        let tx = tx.clone();
        let buffer = device.allocate_transfer_buffer(256).unwrap();
        device
            .async_bulk_in_transfer(
                0x81,
                buffer,
                TIMEOUT,
                Box::new(move |status, _buffer, _received| {
                    tx.send(status).unwrap();
                }),
            )
            .unwrap();
    }
    drop(tx);

    device.try_cancel_all_transfers().unwrap();

    let mut fired = 0;
    while let Ok(status) = rx.recv_timeout(Duration::from_secs(5)) {
        assert!(!status.is_completed());
        fired += 1;
    }
    assert_eq!(fired, 4);
}

#[test]
fn async_completion_returns_queued_data() {
    let device = FakeUsbDevice::new();
    let buffer = device.allocate_transfer_buffer(64).unwrap();
    let (tx, rx) = mpsc::channel();

    device
        .async_bulk_in_transfer(
            0x81,
            buffer,
            TIMEOUT,
            Box::new(move |status, buffer, received| {
                tx.send((status, buffer[..received].to_vec())).unwrap();
            }),
        )
        .unwrap();

    device.queue_in_data(0x81, vec![9, 8, 7]);

    let (status, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(status, TransferStatus::Completed);
    assert_eq!(data, vec![9, 8, 7]);
}

#[test]
fn close_waits_for_outstanding_callbacks_and_is_idempotent() {
    let device = FakeUsbDevice::new();
    let buffer = device.allocate_transfer_buffer(128).unwrap();
    let (tx, rx) = mpsc::channel();

    device
        .async_bulk_in_transfer(
            0x81,
            buffer,
            Duration::from_secs(30),
            Box::new(move |status, _buffer, _received| {
                tx.send(status).unwrap();
            }),
        )
        .unwrap();

    device.close().unwrap();

    // The callback must already have fired by the time close returned.
    let status = rx.try_recv().expect("callback did not fire before close returned");
    assert_eq!(status, TransferStatus::Cancelled);

    device.close().unwrap();

    let mut buffer = [0u8; 4];
    assert!(matches!(
        device.bulk_in_transfer(0x81, &mut buffer, TIMEOUT),
        Err(BeagleError::NotOpen)
    ));
}

#[test]
fn async_submission_after_close_is_rejected_without_callback() {
    let device = FakeUsbDevice::new();
    device.close().unwrap();

    let buffer = beagle_driver::TransferBuffer::from(vec![0u8; 16]);
    let (tx, rx) = mpsc::channel::<TransferStatus>();
    let result = device.async_bulk_in_transfer(
        0x81,
        buffer,
        TIMEOUT,
        Box::new(move |status, _buffer, _received| {
            tx.send(status).unwrap();
        }),
    );
    assert!(matches!(result, Err(BeagleError::NotOpen)));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}
