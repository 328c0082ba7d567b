//! DFU protocol state machine against the emulated device.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use beagle_driver::usb::fake::FAKE_DFU_TRANSFER_SIZE;
use beagle_driver::{
    find_dfu_interfaces, BeagleError, DfuCommands, DfuState, DfuStatusCode, FakeUsbDevice,
    StandardCommands, UsbDeviceInterface,
};

const TIMEOUT: Duration = Duration::from_millis(1000);

fn dfu_setup(device: &FakeUsbDevice) -> (DfuCommands, beagle_driver::DfuFunctionalDescriptor) {
    let commands = StandardCommands::new(
        Arc::new(device.clone()) as Arc<dyn UsbDeviceInterface>,
        TIMEOUT,
    );

    let config = commands.get_configuration_descriptor(0, 4096).unwrap();
    let interfaces = find_dfu_interfaces(&config).unwrap();
    assert_eq!(interfaces.len(), 1);
    let functional = interfaces[0].functional;
    assert_eq!(functional.transfer_size, FAKE_DFU_TRANSFER_SIZE);
    assert!(functional.can_download());
    assert!(functional.can_upload());

    commands.claim_interface(interfaces[0].interface_number).unwrap();
    let dfu = DfuCommands::new(commands);
    dfu.set_dfu_interface(interfaces[0].interface_number);
    (dfu, functional)
}

#[test]
fn update_firmware_issues_expected_blocks_and_manifests() {
    let device = FakeUsbDevice::new();
    let (dfu, functional) = dfu_setup(&device);

    // 64 KiB at 2048 bytes per block: exactly 32 data blocks plus the
    // zero-length terminator.
    let image = Bytes::from(vec![0xC3u8; 64 * 1024]);
    dfu.update_firmware(&functional, &image).unwrap();

    assert_eq!(device.dfu_blocks_received(), 32);
    assert_eq!(device.dfu_storage(), image.to_vec());
    assert_eq!(device.dfu_state(), DfuState::ManifestWaitReset);
}

#[test]
fn update_firmware_handles_partial_final_block() {
    let device = FakeUsbDevice::new();
    let (dfu, functional) = dfu_setup(&device);

    let image = Bytes::from((0..5000u32).map(|i| i as u8).collect::<Vec<u8>>());
    dfu.update_firmware(&functional, &image).unwrap();

    assert_eq!(device.dfu_blocks_received(), 3);
    assert_eq!(device.dfu_storage(), image.to_vec());
}

#[test]
fn download_then_upload_round_trips() {
    let device = FakeUsbDevice::new();
    let (dfu, _functional) = dfu_setup(&device);

    let block = vec![0xA5u8; usize::from(FAKE_DFU_TRANSFER_SIZE)];
    dfu.dfu_download_block(0, &block).unwrap();
    // Poll through DownloadSync/Busy to DownloadIdle.
    loop {
        let status = dfu.dfu_get_status().unwrap();
        match status.state {
            DfuState::DownloadBusy => {
                std::thread::sleep(Duration::from_millis(u64::from(status.poll_timeout_ms)));
            }
            DfuState::DownloadIdle => break,
            other => panic!("unexpected state {other:?}"),
        }
    }
    dfu.dfu_abort().unwrap();
    assert_eq!(dfu.dfu_get_state().unwrap(), DfuState::DfuIdle);

    let mut read_back = vec![0u8; usize::from(FAKE_DFU_TRANSFER_SIZE)];
    let received = dfu.dfu_upload_block(0, &mut read_back).unwrap();
    assert_eq!(received, block.len());
    assert_eq!(read_back, block);
}

#[test]
fn validate_firmware_compares_read_back() {
    let device = FakeUsbDevice::new();
    let (dfu, functional) = dfu_setup(&device);

    let image = Bytes::from(vec![0x42u8; 4096]);
    dfu.update_firmware(&functional, &image).unwrap();

    // Simulate the post-manifestation reset that lands the device in DfuIdle.
    device.force_dfu_state(DfuState::DfuIdle, DfuStatusCode::Ok);
    dfu.validate_firmware(&functional, &image).unwrap();

    let tampered = Bytes::from(vec![0x43u8; 4096]);
    let err = dfu.validate_firmware(&functional, &tampered).unwrap_err();
    assert!(matches!(err, BeagleError::FirmwareMismatch { offset: 0 }));
}

#[test]
fn error_state_rejects_commands_without_side_effects() {
    let device = FakeUsbDevice::new();
    let (dfu, functional) = dfu_setup(&device);
    device.force_dfu_state(DfuState::Error, DfuStatusCode::ErrWrite);

    // Download is refused outright, nothing is stored.
    let err = dfu.dfu_download_block(0, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, BeagleError::Stall));
    assert!(device.dfu_storage().is_empty());
    assert_eq!(device.dfu_state(), DfuState::Error);

    // A full update attempt surfaces the device-reported error.
    let err = dfu
        .update_firmware(&functional, &Bytes::from_static(&[0u8; 16]))
        .unwrap_err();
    assert!(matches!(
        err,
        BeagleError::DfuProtocol {
            status: DfuStatusCode::ErrWrite,
            state: DfuState::Error,
        }
    ));
}

#[test]
fn clear_status_is_the_only_way_out_of_error() {
    let device = FakeUsbDevice::new();
    let (dfu, _functional) = dfu_setup(&device);
    device.force_dfu_state(DfuState::Error, DfuStatusCode::ErrProg);

    // Abort does not leave Error.
    assert!(dfu.dfu_abort().is_err());
    assert_eq!(device.dfu_state(), DfuState::Error);

    let status = dfu.dfu_get_status().unwrap();
    assert_eq!(status.state, DfuState::Error);
    assert_eq!(status.status, DfuStatusCode::ErrProg);

    dfu.dfu_clear_status().unwrap();
    assert_eq!(dfu.dfu_get_state().unwrap(), DfuState::DfuIdle);
}

#[test]
fn block_number_mismatch_is_reported_on_next_status_poll() {
    let device = FakeUsbDevice::new();
    let (dfu, _functional) = dfu_setup(&device);

    dfu.dfu_download_block(0, &[0xAA; 64]).unwrap();
    let _ = dfu.dfu_get_status().unwrap(); // Busy
    let _ = dfu.dfu_get_status().unwrap(); // DownloadIdle

    // Skip ahead: the device accepts the transfer but flags the gap.
    dfu.dfu_download_block(5, &[0xBB; 64]).unwrap();
    let status = dfu.dfu_get_status().unwrap();
    assert_eq!(status.state, DfuState::Error);
    assert_eq!(status.status, DfuStatusCode::ErrAddress);
}

#[test]
fn detach_moves_application_device_to_app_detach() {
    let device = FakeUsbDevice::new_application_mode();
    let commands = StandardCommands::new(
        Arc::new(device.clone()) as Arc<dyn UsbDeviceInterface>,
        TIMEOUT,
    );
    let dfu = DfuCommands::new(commands);
    dfu.set_dfu_interface(0);

    assert_eq!(device.dfu_state(), DfuState::AppIdle);
    dfu.dfu_detach(1000).unwrap();
    assert_eq!(device.dfu_state(), DfuState::AppDetach);
}

#[test]
fn commands_require_a_bound_interface() {
    let device = FakeUsbDevice::new();
    let commands = StandardCommands::new(
        Arc::new(device) as Arc<dyn UsbDeviceInterface>,
        TIMEOUT,
    );
    let dfu = DfuCommands::new(commands);
    assert!(matches!(
        dfu.dfu_get_status(),
        Err(BeagleError::InvalidState { .. })
    ));
}
