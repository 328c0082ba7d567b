//! End-to-end register path: reset sequencing and interrupt management over
//! the USB vendor control plane, against the emulated device.
//!
//! Exercises the full stack the way an application drives it:
//! `BeagleTopLevelHandler` → `UsbRegisters` → `MlCommands` →
//! `StandardCommands` → transfer primitives.

use std::sync::Arc;
use std::time::Duration;

use beagle_chip::{csr, ChipConfig, ChipVariant};
use beagle_driver::{
    BeagleTopLevelHandler, BeagleTopLevelInterruptManager, DriverOptions, FakeUsbDevice,
    MlCommands, Performance, Registers, ResetState, StandardCommands, StreamTag, TopLevelInterrupt,
    UsbDeviceInterface, UsbRegisters,
};

fn registers_over(device: &FakeUsbDevice) -> Arc<UsbRegisters> {
    let commands = StandardCommands::new(
        Arc::new(device.clone()) as Arc<dyn UsbDeviceInterface>,
        Duration::from_millis(1000),
    );
    let ml = Arc::new(MlCommands::new(commands, DriverOptions::default()));
    Arc::new(UsbRegisters::new(ml))
}

#[test]
fn csr_access_round_trips_through_vendor_control_transfers() {
    let device = FakeUsbDevice::new();
    let registers = registers_over(&device);

    registers.write(csr::SCU_CTRL_0, 0x1122_3344_5566_7788).unwrap();
    assert_eq!(device.register_value(csr::SCU_CTRL_0), 0x1122_3344_5566_7788);
    assert_eq!(registers.read(csr::SCU_CTRL_0).unwrap(), 0x1122_3344_5566_7788);

    registers.write32(csr::OMC0_D4, 0xCAFE_F00D).unwrap();
    assert_eq!(registers.read32(csr::OMC0_D4).unwrap(), 0xCAFE_F00D);
}

#[test]
fn reset_sequence_runs_over_usb() {
    let device = FakeUsbDevice::new();
    let registers = registers_over(&device);
    let config = ChipConfig::for_variant(ChipVariant::Beagle);

    let handler =
        BeagleTopLevelHandler::new(registers as Arc<dyn Registers>, &config).unwrap();
    handler.open(Performance::Medium).unwrap();
    handler.quit_reset().unwrap();
    assert_eq!(handler.reset_state(), ResetState::Running);

    // The bring-up writes landed in the emulated CSR map.
    assert_eq!(
        device.register_value(csr::SCU_CTRL_3),
        u64::from(beagle_chip::csr::scu::CTRL_3_CLOCK_HALF)
    );
    assert_eq!(
        device.register_value(csr::SCU_CTRL_2),
        u64::from(beagle_chip::csr::scu::CTRL_2_RUN)
    );
    assert_eq!(device.register_value(csr::USB_TOP_INT_CONTROL), 0x80);

    handler.enable_reset().unwrap();
    assert_eq!(handler.reset_state(), ResetState::ResetHeld);
}

#[test]
fn interrupt_manager_acks_sources_over_usb() {
    let device = FakeUsbDevice::new();
    let registers = registers_over(&device);
    let config = ChipConfig::for_variant(ChipVariant::Beagle);

    let manager =
        BeagleTopLevelInterruptManager::new(registers as Arc<dyn Registers>, &config).unwrap();
    manager.enable_interrupts().unwrap();
    assert_eq!(device.register_value(csr::MBIST_INT_CONTROL), 1);

    // Pretend the MBIST interrupt fired, then ack it: W0C write of 0.
    device.set_register(csr::MBIST_INT_STATUS, 1);
    manager.handle_interrupt(TopLevelInterrupt::Mbist).unwrap();
    assert_eq!(device.register_value(csr::MBIST_INT_STATUS), 0);

    manager.disable_interrupts().unwrap();
    assert_eq!(device.register_value(csr::MBIST_INT_CONTROL), 0);
}

#[test]
fn streams_carry_software_hints_in_single_endpoint_mode() {
    let device = FakeUsbDevice::new();
    let commands = StandardCommands::new(
        Arc::new(device.clone()) as Arc<dyn UsbDeviceInterface>,
        Duration::from_millis(1000),
    );
    let ml = MlCommands::new(commands, DriverOptions::default());

    let payload = vec![0x11u8; 100];
    ml.send_stream(StreamTag::Parameters, &payload).unwrap();

    let log = device.bulk_out_log(0x01);
    assert_eq!(log.len(), 1);
    let packet = &log[0];
    // 8-byte hint header: tag, padding, little-endian length.
    assert_eq!(packet[0], StreamTag::Parameters as u8);
    assert_eq!(&packet[4..8], &100u32.to_le_bytes());
    assert_eq!(&packet[8..], &payload[..]);
}

#[test]
fn output_reads_use_the_multiplexed_endpoint() {
    let device = FakeUsbDevice::new();
    let commands = StandardCommands::new(
        Arc::new(device.clone()) as Arc<dyn UsbDeviceInterface>,
        Duration::from_millis(1000),
    );
    let ml = MlCommands::new(commands, DriverOptions::default());

    device.queue_in_data(0x81, vec![7u8; 32]);
    let mut buffer = [0u8; 256];
    let received = ml.read_output(&mut buffer).unwrap();
    assert_eq!(received, 32);

    device.queue_in_data(0x82, vec![0x03, 0, 0, 0, 9, 9, 9, 9, 0, 0, 0, 0, 0, 0, 0, 0]);
    let event = ml.read_event().unwrap();
    assert_eq!(event.pending_sources, 3);
}
