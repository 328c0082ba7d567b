//! Top-level reset and interrupt management for Beagle.
//!
//! Wires the chip-wide fault/status sources (thermal warning, MBIST, PCIe
//! error, thermal shutdown) into a grouped controller plus a separate
//! fatal-error controller, and sequences the chip in and out of reset.

use std::sync::{Arc, Mutex};

use beagle_chip::config::{ChipConfig, ResetCsrOffsets, NUM_TOP_LEVEL_INTERRUPTS};
use beagle_chip::csr::{abm, omc, scu};

use crate::error::{BeagleError, Result};
use crate::interrupt::{
    GroupedInterruptController, InterruptController, InterruptControllerInterface,
};
use crate::registers::Registers;

/// Top-level interrupt sources, in grouped-controller id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TopLevelInterrupt {
    /// Die temperature crossed the warning threshold.
    ThermalWarning = 0,
    /// Memory BIST run completed.
    Mbist = 1,
    /// PCIe link error (also present on USB parts).
    PcieError = 2,
    /// Die temperature forced a shutdown.
    ThermalShutdown = 3,
}

/// Aggregate controller for the top-level interrupt sources.
#[derive(Debug)]
pub struct BeagleTopLevelInterruptManager {
    group: GroupedInterruptController,
    fatal: InterruptController,
}

impl BeagleTopLevelInterruptManager {
    /// Build the per-source controllers from the chip configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Unsupported`](BeagleError::Unsupported) if the variant lacks
    /// the top-level or fatal-error interrupt blocks.
    pub fn new(registers: Arc<dyn Registers>, config: &ChipConfig) -> Result<Self> {
        let offsets = config.top_level_interrupt_csr_offsets()?;
        let children: Vec<Box<dyn InterruptControllerInterface>> = offsets
            .iter()
            .map(|pair| {
                Box::new(InterruptController::new(Arc::clone(&registers), *pair, 1))
                    as Box<dyn InterruptControllerInterface>
            })
            .collect();
        debug_assert_eq!(children.len(), NUM_TOP_LEVEL_INTERRUPTS);

        let fatal = InterruptController::new(
            Arc::clone(&registers),
            *config.fatal_error_interrupt_csr_offsets()?,
            1,
        );

        Ok(Self {
            group: GroupedInterruptController::new(children),
            fatal,
        })
    }

    /// Unmask every top-level source and the fatal-error interrupt.
    ///
    /// First failure aborts; already-enabled sources stay enabled (the
    /// caller may retry for full coverage).
    ///
    /// # Errors
    ///
    /// Returns the first register write failure.
    pub fn enable_interrupts(&self) -> Result<()> {
        self.group.enable_interrupts()?;
        self.fatal.enable_interrupts()
    }

    /// Mask every top-level source and the fatal-error interrupt.
    ///
    /// # Errors
    ///
    /// Returns the first register write failure.
    pub fn disable_interrupts(&self) -> Result<()> {
        self.group.disable_interrupts()?;
        self.fatal.disable_interrupts()
    }

    /// Acknowledge one pending top-level source.
    ///
    /// # Errors
    ///
    /// Returns an error if the status write fails.
    pub fn handle_interrupt(&self, source: TopLevelInterrupt) -> Result<()> {
        tracing::debug!("Acking top-level interrupt {source:?}");
        self.group.clear_interrupt_status(source as u32)
    }

    /// Acknowledge the fatal-error interrupt. On Beagle this source has no
    /// status word, so the ack is a recorded no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the status write fails.
    pub fn handle_fatal_error(&self) -> Result<()> {
        tracing::warn!("Fatal error interrupt");
        self.fatal.clear_interrupt_status(0)
    }
}

/// Clock setting applied when opening the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Performance {
    /// Full clock.
    Max,
    /// Full clock, thermal headroom left to the governor.
    High,
    /// Half clock.
    Medium,
    /// Quarter clock.
    Low,
}

impl Performance {
    const fn divider_word(self) -> u32 {
        match self {
            Self::Max | Self::High => scu::CTRL_3_CLOCK_FULL,
            Self::Medium => scu::CTRL_3_CLOCK_HALF,
            Self::Low => scu::CTRL_3_CLOCK_QUARTER,
        }
    }
}

/// Reset sequencing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    /// Hardware state not yet established.
    Unknown,
    /// Clocks configured, chip held in reset.
    ResetHeld,
    /// Reset released, chip running.
    Running,
}

#[derive(Debug)]
struct HandlerState {
    reset: ResetState,
    software_clock_gated: bool,
    hardware_clock_gated: bool,
}

/// Chip reset and clock-gating sequencer.
///
/// Register writes can fail (transport error); on failure the tracked state
/// is left unchanged and the error is surfaced — no implicit retry.
#[derive(Debug)]
pub struct BeagleTopLevelHandler {
    registers: Arc<dyn Registers>,
    offsets: ResetCsrOffsets,
    state: Mutex<HandlerState>,
}

impl BeagleTopLevelHandler {
    /// Build the handler from the chip configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Unsupported`](BeagleError::Unsupported) if the variant lacks
    /// the reset block.
    pub fn new(registers: Arc<dyn Registers>, config: &ChipConfig) -> Result<Self> {
        let offsets = *config.reset_csr_offsets()?;
        Ok(Self {
            registers,
            offsets,
            state: Mutex::new(HandlerState {
                reset: ResetState::Unknown,
                software_clock_gated: false,
                hardware_clock_gated: false,
            }),
        })
    }

    /// Current reset position.
    #[must_use]
    pub fn reset_state(&self) -> ResetState {
        self.state.lock().expect("handler state poisoned").reset
    }

    /// Establish initial hardware state: PLL setup and the clock divider for
    /// the requested performance, with the chip held in reset. Must run
    /// before any reset-control call.
    ///
    /// # Errors
    ///
    /// Returns the register write failure; state stays `Unknown`.
    pub fn open(&self, performance: Performance) -> Result<()> {
        let mut state = self.state.lock().expect("handler state poisoned");

        self.registers.write32(self.offsets.scu_ctrl_0, scu::CTRL_0_INIT)?;
        self.registers
            .write32(self.offsets.scu_ctrl_3, performance.divider_word())?;
        self.registers
            .write32(self.offsets.scu_ctrl_2, scu::CTRL_2_RESET_HOLD)?;

        state.reset = ResetState::ResetHeld;
        state.software_clock_gated = false;
        state.hardware_clock_gated = false;
        tracing::info!("Chip opened at {performance:?}, reset held");
        Ok(())
    }

    /// Release the chip from reset and bring up the run-time blocks:
    /// tile clocks, thermal sensor, RAM BIST, bus monitors, and the
    /// aggregate USB interrupt.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidState`](BeagleError::InvalidState) if `open` has not
    /// run, or the first register write failure (state then stays
    /// `ResetHeld`).
    pub fn quit_reset(&self) -> Result<()> {
        let mut state = self.state.lock().expect("handler state poisoned");
        match state.reset {
            ResetState::Unknown => {
                return Err(BeagleError::invalid_state(
                    "quit_reset before open".to_string(),
                ))
            }
            ResetState::Running => return Ok(()),
            ResetState::ResetHeld => {}
        }

        let regs = &self.registers;
        regs.write32(self.offsets.scu_ctrl_2, scu::CTRL_2_RUN)?;
        regs.write32(self.offsets.scu_ctr_7, scu::CTR_7_TILES_ON)?;
        regs.write32(self.offsets.omc0_d4, omc::D4_SENSOR_ENABLE)?;
        regs.write32(self.offsets.omc0_d8, omc::D8_SHUTDOWN_ARM)?;
        regs.write32(self.offsets.rambist_ctrl_1, abm::RAMBIST_ALL_BANKS)?;
        regs.write32(self.offsets.slv_abm_en, abm::ENABLE)?;
        regs.write32(self.offsets.mst_abm_en, abm::ENABLE)?;
        regs.write32(self.offsets.slv_err_resp_isr_mask, abm::ERR_RESP_MASK)?;
        regs.write32(self.offsets.mst_err_resp_isr_mask, abm::ERR_RESP_MASK)?;
        regs.write(self.offsets.usb_top_int_control, 0x80)?;

        state.reset = ResetState::Running;
        tracing::info!("Chip released from reset");
        Ok(())
    }

    /// Re-assert chip reset (recovery / power-down path).
    ///
    /// # Errors
    ///
    /// Returns the register write failure; state is left unchanged.
    pub fn enable_reset(&self) -> Result<()> {
        let mut state = self.state.lock().expect("handler state poisoned");
        self.registers
            .write32(self.offsets.scu_ctrl_2, scu::CTRL_2_RESET_HOLD)?;
        state.reset = ResetState::ResetHeld;
        tracing::info!("Chip reset asserted");
        Ok(())
    }

    /// Engage the hardware (idle) clock gate. No-op if already gated.
    ///
    /// # Errors
    ///
    /// Returns the register access failure; the gating flag is unchanged.
    pub fn enable_hardware_clock_gate(&self) -> Result<()> {
        let mut state = self.state.lock().expect("handler state poisoned");
        if state.hardware_clock_gated {
            return Ok(());
        }
        self.set_ctrl_2_bit(scu::CTRL_2_HW_CLOCK_GATE, true)?;
        state.hardware_clock_gated = true;
        Ok(())
    }

    /// Release the hardware clock gate. No-op if not gated.
    ///
    /// # Errors
    ///
    /// Returns the register access failure; the gating flag is unchanged.
    pub fn disable_hardware_clock_gate(&self) -> Result<()> {
        let mut state = self.state.lock().expect("handler state poisoned");
        if !state.hardware_clock_gated {
            return Ok(());
        }
        self.set_ctrl_2_bit(scu::CTRL_2_HW_CLOCK_GATE, false)?;
        state.hardware_clock_gated = false;
        Ok(())
    }

    /// Engage the software clock gate. No-op if already gated.
    ///
    /// # Errors
    ///
    /// Returns the register access failure; the gating flag is unchanged.
    pub fn enable_software_clock_gate(&self) -> Result<()> {
        let mut state = self.state.lock().expect("handler state poisoned");
        if state.software_clock_gated {
            return Ok(());
        }
        self.set_ctrl_2_bit(scu::CTRL_2_SW_CLOCK_GATE, true)?;
        state.software_clock_gated = true;
        Ok(())
    }

    /// Release the software clock gate. No-op if not gated.
    ///
    /// # Errors
    ///
    /// Returns the register access failure; the gating flag is unchanged.
    pub fn disable_software_clock_gate(&self) -> Result<()> {
        let mut state = self.state.lock().expect("handler state poisoned");
        if !state.software_clock_gated {
            return Ok(());
        }
        self.set_ctrl_2_bit(scu::CTRL_2_SW_CLOCK_GATE, false)?;
        state.software_clock_gated = false;
        Ok(())
    }

    fn set_ctrl_2_bit(&self, bit: u32, set: bool) -> Result<()> {
        let current = self.registers.read32(self.offsets.scu_ctrl_2)?;
        let next = if set { current | bit } else { current & !bit };
        self.registers.write32(self.offsets.scu_ctrl_2, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beagle_chip::ChipVariant;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct MapRegisters {
        values: Mutex<HashMap<u64, u64>>,
        fail: Mutex<bool>,
    }

    impl MapRegisters {
        fn value(&self, offset: u64) -> u64 {
            self.values.lock().unwrap().get(&offset).copied().unwrap_or(0)
        }

        fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    impl Registers for MapRegisters {
        fn read(&self, offset: u64) -> Result<u64> {
            Ok(self.value(offset))
        }

        fn write(&self, offset: u64, value: u64) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(BeagleError::Disconnected);
            }
            self.values.lock().unwrap().insert(offset, value);
            Ok(())
        }

        fn read32(&self, offset: u64) -> Result<u32> {
            Ok(self.value(offset) as u32)
        }

        fn write32(&self, offset: u64, value: u32) -> Result<()> {
            self.write(offset, u64::from(value))
        }
    }

    fn handler(regs: &Arc<MapRegisters>) -> BeagleTopLevelHandler {
        let config = ChipConfig::for_variant(ChipVariant::Beagle);
        BeagleTopLevelHandler::new(Arc::clone(regs) as Arc<dyn Registers>, &config).unwrap()
    }

    #[test]
    fn open_then_quit_reset() {
        let regs = Arc::new(MapRegisters::default());
        let handler = handler(&regs);

        assert_eq!(handler.reset_state(), ResetState::Unknown);
        handler.open(Performance::Max).unwrap();
        assert_eq!(handler.reset_state(), ResetState::ResetHeld);
        assert_eq!(
            regs.value(beagle_chip::csr::SCU_CTRL_3),
            u64::from(scu::CTRL_3_CLOCK_FULL)
        );

        handler.quit_reset().unwrap();
        assert_eq!(handler.reset_state(), ResetState::Running);
        assert_eq!(
            regs.value(beagle_chip::csr::SCU_CTRL_2),
            u64::from(scu::CTRL_2_RUN)
        );
        assert_eq!(regs.value(beagle_chip::csr::USB_TOP_INT_CONTROL), 0x80);
    }

    #[test]
    fn quit_reset_requires_open() {
        let regs = Arc::new(MapRegisters::default());
        let handler = handler(&regs);
        assert!(matches!(
            handler.quit_reset(),
            Err(BeagleError::InvalidState { .. })
        ));
    }

    #[test]
    fn write_failure_leaves_state_unchanged() {
        let regs = Arc::new(MapRegisters::default());
        let handler = handler(&regs);
        handler.open(Performance::Low).unwrap();

        regs.set_fail(true);
        assert!(handler.quit_reset().is_err());
        assert_eq!(handler.reset_state(), ResetState::ResetHeld);
    }

    #[test]
    fn clock_gate_is_a_benign_noop_when_already_set() {
        let regs = Arc::new(MapRegisters::default());
        let handler = handler(&regs);
        handler.open(Performance::Max).unwrap();
        handler.quit_reset().unwrap();

        handler.enable_hardware_clock_gate().unwrap();
        let gated = regs.value(beagle_chip::csr::SCU_CTRL_2);
        assert_ne!(gated & u64::from(scu::CTRL_2_HW_CLOCK_GATE), 0);

        // Second enable must not touch the register.
        regs.set_fail(true);
        handler.enable_hardware_clock_gate().unwrap();
        regs.set_fail(false);

        handler.disable_hardware_clock_gate().unwrap();
        assert_eq!(
            regs.value(beagle_chip::csr::SCU_CTRL_2) & u64::from(scu::CTRL_2_HW_CLOCK_GATE),
            0
        );
    }

    #[test]
    fn interrupt_manager_enables_all_sources() {
        let regs = Arc::new(MapRegisters::default());
        let config = ChipConfig::for_variant(ChipVariant::Beagle);
        let manager =
            BeagleTopLevelInterruptManager::new(Arc::clone(&regs) as Arc<dyn Registers>, &config)
                .unwrap();

        manager.enable_interrupts().unwrap();
        assert_eq!(regs.value(beagle_chip::csr::THERMAL_WARNING_INT_CONTROL), 1);
        assert_eq!(regs.value(beagle_chip::csr::MBIST_INT_CONTROL), 1);
        assert_eq!(regs.value(beagle_chip::csr::PCIE_ERR_INT_CONTROL), 1);
        assert_eq!(regs.value(beagle_chip::csr::THERMAL_SHUTDOWN_INT_CONTROL), 1);
        assert_eq!(regs.value(beagle_chip::csr::USB_FATAL_ERR_INT_CONTROL), 1);

        // Single-source group: the W0C clear writes 0.
        manager
            .handle_interrupt(TopLevelInterrupt::PcieError)
            .unwrap();
        assert_eq!(regs.value(beagle_chip::csr::PCIE_ERR_INT_STATUS), 0);

        // Fatal error has no status word; the ack must still succeed.
        manager.handle_fatal_error().unwrap();

        manager.disable_interrupts().unwrap();
        assert_eq!(regs.value(beagle_chip::csr::THERMAL_WARNING_INT_CONTROL), 0);
    }

    #[test]
    fn unknown_variant_is_unsupported() {
        let regs = Arc::new(MapRegisters::default());
        let config = ChipConfig::for_variant(ChipVariant::Unknown(0x1234));
        assert!(matches!(
            BeagleTopLevelInterruptManager::new(Arc::clone(&regs) as Arc<dyn Registers>, &config),
            Err(BeagleError::Unsupported { .. })
        ));
    }
}
