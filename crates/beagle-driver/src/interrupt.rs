//! Interrupt controller abstraction.
//!
//! One controller owns one control/status CSR pair. The status register is
//! write-0-to-clear: writing 1 to a bit leaves it untouched, writing 0
//! clears it, so a clear must write all live bits as 1 except the target.
//! Controllers bound to the invalid-offset sentinel succeed as no-ops —
//! absence of hardware support is not a failure.

use std::sync::{Arc, Mutex};

use beagle_chip::{InterruptCsrOffsets, CSR_OFFSET_INVALID};

use crate::error::{BeagleError, Result};
use crate::registers::Registers;

/// Enable/disable/clear operations for one interrupt group.
pub trait InterruptControllerInterface: Send + Sync + std::fmt::Debug {
    /// Unmask all interrupts in the group. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the register write fails.
    fn enable_interrupts(&self) -> Result<()>;

    /// Mask all interrupts in the group. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the register write fails.
    fn disable_interrupts(&self) -> Result<()>;

    /// Acknowledge one pending interrupt, leaving sibling bits untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is out of range or the write fails.
    fn clear_interrupt_status(&self, id: u32) -> Result<()>;

    /// Number of interrupt sources in the group.
    fn num_interrupts(&self) -> u32;
}

/// Controller for one CSR-backed interrupt group.
#[derive(Debug)]
pub struct InterruptController {
    registers: Arc<dyn Registers>,
    offsets: InterruptCsrOffsets,
    num_interrupts: u32,
    enabled: Mutex<bool>,
}

impl InterruptController {
    /// Bind a controller to a CSR offset pair.
    #[must_use]
    pub fn new(
        registers: Arc<dyn Registers>,
        offsets: InterruptCsrOffsets,
        num_interrupts: u32,
    ) -> Self {
        debug_assert!(num_interrupts >= 1 && num_interrupts <= 64);
        Self {
            registers,
            offsets,
            num_interrupts,
            enabled: Mutex::new(false),
        }
    }

    /// Whether interrupts are currently enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().expect("interrupt state poisoned")
    }

    fn live_mask(&self) -> u64 {
        if self.num_interrupts == 64 {
            u64::MAX
        } else {
            (1u64 << self.num_interrupts) - 1
        }
    }
}

impl InterruptControllerInterface for InterruptController {
    fn enable_interrupts(&self) -> Result<()> {
        let mut enabled = self.enabled.lock().expect("interrupt state poisoned");
        if *enabled {
            return Ok(());
        }
        if self.offsets.control != CSR_OFFSET_INVALID {
            self.registers.write(self.offsets.control, self.live_mask())?;
        }
        *enabled = true;
        Ok(())
    }

    fn disable_interrupts(&self) -> Result<()> {
        let mut enabled = self.enabled.lock().expect("interrupt state poisoned");
        if !*enabled {
            return Ok(());
        }
        if self.offsets.control != CSR_OFFSET_INVALID {
            self.registers.write(self.offsets.control, 0)?;
        }
        *enabled = false;
        Ok(())
    }

    fn clear_interrupt_status(&self, id: u32) -> Result<()> {
        if id >= self.num_interrupts {
            return Err(BeagleError::invalid_state(format!(
                "interrupt id {id} out of range (group has {})",
                self.num_interrupts
            )));
        }
        if self.offsets.status == CSR_OFFSET_INVALID {
            return Ok(());
        }
        // W0C: every live bit held at 1 except the one being cleared.
        let value = self.live_mask() & !(1u64 << id);
        self.registers.write(self.offsets.status, value)
    }

    fn num_interrupts(&self) -> u32 {
        self.num_interrupts
    }
}

/// N child controllers behind one interface.
///
/// Enable/disable fan out to every child; the first failure aborts and is
/// returned as-is, with already-enabled children left enabled. Whether that
/// partial enablement should be rolled back is a known open tradeoff — the
/// behavior here is fail-fast, with the caller free to retry for full
/// coverage.
#[derive(Debug, Default)]
pub struct GroupedInterruptController {
    children: Vec<Box<dyn InterruptControllerInterface>>,
}

impl GroupedInterruptController {
    /// Compose a group from child controllers.
    #[must_use]
    pub fn new(children: Vec<Box<dyn InterruptControllerInterface>>) -> Self {
        Self { children }
    }

    /// Resolve a group-wide id to `(child, local id)`. Children own
    /// consecutive id ranges in composition order.
    fn resolve(&self, id: u32) -> Result<(&dyn InterruptControllerInterface, u32)> {
        let mut base = 0;
        for child in &self.children {
            let count = child.num_interrupts();
            if id < base + count {
                return Ok((child.as_ref(), id - base));
            }
            base += count;
        }
        Err(BeagleError::invalid_state(format!(
            "interrupt id {id} out of range (group has {base})"
        )))
    }
}

impl InterruptControllerInterface for GroupedInterruptController {
    fn enable_interrupts(&self) -> Result<()> {
        for child in &self.children {
            child.enable_interrupts()?;
        }
        Ok(())
    }

    fn disable_interrupts(&self) -> Result<()> {
        for child in &self.children {
            child.disable_interrupts()?;
        }
        Ok(())
    }

    fn clear_interrupt_status(&self, id: u32) -> Result<()> {
        let (child, local) = self.resolve(id)?;
        child.clear_interrupt_status(local)
    }

    fn num_interrupts(&self) -> u32 {
        self.children.iter().map(|c| c.num_interrupts()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Registers mock that records every write.
    #[derive(Debug, Default)]
    struct RecordingRegisters {
        values: Mutex<HashMap<u64, u64>>,
        writes: Mutex<Vec<(u64, u64)>>,
        fail_writes: Mutex<bool>,
    }

    impl RecordingRegisters {
        fn value(&self, offset: u64) -> u64 {
            self.values.lock().unwrap().get(&offset).copied().unwrap_or(0)
        }

        fn write_log(&self) -> Vec<(u64, u64)> {
            self.writes.lock().unwrap().clone()
        }

        fn fail_all_writes(&self) {
            *self.fail_writes.lock().unwrap() = true;
        }
    }

    impl Registers for RecordingRegisters {
        fn read(&self, offset: u64) -> Result<u64> {
            Ok(self.value(offset))
        }

        fn write(&self, offset: u64, value: u64) -> Result<()> {
            if *self.fail_writes.lock().unwrap() {
                return Err(BeagleError::Disconnected);
            }
            self.values.lock().unwrap().insert(offset, value);
            self.writes.lock().unwrap().push((offset, value));
            Ok(())
        }

        fn read32(&self, offset: u64) -> Result<u32> {
            Ok(self.value(offset) as u32)
        }

        fn write32(&self, offset: u64, value: u32) -> Result<()> {
            self.write(offset, u64::from(value))
        }
    }

    const OFFSETS: InterruptCsrOffsets = InterruptCsrOffsets {
        control: 0x100,
        status: 0x108,
    };

    #[test]
    fn enable_then_disable_leaves_control_zero() {
        let regs = Arc::new(RecordingRegisters::default());
        let ctl = InterruptController::new(regs.clone(), OFFSETS, 4);
        ctl.enable_interrupts().unwrap();
        assert_eq!(regs.value(0x100), 0b1111);
        assert!(ctl.is_enabled());
        ctl.disable_interrupts().unwrap();
        assert_eq!(regs.value(0x100), 0);
        assert!(!ctl.is_enabled());
    }

    #[test]
    fn enable_is_idempotent() {
        let regs = Arc::new(RecordingRegisters::default());
        let ctl = InterruptController::new(regs.clone(), OFFSETS, 4);
        ctl.enable_interrupts().unwrap();
        ctl.enable_interrupts().unwrap();
        assert_eq!(regs.write_log().len(), 1);
    }

    #[test]
    fn clear_touches_only_the_target_bit() {
        let regs = Arc::new(RecordingRegisters::default());
        let ctl = InterruptController::new(regs.clone(), OFFSETS, 8);
        ctl.clear_interrupt_status(3).unwrap();
        let value = regs.value(0x108);
        let all_ones = 0xFF;
        assert_eq!(value | (1 << 3), all_ones);
        assert_eq!(value & (1 << 3), 0);
    }

    #[test]
    fn clear_out_of_range_is_rejected() {
        let regs = Arc::new(RecordingRegisters::default());
        let ctl = InterruptController::new(regs.clone(), OFFSETS, 4);
        assert!(ctl.clear_interrupt_status(4).is_err());
        assert!(regs.write_log().is_empty());
    }

    #[test]
    fn sentinel_offsets_are_noop_success() {
        let regs = Arc::new(RecordingRegisters::default());
        let ctl = InterruptController::new(
            regs.clone(),
            InterruptCsrOffsets {
                control: CSR_OFFSET_INVALID,
                status: CSR_OFFSET_INVALID,
            },
            4,
        );
        ctl.enable_interrupts().unwrap();
        ctl.clear_interrupt_status(2).unwrap();
        ctl.disable_interrupts().unwrap();
        assert!(regs.write_log().is_empty());
    }

    #[test]
    fn grouped_dispatch_routes_to_one_child() {
        let regs = Arc::new(RecordingRegisters::default());
        let a = InterruptController::new(
            regs.clone(),
            InterruptCsrOffsets {
                control: 0x100,
                status: 0x108,
            },
            2,
        );
        let b = InterruptController::new(
            regs.clone(),
            InterruptCsrOffsets {
                control: 0x200,
                status: 0x208,
            },
            3,
        );
        let group = GroupedInterruptController::new(vec![Box::new(a), Box::new(b)]);
        assert_eq!(group.num_interrupts(), 5);

        // Global id 3 is local id 1 of the second child.
        group.clear_interrupt_status(3).unwrap();
        assert_eq!(regs.write_log(), vec![(0x208, 0b101)]);
        assert!(group.clear_interrupt_status(5).is_err());
    }

    #[test]
    fn grouped_enable_stops_at_first_failure() {
        let regs = Arc::new(RecordingRegisters::default());
        let a = InterruptController::new(regs.clone(), OFFSETS, 2);
        let b = InterruptController::new(
            regs.clone(),
            InterruptCsrOffsets {
                control: 0x200,
                status: 0x208,
            },
            2,
        );
        let group = GroupedInterruptController::new(vec![Box::new(a), Box::new(b)]);

        regs.fail_all_writes();
        assert!(group.enable_interrupts().is_err());
        // Fail-fast: nothing written, nothing rolled back.
        assert!(regs.write_log().is_empty());
    }
}
