//! CSR offsets for the registers the USB driver drives.
//!
//! Offsets were recovered from the Beagle USB bring-up trace (vendor control
//! reads/writes observed on a live module) and cross-checked against the
//! register names the runtime prints. Entries carrying a name from that trace
//! are marked `// traced`.
//!
//! The interrupt blocks follow an 8-byte control/status stride, visible in
//! the traced `usbTopInterrupt` pair at `0x4c058`/`0x4c060`.

/// Sentinel for a register the chip variant does not implement.
///
/// Controllers bound to this offset treat enable/disable/clear as no-op
/// successes — absence of hardware support is not a failure.
pub const CSR_OFFSET_INVALID: u64 = u64::MAX;

/// Control/status offset pair for one interrupt group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptCsrOffsets {
    /// Interrupt enable mask register.
    pub control: u64,
    /// Interrupt pending register, write-0-to-clear.
    pub status: u64,
}

// ── SCU (system control unit) ────────────────────────────────────────────────

/// SCU control word 0 — PLL / clock source setup. // traced @ 0x1a30c
pub const SCU_CTRL_0: u64 = 0x0001_A30C;
/// SCU control word 2 — reset hold/release and clock gates. // traced @ 0x1a314
pub const SCU_CTRL_2: u64 = 0x0001_A314;
/// SCU control word 3 — clock divider configuration. // traced @ 0x1a318
pub const SCU_CTRL_3: u64 = 0x0001_A318;
/// SCU counter 7 — tile clock enable mask. // traced @ 0x1a33c
pub const SCU_CTR_7: u64 = 0x0001_A33C;

// ── OMC (on-module controller) ───────────────────────────────────────────────

/// OMC status word. // traced @ 0x1a000
pub const OMC0_DC: u64 = 0x0001_A000;
/// OMC control word D4 — thermal sensor enable. // traced @ 0x1a0d4
pub const OMC0_D4: u64 = 0x0001_A0D4;
/// OMC control word D8 — thermal shutdown arm. // traced @ 0x1a0d8
pub const OMC0_D8: u64 = 0x0001_A0D8;

// ── Bus monitors and BIST ────────────────────────────────────────────────────

/// Slave AXI bus monitor enable. // traced @ 0x1a500
pub const SLV_ABM_EN: u64 = 0x0001_A500;
/// Master AXI bus monitor enable. // traced @ 0x1a600
pub const MST_ABM_EN: u64 = 0x0001_A600;
/// Slave error-response interrupt mask. // traced @ 0x1a558
pub const SLV_ERR_RESP_ISR_MASK: u64 = 0x0001_A558;
/// Master error-response interrupt mask. // traced @ 0x1a658
pub const MST_ERR_RESP_ISR_MASK: u64 = 0x0001_A658;
/// RAM BIST control word 1. // traced @ 0x1a704
pub const RAMBIST_CTRL_1: u64 = 0x0001_A704;

// ── USB top interrupt block ──────────────────────────────────────────────────

/// Aggregate USB interrupt enable. // traced @ 0x4c058
pub const USB_TOP_INT_CONTROL: u64 = 0x0004_C058;
/// Aggregate USB interrupt status (W0C). // traced @ 0x4c060
pub const USB_TOP_INT_STATUS: u64 = 0x0004_C060;
/// Fatal-error interrupt enable. No status register exists for this source;
/// the pending bit is cleared by reset only. // traced @ 0x4c070
pub const USB_FATAL_ERR_INT_CONTROL: u64 = 0x0004_C070;
/// Scalar-core-to-host interrupt enable. // traced @ 0x4c090
pub const USB_SC_HOST_INT_CONTROL: u64 = 0x0004_C090;
/// Scalar-core-to-host interrupt status (W0C). // traced @ 0x4c0a0
pub const USB_SC_HOST_INT_STATUS: u64 = 0x0004_C0A0;

// Per-source words of the top-level block, same 8-byte stride.

/// Thermal warning interrupt enable.
pub const THERMAL_WARNING_INT_CONTROL: u64 = 0x0004_C0A8;
/// Thermal warning interrupt status (W0C).
pub const THERMAL_WARNING_INT_STATUS: u64 = 0x0004_C0B0;
/// Memory BIST completion interrupt enable.
pub const MBIST_INT_CONTROL: u64 = 0x0004_C0B8;
/// Memory BIST completion interrupt status (W0C).
pub const MBIST_INT_STATUS: u64 = 0x0004_C0C0;
/// PCIe error interrupt enable.
pub const PCIE_ERR_INT_CONTROL: u64 = 0x0004_C0C8;
/// PCIe error interrupt status (W0C).
pub const PCIE_ERR_INT_STATUS: u64 = 0x0004_C0D0;
/// Thermal shutdown interrupt enable.
pub const THERMAL_SHUTDOWN_INT_CONTROL: u64 = 0x0004_C0D8;
/// Thermal shutdown interrupt status (W0C).
pub const THERMAL_SHUTDOWN_INT_STATUS: u64 = 0x0004_C0E0;

// ── DMA pause ────────────────────────────────────────────────────────────────

/// DMA pause request set. // traced @ 0x4c148
pub const USB_DMA_PAUSE_SET: u64 = 0x0004_C148;
/// DMA pause request clear. // traced @ 0x4c160
pub const USB_DMA_PAUSE_CLEAR: u64 = 0x0004_C160;

// ── Register values used by the reset sequence ───────────────────────────────
// Word values below are the ones observed in the bring-up trace.

/// SCU control word values.
pub mod scu {
    /// `SCU_CTRL_0` after PLL setup. // traced
    pub const CTRL_0_INIT: u32 = 0x000F_0059;
    /// `SCU_CTRL_2` with reset released and clocks running. // traced
    pub const CTRL_2_RUN: u32 = 0x0015_0000;
    /// `SCU_CTRL_2` with chip-level reset held.
    pub const CTRL_2_RESET_HOLD: u32 = 0x0015_0040;
    /// Software clock gate bit in `SCU_CTRL_2`.
    pub const CTRL_2_SW_CLOCK_GATE: u32 = 1 << 2;
    /// Hardware (idle) clock gate bit in `SCU_CTRL_2`.
    pub const CTRL_2_HW_CLOCK_GATE: u32 = 1 << 3;
    /// `SCU_CTRL_3` divider word, full clock. // traced
    pub const CTRL_3_CLOCK_FULL: u32 = 0x5085_025C;
    /// `SCU_CTRL_3` divider word, half clock.
    pub const CTRL_3_CLOCK_HALF: u32 = 0x5085_065C;
    /// `SCU_CTRL_3` divider word, quarter clock.
    pub const CTRL_3_CLOCK_QUARTER: u32 = 0x5085_0A5C;
    /// `SCU_CTR_7` with all tile clocks enabled. // traced
    pub const CTR_7_TILES_ON: u32 = 0x0000_003F;
}

/// OMC word values.
pub mod omc {
    /// `OMC0_D4` with the thermal sensor enabled. // traced
    pub const D4_SENSOR_ENABLE: u32 = 0x8000_0001;
    /// `OMC0_D8` with thermal shutdown armed. // traced
    pub const D8_SHUTDOWN_ARM: u32 = 0x8000_0000;
}

/// Bus monitor / BIST word values. // traced
pub mod abm {
    /// Bus monitor enable.
    pub const ENABLE: u32 = 0x0000_0001;
    /// Error-response ISR mask (both error classes).
    pub const ERR_RESP_MASK: u32 = 0x0000_0003;
    /// `RAMBIST_CTRL_1` with all banks selected.
    pub const RAMBIST_ALL_BANKS: u32 = 0x0000_007F;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traced_offsets() {
        assert_eq!(SCU_CTRL_0, 0x0001_A30C);
        assert_eq!(USB_TOP_INT_CONTROL, 0x0004_C058);
        assert_eq!(USB_DMA_PAUSE_CLEAR, 0x0004_C160);
    }

    #[test]
    fn interrupt_blocks_follow_stride() {
        assert_eq!(USB_TOP_INT_STATUS - USB_TOP_INT_CONTROL, 8);
        assert_eq!(THERMAL_WARNING_INT_STATUS - THERMAL_WARNING_INT_CONTROL, 8);
        assert_eq!(MBIST_INT_STATUS - MBIST_INT_CONTROL, 8);
    }
}
