//! Per-variant chip configuration table.
//!
//! Each chip variant is a record of the CSR offset groups it implements,
//! plus an explicit supported-accessor set. An accessor a variant does not
//! implement returns a typed [`ConfigError::Unsupported`] — callers that
//! know a variant must support a group can still `?`-propagate or assert,
//! but absence is never a process-terminating condition here.

use thiserror::Error;

use crate::csr::{self, InterruptCsrOffsets, CSR_OFFSET_INVALID};
use crate::usb_ids::ChipVariant;

/// Number of top-level interrupt sources (thermal warning, MBIST,
/// PCIe error, thermal shutdown).
pub const NUM_TOP_LEVEL_INTERRUPTS: usize = 4;

/// Errors from chip configuration lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The variant does not implement the requested register group.
    #[error("{accessor:?} is not supported on {variant:?}")]
    Unsupported {
        /// Accessor that was requested.
        accessor: Accessor,
        /// Variant the lookup ran against.
        variant: ChipVariant,
    },
}

/// Register groups a variant may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    /// Per-source top-level interrupt offset pairs.
    TopLevelInterrupts,
    /// Fatal-error interrupt offsets.
    FatalErrorInterrupt,
    /// Scalar-core-to-host interrupt offsets (per context).
    ScHostInterrupt,
    /// Reset / clock sequencing registers.
    Reset,
    /// DMA pause set/clear registers.
    DmaPause,
}

/// Reset and clock sequencing register offsets.
#[derive(Debug, Clone, Copy)]
pub struct ResetCsrOffsets {
    /// PLL / clock source setup word.
    pub scu_ctrl_0: u64,
    /// Reset hold/release and clock gate word.
    pub scu_ctrl_2: u64,
    /// Clock divider word.
    pub scu_ctrl_3: u64,
    /// Tile clock enable mask.
    pub scu_ctr_7: u64,
    /// Thermal sensor enable.
    pub omc0_d4: u64,
    /// Thermal shutdown arm.
    pub omc0_d8: u64,
    /// RAM BIST control.
    pub rambist_ctrl_1: u64,
    /// Slave bus monitor enable.
    pub slv_abm_en: u64,
    /// Master bus monitor enable.
    pub mst_abm_en: u64,
    /// Slave error-response ISR mask.
    pub slv_err_resp_isr_mask: u64,
    /// Master error-response ISR mask.
    pub mst_err_resp_isr_mask: u64,
    /// Aggregate USB interrupt enable.
    pub usb_top_int_control: u64,
}

/// DMA pause register offsets.
#[derive(Debug, Clone, Copy)]
pub struct DmaPauseCsrOffsets {
    /// Pause request set.
    pub set: u64,
    /// Pause request clear.
    pub clear: u64,
}

/// Immutable per-variant configuration record.
#[derive(Debug, Clone)]
pub struct ChipConfig {
    variant: ChipVariant,
    top_level_interrupts: Option<[InterruptCsrOffsets; NUM_TOP_LEVEL_INTERRUPTS]>,
    fatal_error_interrupt: Option<InterruptCsrOffsets>,
    sc_host_interrupt: Option<InterruptCsrOffsets>,
    reset: Option<ResetCsrOffsets>,
    dma_pause: Option<DmaPauseCsrOffsets>,
}

impl ChipConfig {
    /// Number of register contexts Beagle implements.
    pub const NUM_CONTEXTS: usize = 1;

    /// Build the configuration record for a variant.
    #[must_use]
    pub fn for_variant(variant: ChipVariant) -> Self {
        match variant {
            ChipVariant::Beagle => Self::beagle(),
            ChipVariant::Unknown(_) => Self {
                variant,
                top_level_interrupts: None,
                fatal_error_interrupt: None,
                sc_host_interrupt: None,
                reset: None,
                dma_pause: None,
            },
        }
    }

    fn beagle() -> Self {
        Self {
            variant: ChipVariant::Beagle,
            top_level_interrupts: Some([
                InterruptCsrOffsets {
                    control: csr::THERMAL_WARNING_INT_CONTROL,
                    status: csr::THERMAL_WARNING_INT_STATUS,
                },
                InterruptCsrOffsets {
                    control: csr::MBIST_INT_CONTROL,
                    status: csr::MBIST_INT_STATUS,
                },
                InterruptCsrOffsets {
                    control: csr::PCIE_ERR_INT_CONTROL,
                    status: csr::PCIE_ERR_INT_STATUS,
                },
                InterruptCsrOffsets {
                    control: csr::THERMAL_SHUTDOWN_INT_CONTROL,
                    status: csr::THERMAL_SHUTDOWN_INT_STATUS,
                },
            ]),
            // Fatal error has an enable but no status word on Beagle.
            fatal_error_interrupt: Some(InterruptCsrOffsets {
                control: csr::USB_FATAL_ERR_INT_CONTROL,
                status: CSR_OFFSET_INVALID,
            }),
            sc_host_interrupt: Some(InterruptCsrOffsets {
                control: csr::USB_SC_HOST_INT_CONTROL,
                status: csr::USB_SC_HOST_INT_STATUS,
            }),
            reset: Some(ResetCsrOffsets {
                scu_ctrl_0: csr::SCU_CTRL_0,
                scu_ctrl_2: csr::SCU_CTRL_2,
                scu_ctrl_3: csr::SCU_CTRL_3,
                scu_ctr_7: csr::SCU_CTR_7,
                omc0_d4: csr::OMC0_D4,
                omc0_d8: csr::OMC0_D8,
                rambist_ctrl_1: csr::RAMBIST_CTRL_1,
                slv_abm_en: csr::SLV_ABM_EN,
                mst_abm_en: csr::MST_ABM_EN,
                slv_err_resp_isr_mask: csr::SLV_ERR_RESP_ISR_MASK,
                mst_err_resp_isr_mask: csr::MST_ERR_RESP_ISR_MASK,
                usb_top_int_control: csr::USB_TOP_INT_CONTROL,
            }),
            dma_pause: Some(DmaPauseCsrOffsets {
                set: csr::USB_DMA_PAUSE_SET,
                clear: csr::USB_DMA_PAUSE_CLEAR,
            }),
        }
    }

    /// Variant this record describes.
    #[must_use]
    pub const fn variant(&self) -> ChipVariant {
        self.variant
    }

    /// Whether the variant implements a register group.
    #[must_use]
    pub const fn supports(&self, accessor: Accessor) -> bool {
        match accessor {
            Accessor::TopLevelInterrupts => self.top_level_interrupts.is_some(),
            Accessor::FatalErrorInterrupt => self.fatal_error_interrupt.is_some(),
            Accessor::ScHostInterrupt => self.sc_host_interrupt.is_some(),
            Accessor::Reset => self.reset.is_some(),
            Accessor::DmaPause => self.dma_pause.is_some(),
        }
    }

    /// Per-source top-level interrupt offsets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unsupported`] if the variant has no top-level
    /// interrupt block.
    pub fn top_level_interrupt_csr_offsets(
        &self,
    ) -> Result<&[InterruptCsrOffsets; NUM_TOP_LEVEL_INTERRUPTS], ConfigError> {
        self.top_level_interrupts
            .as_ref()
            .ok_or_else(|| self.unsupported(Accessor::TopLevelInterrupts))
    }

    /// Fatal-error interrupt offsets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unsupported`] if the variant has no fatal-error
    /// interrupt.
    pub fn fatal_error_interrupt_csr_offsets(&self) -> Result<&InterruptCsrOffsets, ConfigError> {
        self.fatal_error_interrupt
            .as_ref()
            .ok_or_else(|| self.unsupported(Accessor::FatalErrorInterrupt))
    }

    /// Scalar-core-to-host interrupt offsets for one context.
    ///
    /// Beagle implements exactly one context; any other id is a programming
    /// mistake, not a runtime condition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unsupported`] if the variant has no
    /// scalar-core-to-host interrupt.
    ///
    /// # Panics
    ///
    /// Panics if `context` is not 0.
    pub fn sc_host_interrupt_csr_offsets(
        &self,
        context: usize,
    ) -> Result<&InterruptCsrOffsets, ConfigError> {
        assert!(
            context < Self::NUM_CONTEXTS,
            "Beagle implements a single register context, got context {context}"
        );
        self.sc_host_interrupt
            .as_ref()
            .ok_or_else(|| self.unsupported(Accessor::ScHostInterrupt))
    }

    /// Reset / clock sequencing offsets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unsupported`] if the variant has no reset block.
    pub fn reset_csr_offsets(&self) -> Result<&ResetCsrOffsets, ConfigError> {
        self.reset.as_ref().ok_or_else(|| self.unsupported(Accessor::Reset))
    }

    /// DMA pause offsets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unsupported`] if the variant has no DMA pause
    /// registers.
    pub fn dma_pause_csr_offsets(&self) -> Result<&DmaPauseCsrOffsets, ConfigError> {
        self.dma_pause
            .as_ref()
            .ok_or_else(|| self.unsupported(Accessor::DmaPause))
    }

    const fn unsupported(&self, accessor: Accessor) -> ConfigError {
        ConfigError::Unsupported {
            accessor,
            variant: self.variant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beagle_supports_all_groups() {
        let config = ChipConfig::for_variant(ChipVariant::Beagle);
        assert!(config.supports(Accessor::TopLevelInterrupts));
        assert!(config.supports(Accessor::Reset));
        assert!(config.top_level_interrupt_csr_offsets().is_ok());
        assert!(config.dma_pause_csr_offsets().is_ok());
    }

    #[test]
    fn unknown_variant_yields_typed_error() {
        let config = ChipConfig::for_variant(ChipVariant::Unknown(0xBEEF));
        let err = config.reset_csr_offsets().unwrap_err();
        assert_eq!(
            err,
            ConfigError::Unsupported {
                accessor: Accessor::Reset,
                variant: ChipVariant::Unknown(0xBEEF),
            }
        );
    }

    #[test]
    fn fatal_error_status_is_sentinel() {
        let config = ChipConfig::for_variant(ChipVariant::Beagle);
        let offsets = config.fatal_error_interrupt_csr_offsets().unwrap();
        assert_eq!(offsets.status, CSR_OFFSET_INVALID);
        assert_ne!(offsets.control, CSR_OFFSET_INVALID);
    }

    #[test]
    #[should_panic(expected = "single register context")]
    fn second_context_panics() {
        let config = ChipConfig::for_variant(ChipVariant::Beagle);
        let _ = config.sc_host_interrupt_csr_offsets(1);
    }
}
