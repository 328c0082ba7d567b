//! USB transport stack.
//!
//! Layering, bottom up: the transfer primitive layer
//! ([`device::UsbDeviceInterface`] with its [`rusb_device`] and [`fake`]
//! implementations), the [`standard`] command layer that substitutes default
//! timeouts and parses descriptors, and the two protocol layers composed on
//! top of it — [`dfu`] for firmware update and [`ml`] for register access
//! and data streaming.

pub mod descriptor;
pub mod device;
pub mod dfu;
pub mod fake;
pub mod ml;
pub mod rusb_device;
pub mod standard;
pub mod transfer;
