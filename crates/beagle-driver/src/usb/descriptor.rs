//! USB descriptor parsing.
//!
//! Parses the raw little-endian descriptor bytes per the USB 2.0 layout.
//! Class-specific descriptor bytes the parser does not understand are kept
//! verbatim in `extra` so higher layers (DFU interface discovery) can walk
//! them. Malformed input yields [`MalformedDescriptor`], never a transfer
//! error.
//!
//! [`MalformedDescriptor`]: crate::error::BeagleError::MalformedDescriptor

use crate::error::{BeagleError, Result};

/// Standard descriptor type codes.
pub mod descriptor_type {
    /// Device descriptor.
    pub const DEVICE: u8 = 0x01;
    /// Configuration descriptor.
    pub const CONFIGURATION: u8 = 0x02;
    /// Interface descriptor.
    pub const INTERFACE: u8 = 0x04;
    /// Endpoint descriptor.
    pub const ENDPOINT: u8 = 0x05;
}

/// Parsed device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// `bcdUSB` — USB specification release, BCD.
    pub usb_version: u16,
    /// Device class code.
    pub class: u8,
    /// Device subclass code.
    pub sub_class: u8,
    /// Device protocol code.
    pub protocol: u8,
    /// Maximum packet size for endpoint 0.
    pub max_packet_size_0: u8,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Product ID.
    pub product_id: u16,
    /// `bcdDevice` — device release number, BCD.
    pub device_version: u16,
    /// Number of configurations.
    pub num_configurations: u8,
}

/// Parsed interface descriptor plus trailing class-specific bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Interface number.
    pub interface_number: u8,
    /// Alternate setting.
    pub alternate_setting: u8,
    /// Endpoints in this interface (excluding endpoint 0).
    pub num_endpoints: u8,
    /// Interface class code.
    pub class: u8,
    /// Interface subclass code.
    pub sub_class: u8,
    /// Interface protocol code.
    pub protocol: u8,
    /// Class-specific descriptor bytes following this interface, verbatim.
    pub extra: Vec<u8>,
}

/// Parsed configuration descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    /// `wTotalLength` — full descriptor hierarchy size on the wire.
    pub total_length: u16,
    /// Number of interfaces.
    pub num_interfaces: u8,
    /// Value to pass to `SET_CONFIGURATION`.
    pub configuration_value: u8,
    /// Attributes bitmap (self-powered, remote wakeup).
    pub attributes: u8,
    /// Maximum power draw in 2 mA units.
    pub max_power: u8,
    /// Interfaces, in wire order.
    pub interfaces: Vec<InterfaceDescriptor>,
    /// Class-specific bytes preceding the first interface, verbatim.
    pub extra: Vec<u8>,
}

const DEVICE_DESCRIPTOR_LEN: usize = 18;
const CONFIGURATION_HEADER_LEN: usize = 9;
const INTERFACE_DESCRIPTOR_LEN: usize = 9;

fn read_u16_le(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

impl DeviceDescriptor {
    /// Parse the 18-byte device descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedDescriptor`](BeagleError::MalformedDescriptor) on
    /// short input or a wrong type code.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN {
            return Err(BeagleError::malformed_descriptor(format!(
                "device descriptor: {} bytes, need {DEVICE_DESCRIPTOR_LEN}",
                bytes.len()
            )));
        }
        if bytes[1] != descriptor_type::DEVICE {
            return Err(BeagleError::malformed_descriptor(format!(
                "device descriptor: type {:#04x}",
                bytes[1]
            )));
        }
        Ok(Self {
            usb_version: read_u16_le(bytes, 2),
            class: bytes[4],
            sub_class: bytes[5],
            protocol: bytes[6],
            max_packet_size_0: bytes[7],
            vendor_id: read_u16_le(bytes, 8),
            product_id: read_u16_le(bytes, 10),
            device_version: read_u16_le(bytes, 12),
            num_configurations: bytes[17],
        })
    }
}

impl ConfigurationDescriptor {
    /// Parse a configuration descriptor hierarchy from raw bytes.
    ///
    /// `bytes` may be shorter than `wTotalLength` when the caller capped the
    /// read; parsing stops at the end of the supplied data. Unknown
    /// sub-descriptors are preserved in the `extra` of the interface they
    /// follow (or of the configuration if they precede all interfaces).
    ///
    /// # Errors
    ///
    /// Returns [`MalformedDescriptor`](BeagleError::MalformedDescriptor) on
    /// short input, a wrong type code, or a sub-descriptor with a zero or
    /// out-of-bounds length.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONFIGURATION_HEADER_LEN {
            return Err(BeagleError::malformed_descriptor(format!(
                "configuration descriptor: {} bytes, need {CONFIGURATION_HEADER_LEN}",
                bytes.len()
            )));
        }
        if bytes[1] != descriptor_type::CONFIGURATION {
            return Err(BeagleError::malformed_descriptor(format!(
                "configuration descriptor: type {:#04x}",
                bytes[1]
            )));
        }

        let mut config = Self {
            total_length: read_u16_le(bytes, 2),
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            attributes: bytes[7],
            max_power: bytes[8],
            interfaces: Vec::new(),
            extra: Vec::new(),
        };

        let mut at = usize::from(bytes[0]);
        while at + 2 <= bytes.len() {
            let len = usize::from(bytes[at]);
            let kind = bytes[at + 1];
            if len < 2 || at + len > bytes.len() {
                return Err(BeagleError::malformed_descriptor(format!(
                    "sub-descriptor at {at}: length {len} exceeds data"
                )));
            }
            let body = &bytes[at..at + len];
            match kind {
                descriptor_type::INTERFACE => {
                    if len < INTERFACE_DESCRIPTOR_LEN {
                        return Err(BeagleError::malformed_descriptor(format!(
                            "interface descriptor at {at}: length {len}"
                        )));
                    }
                    config.interfaces.push(InterfaceDescriptor {
                        interface_number: body[2],
                        alternate_setting: body[3],
                        num_endpoints: body[4],
                        class: body[5],
                        sub_class: body[6],
                        protocol: body[7],
                        extra: Vec::new(),
                    });
                }
                descriptor_type::ENDPOINT => {}
                _ => match config.interfaces.last_mut() {
                    Some(interface) => interface.extra.extend_from_slice(body),
                    None => config.extra.extend_from_slice(body),
                },
            }
            at += len;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device_descriptor() -> Vec<u8> {
        vec![
            18, 0x01, 0x00, 0x02, // bcdUSB 2.00
            0x00, 0x00, 0x00, 64, // class, subclass, protocol, ep0
            0x6E, 0x1A, 0x9A, 0x08, // 1a6e:089a
            0x00, 0x01, // bcdDevice 1.00
            0, 0, 0, 1, // strings, 1 configuration
        ]
    }

    #[test]
    fn parse_device_descriptor() {
        let parsed = DeviceDescriptor::parse(&sample_device_descriptor()).unwrap();
        assert_eq!(parsed.usb_version, 0x0200);
        assert_eq!(parsed.vendor_id, 0x1A6E);
        assert_eq!(parsed.product_id, 0x089A);
        assert_eq!(parsed.num_configurations, 1);
    }

    #[test]
    fn short_device_descriptor_is_malformed() {
        let err = DeviceDescriptor::parse(&[18, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, BeagleError::MalformedDescriptor { .. }));
    }

    #[test]
    fn parse_configuration_with_class_specific_extra() {
        let mut bytes = vec![
            9, 0x02, 0, 0, 1, 1, 0, 0x80, 50, // config header, total filled below
        ];
        // Interface: class 0xFE subclass 0x01 (DFU)
        bytes.extend_from_slice(&[9, 0x04, 0, 0, 0, 0xFE, 0x01, 0x02, 0]);
        // DFU functional descriptor, preserved verbatim in extra
        bytes.extend_from_slice(&[9, 0x21, 0x03, 0xE8, 0x03, 0x00, 0x08, 0x10, 0x01]);
        let total = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&total.to_le_bytes());

        let parsed = ConfigurationDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed.total_length, total);
        assert_eq!(parsed.interfaces.len(), 1);
        let interface = &parsed.interfaces[0];
        assert_eq!(interface.class, 0xFE);
        assert_eq!(interface.sub_class, 0x01);
        assert_eq!(
            interface.extra,
            vec![9, 0x21, 0x03, 0xE8, 0x03, 0x00, 0x08, 0x10, 0x01]
        );
    }

    #[test]
    fn zero_length_sub_descriptor_is_malformed() {
        let mut bytes = vec![9, 0x02, 0, 0, 1, 1, 0, 0x80, 50];
        bytes.extend_from_slice(&[0, 0x04]);
        let total = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&total.to_le_bytes());
        assert!(matches!(
            ConfigurationDescriptor::parse(&bytes),
            Err(BeagleError::MalformedDescriptor { .. })
        ));
    }
}
