//! # Serial Port Detection
//!
//! Enumerates serial ports and picks the device's USB-serial interface.
//!
//! ESP32-C6 boards expose two interfaces: the USB Serial bridge that
//! provisioning and flashing need, and a USB JTAG interface that rejects
//! plain serial writes. Autodetection prefers an explicit Seeed/XIAO serial
//! port, then falls back to an unambiguous Espressif device.

use tokio_serial::SerialPortType;

use crate::error::{DashBridgeError, Result};

/// Espressif's USB vendor id
pub const ESPRESSIF_VID: u16 = 0x303A;

/// One enumerated serial port with the USB metadata used for detection
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPort {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Enumerate the host's serial ports
pub fn list_ports() -> Result<Vec<DetectedPort>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| DashBridgeError::Serial(format!("failed to enumerate serial ports: {e}")))?;

    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => DetectedPort {
                name: port.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => DetectedPort {
                name: port.port_name,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect())
}

/// Pick the most plausible device port out of an enumeration.
///
/// Branded Seeed/XIAO ports win outright unless they identify as JTAG. For
/// bare Espressif VIDs the product string splits candidates into serial,
/// generic and JTAG buckets; generic and JTAG ports are only picked when
/// they are unambiguous.
pub fn autodetect(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    let mut serial = Vec::new();
    let mut generic = Vec::new();
    let mut jtag = Vec::new();

    for port in ports {
        let product = lower(&port.product);
        let manufacturer = lower(&port.manufacturer);

        if product.contains("xiao")
            || product.contains("seeed")
            || manufacturer.contains("xiao")
            || manufacturer.contains("seeed")
        {
            if product.contains("jtag") {
                jtag.push(port);
            } else {
                serial.push(port);
            }
            continue;
        }

        if port.vid == Some(ESPRESSIF_VID) {
            if product.contains("jtag") {
                jtag.push(port);
            } else if product.contains("serial") || product.contains("cdc") {
                serial.push(port);
            } else if product.contains("esp32") || product.contains("usb") {
                generic.push(port);
            }
        }
    }

    serial
        .first()
        .copied()
        .or_else(|| (generic.len() == 1).then(|| generic[0]))
        .or_else(|| (jtag.len() == 1).then(|| jtag[0]))
}

fn lower(value: &Option<String>) -> String {
    value.as_deref().unwrap_or("").to_ascii_lowercase()
}
