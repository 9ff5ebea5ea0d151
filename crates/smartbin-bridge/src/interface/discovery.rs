//! USB serial device discovery
//!
//! Used when the configured port is `auto`: the bin controller is whatever
//! Arduino-compatible USB serial adapter shows up first.

use tracing::{debug, info};

/// Device paths worth probing when enumeration finds nothing
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/ttyACM*",
    "/dev/ttyUSB*",
    "/dev/serial/by-id/usb-Arduino*",
    // macOS
    "/dev/cu.usbmodem*",
    "/dev/cu.usbserial-*",
    "/dev/cu.wchusbserial*",
];

/// USB vendor ids of Arduino boards and the usual USB-UART bridges on clones
const KNOWN_VIDS: &[u16] = &[
    0x2341, // Arduino
    0x2A03, // Arduino (arduino.org)
    0x1A86, // QinHeng CH340
    0x0403, // FTDI
    0x10C4, // Silicon Labs CP210x
];

/// Information about a detected serial device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the device (e.g., /dev/ttyACM0)
    pub path: String,
    /// Device type description
    pub device_type: String,
    /// USB Vendor ID (if available)
    pub vendor_id: Option<u16>,
    /// USB Product ID (if available)
    pub product_id: Option<u16>,
    /// Product name (if available)
    pub product_name: Option<String>,
    /// Manufacturer (if available)
    pub manufacturer: Option<String>,
    /// Whether this looks like a bin controller
    pub is_likely_controller: bool,
}

impl DeviceInfo {
    fn from_serial_port(port: &serialport::SerialPortInfo) -> Self {
        use serialport::SerialPortType;

        let (device_type, vendor_id, product_id, product_name, manufacturer) = match &port.port_type
        {
            SerialPortType::UsbPort(usb_info) => (
                "USB".to_string(),
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.product.clone(),
                usb_info.manufacturer.clone(),
            ),
            SerialPortType::PciPort => ("PCI".to_string(), None, None, None, None),
            SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None, None),
            SerialPortType::Unknown => ("Unknown".to_string(), None, None, None, None),
        };

        Self {
            path: port.port_name.clone(),
            device_type,
            vendor_id,
            product_id,
            product_name,
            manufacturer,
            is_likely_controller: is_likely_controller(port),
        }
    }
}

/// Find the first connected controller
///
/// Prefers enumerated USB devices with a known vendor, then falls back to
/// common device path patterns.
pub fn find_controller_device() -> Option<String> {
    if let Ok(ports) = serialport::available_ports() {
        for port in ports {
            if is_likely_controller(&port) {
                info!(path = %port.port_name, "Found likely bin controller");
                return Some(port.port_name);
            }
        }
    }

    for pattern in COMMON_DEVICE_PATHS {
        if let Ok(entries) = glob::glob(pattern) {
            for entry in entries.flatten() {
                if entry.exists() {
                    let path = entry.to_string_lossy().to_string();
                    debug!(path = %path, "Found serial port by path pattern");
                    return Some(path);
                }
            }
        }
    }

    None
}

/// List all serial ports the OS reports
pub fn list_available_devices() -> Vec<DeviceInfo> {
    serialport::available_ports()
        .map(|ports| ports.iter().map(DeviceInfo::from_serial_port).collect())
        .unwrap_or_default()
}

/// Check if a serial port looks like an Arduino-class board
fn is_likely_controller(port: &serialport::SerialPortInfo) -> bool {
    use serialport::SerialPortType;

    let SerialPortType::UsbPort(usb_info) = &port.port_type else {
        return false;
    };

    if KNOWN_VIDS.contains(&usb_info.vid) {
        debug!(
            vid = format_args!("{:#06X}", usb_info.vid),
            pid = format_args!("{:#06X}", usb_info.pid),
            "USB device matches known vendor"
        );
        return true;
    }

    usb_info
        .product
        .as_deref()
        .map(str::to_lowercase)
        .is_some_and(|product| {
            product.contains("arduino") || product.contains("ch340") || product.contains("uart")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::{SerialPortInfo, SerialPortType, UsbPortInfo};

    fn usb_port(vid: u16, product: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: "/dev/ttyACM0".to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid: 0x0043,
                serial_number: None,
                manufacturer: None,
                product: product.map(str::to_string),
            }),
        }
    }

    #[test]
    fn test_known_vendor_matches() {
        assert!(is_likely_controller(&usb_port(0x2341, None)));
        assert!(is_likely_controller(&usb_port(0x1A86, None)));
    }

    #[test]
    fn test_product_name_matches() {
        assert!(is_likely_controller(&usb_port(0xFFFF, Some("Arduino Uno"))));
        assert!(!is_likely_controller(&usb_port(0xFFFF, Some("Keyboard"))));
    }

    #[test]
    fn test_non_usb_port_does_not_match() {
        let port = SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: SerialPortType::PciPort,
        };
        assert!(!is_likely_controller(&port));
        assert_eq!(DeviceInfo::from_serial_port(&port).device_type, "PCI");
    }
}
