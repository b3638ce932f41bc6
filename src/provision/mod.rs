//! # Provisioning Module
//!
//! Device provisioning over USB: firmware flashing as supervised subprocess
//! jobs, Wi-Fi credential pushes over serial, and port autodetection.
//!
//! Flashing and credential pushes are mutually exclusive because both drive
//! the same USB-serial interface.

pub mod flash;
pub mod ports;
pub mod wifi;

pub use flash::{FlashRequest, FlashStatus, FlashSupervisor, JobId};
pub use ports::{autodetect, list_ports, DetectedPort};
pub use wifi::{provision, WifiOptions};
