//! # Telemetry Module
//!
//! Everything between the simulator's shared memory region and the dashboard
//! device's UDP socket:
//! - Fixed-layout physics record decode
//! - Derived dashboard frame and its ASCII wire encoding
//! - The broadcaster worker with its change-driven send policy

pub mod broadcaster;
pub mod record;
pub mod source;
pub mod wire;

pub use broadcaster::{BroadcastStatus, Broadcaster, TelemetryEvent};
pub use record::{PhysicsRecord, RECORD_SIZE};
pub use source::{SharedMemorySource, TelemetrySource};
pub use wire::{send_layout, DashboardFrame, Layout, LayoutZone};
