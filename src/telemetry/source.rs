//! # Telemetry Source
//!
//! Abstraction over where raw physics records come from, plus the production
//! implementation reading the simulator's shared memory region.
//!
//! The region is owned by the simulator and may not exist yet while the game
//! is starting; acquisition failures are transient and the broadcaster
//! retries them rather than treating them as session errors.

use shared_memory::ShmemConf;

use crate::error::{DashBridgeError, Result};
use crate::telemetry::record::RECORD_SIZE;

/// Default name of the simulator-owned physics region
pub const SHARED_MEMORY_NAME: &str = "acpmf_physics";

/// Default simulator process image for the liveness probe
pub const SIM_PROCESS_NAME: &str = "acs.exe";

/// Source of raw physics records and simulator liveness
pub trait TelemetrySource: Send + Sync {
    /// Whether the simulator process is currently running
    fn sim_running(&self) -> bool;

    /// Copy one raw physics record out of the source
    fn read_record(&self) -> Result<Vec<u8>>;
}

/// Production source: reads the simulator's named shared memory region
pub struct SharedMemorySource {
    map_name: String,
    process_image: String,
}

impl SharedMemorySource {
    pub fn new(map_name: &str, process_image: &str) -> Self {
        Self {
            map_name: map_name.to_string(),
            process_image: process_image.to_string(),
        }
    }
}

impl Default for SharedMemorySource {
    fn default() -> Self {
        Self::new(SHARED_MEMORY_NAME, SIM_PROCESS_NAME)
    }
}

impl TelemetrySource for SharedMemorySource {
    fn sim_running(&self) -> bool {
        process_running(&self.process_image)
    }

    fn read_record(&self) -> Result<Vec<u8>> {
        // Open fresh on every read; the handle is cheap and holding it across
        // a simulator restart would pin a stale mapping.
        let shmem = ShmemConf::new()
            .os_id(&self.map_name)
            .open()
            .map_err(|e| {
                DashBridgeError::SharedMemory(format!("failed to open {}: {e}", self.map_name))
            })?;

        if shmem.len() < RECORD_SIZE {
            return Err(DashBridgeError::SharedMemory(format!(
                "region {} too small: {} bytes, need {}",
                self.map_name,
                shmem.len(),
                RECORD_SIZE
            )));
        }

        // SAFETY: the mapping is at least RECORD_SIZE bytes (checked above)
        // and stays alive until `shmem` drops at the end of this function.
        let data = unsafe { std::slice::from_raw_parts(shmem.as_ptr(), RECORD_SIZE) }.to_vec();
        Ok(data)
    }
}

#[cfg(windows)]
fn process_running(image: &str) -> bool {
    use std::process::Command;

    let filter = format!("IMAGENAME eq {image}");
    match Command::new("tasklist").args(["/FI", &filter, "/NH"]).output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .to_ascii_lowercase()
            .contains(&image.to_ascii_lowercase()),
        Err(_) => false,
    }
}

#[cfg(not(windows))]
fn process_running(image: &str) -> bool {
    use std::fs;

    // Process images configured for Windows keep their .exe suffix; /proc
    // comm entries do not carry one.
    let name = image.trim_end_matches(".exe");
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let comm_path = entry.path().join("comm");
            if let Ok(comm) = fs::read_to_string(&comm_path) {
                if comm.trim() == name {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// Scriptable telemetry source for broadcaster tests
    pub struct MockSource {
        pub running: AtomicBool,
        pub records: Mutex<Vec<Vec<u8>>>,
        pub fallback: Mutex<Option<Vec<u8>>>,
        pub read_errors: AtomicBool,
    }

    impl MockSource {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                running: AtomicBool::new(true),
                records: Mutex::new(Vec::new()),
                fallback: Mutex::new(None),
                read_errors: AtomicBool::new(false),
            })
        }

        /// Serve these records first (in order), then fall back to the last
        /// configured fallback record
        pub fn push_record(&self, record: Vec<u8>) {
            self.records.lock().unwrap().push(record);
        }

        pub fn set_fallback(&self, record: Vec<u8>) {
            *self.fallback.lock().unwrap() = Some(record);
        }

        pub fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::SeqCst);
        }

        pub fn fail_reads(&self, fail: bool) {
            self.read_errors.store(fail, Ordering::SeqCst);
        }
    }

    impl TelemetrySource for MockSource {
        fn sim_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn read_record(&self) -> Result<Vec<u8>> {
            if self.read_errors.load(Ordering::SeqCst) {
                return Err(DashBridgeError::SharedMemory(
                    "mock region unavailable".to_string(),
                ));
            }
            let mut records = self.records.lock().unwrap();
            if records.is_empty() {
                self.fallback
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| DashBridgeError::SharedMemory("mock exhausted".to_string()))
            } else {
                Ok(records.remove(0))
            }
        }
    }
}
