//! # Firmware Flash Supervisor
//!
//! Runs the external flashing tool as a subprocess and tracks each run as an
//! asynchronous job with a bounded output log.
//!
//! Jobs are identified by a monotonically increasing id and never evicted;
//! sessions are short-lived and job counts are low, so the registry simply
//! grows. Consumers poll [`FlashSupervisor::status`] until `done`.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DashBridgeError, Result};

/// Maximum number of log lines retained per job; extra lines are dropped
pub const MAX_LOG_LINES: usize = 1000;

/// Maximum accepted firmware image size
pub const MAX_FIRMWARE_BYTES: u64 = 10 * 1024 * 1024;

/// Job identifier, unique per supervisor for the process lifetime
pub type JobId = u64;

/// Parameters for one firmware flash
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub chip: String,
    pub port: String,
    pub baud: u32,
    pub firmware: PathBuf,
}

/// A resolved tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// One strategy for locating the flashing tool.
///
/// Resolvers are consulted in order; the first one returning a command wins.
pub type ToolResolver = fn(&FlashRequest) -> Option<ToolCommand>;

/// State of one flash job.
///
/// The log is appended only by the owning worker; readers get a snapshot and
/// may observe a prefix of it while the job is live.
#[derive(Debug, Default)]
pub struct FlashJob {
    lines: Mutex<Vec<String>>,
    done: AtomicBool,
    ok: AtomicBool,
}

impl FlashJob {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("flash log lock poisoned");
        if lines.len() < MAX_LOG_LINES {
            lines.push(line);
        }
    }

    fn finish(&self, ok: bool) {
        self.ok.store(ok, Ordering::SeqCst);
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> FlashStatus {
        FlashStatus {
            done: self.done.load(Ordering::SeqCst),
            ok: self.ok.load(Ordering::SeqCst),
            lines: self.lines.lock().expect("flash log lock poisoned").clone(),
        }
    }
}

/// Poll result for a flash job
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FlashStatus {
    pub done: bool,
    pub ok: bool,
    pub lines: Vec<String>,
}

/// Supervisor owning the job registry and tool resolution strategies
pub struct FlashSupervisor {
    jobs: Mutex<HashMap<JobId, Arc<FlashJob>>>,
    next_id: AtomicU64,
    resolvers: Vec<ToolResolver>,
}

impl Default for FlashSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashSupervisor {
    pub fn new() -> Self {
        Self::with_resolvers(default_resolvers())
    }

    /// Build a supervisor with custom tool resolution strategies
    pub fn with_resolvers(resolvers: Vec<ToolResolver>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            resolvers,
        }
    }

    /// Validate and start a flash job, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`DashBridgeError::ProvisionRejected`] on a missing port,
    /// missing/oversized firmware image, or a firmware path that does not
    /// exist. Tool resolution failures are not submit errors; they surface
    /// through the job log instead.
    pub fn submit(&self, request: FlashRequest) -> Result<JobId> {
        if request.port.is_empty() {
            return Err(DashBridgeError::ProvisionRejected(
                "no serial port selected".to_string(),
            ));
        }
        if request.firmware.as_os_str().is_empty() {
            return Err(DashBridgeError::ProvisionRejected(
                "no firmware file provided".to_string(),
            ));
        }
        let metadata = std::fs::metadata(&request.firmware).map_err(|_| {
            DashBridgeError::ProvisionRejected(format!(
                "firmware file not found: {}",
                request.firmware.display()
            ))
        })?;
        if metadata.len() > MAX_FIRMWARE_BYTES {
            return Err(DashBridgeError::ProvisionRejected(format!(
                "firmware file too large: {} bytes (max {})",
                metadata.len(),
                MAX_FIRMWARE_BYTES
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Arc::new(FlashJob::default());
        self.jobs
            .lock()
            .expect("flash registry lock poisoned")
            .insert(id, Arc::clone(&job));

        let command = self.resolvers.iter().find_map(|resolve| resolve(&request));
        info!("flash job {id} submitted for {}", request.firmware.display());
        tokio::spawn(run_flash(job, command));

        Ok(id)
    }

    /// Poll a job. Unknown ids report as terminally failed rather than erroring.
    pub fn status(&self, id: JobId) -> FlashStatus {
        let job = self
            .jobs
            .lock()
            .expect("flash registry lock poisoned")
            .get(&id)
            .cloned();
        match job {
            Some(job) => job.snapshot(),
            None => FlashStatus {
                done: true,
                ok: false,
                lines: vec!["unknown job".to_string()],
            },
        }
    }

    /// Whether any job has not finished yet.
    ///
    /// Wi-Fi provisioning refuses to run while this is true, since both
    /// operations contend for the same USB-serial device.
    pub fn any_active(&self) -> bool {
        self.jobs
            .lock()
            .expect("flash registry lock poisoned")
            .values()
            .any(|job| !job.is_done())
    }
}

async fn run_flash(job: Arc<FlashJob>, command: Option<ToolCommand>) {
    let Some(command) = command else {
        job.push("Flash error: cannot find a Python launcher or esptool in PATH".to_string());
        job.push("Install esptool with: pip install esptool".to_string());
        job.finish(false);
        return;
    };

    job.push(format!(
        "Running: {} {}",
        command.program.display(),
        command.args.join(" ")
    ));

    let mut child = match Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            job.push(format!("Flash error: failed to start flashing tool: {e}"));
            job.push("Install esptool with: pip install esptool".to_string());
            job.finish(false);
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        pump_lines(stdout, Arc::clone(&job)),
        pump_lines(stderr, Arc::clone(&job)),
    );

    match child.wait().await {
        Ok(status) => {
            debug!("flashing tool exited with {status}");
            job.finish(status.success());
        }
        Err(e) => {
            job.push(format!("Flash error: failed to wait for flashing tool: {e}"));
            job.finish(false);
        }
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: Option<R>, job: Arc<FlashJob>) {
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        job.push(line);
    }
}

/// Default tool resolution order: the Windows Python launcher, a plain
/// `python` interpreter, then a standalone `esptool` binary
pub fn default_resolvers() -> Vec<ToolResolver> {
    vec![py_launcher_resolver, python_module_resolver, standalone_resolver]
}

fn py_launcher_resolver(request: &FlashRequest) -> Option<ToolCommand> {
    find_in_path("py").map(|program| ToolCommand {
        program,
        args: module_args(request),
    })
}

fn python_module_resolver(request: &FlashRequest) -> Option<ToolCommand> {
    find_in_path("python").map(|program| ToolCommand {
        program,
        args: module_args(request),
    })
}

fn standalone_resolver(request: &FlashRequest) -> Option<ToolCommand> {
    find_in_path("esptool").map(|program| ToolCommand {
        program,
        args: flash_args(request),
    })
}

fn module_args(request: &FlashRequest) -> Vec<String> {
    let mut args = vec!["-m".to_string(), "esptool".to_string()];
    args.extend(flash_args(request));
    args
}

/// Argument list shared by every invocation strategy
fn flash_args(request: &FlashRequest) -> Vec<String> {
    vec![
        "--chip".to_string(),
        request.chip.clone(),
        "--port".to_string(),
        request.port.clone(),
        "--baud".to_string(),
        request.baud.to_string(),
        "write-flash".to_string(),
        "0x0".to_string(),
        request.firmware.display().to_string(),
    ]
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}
