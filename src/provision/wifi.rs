//! # Wi-Fi Credential Provisioning
//!
//! Pushes SSID and password to the device over its USB-serial interface.
//!
//! USB-serial stacks on these boards are flaky right after the port opens:
//! the device may still be inside its boot window and silently miss the
//! first bytes. The push is therefore retried up to 3 times, and within each
//! attempt the payload is written twice with a short gap.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_serial::{SerialPort, SerialPortBuilderExt};
use tracing::{debug, info};

use crate::error::{DashBridgeError, Result};
use crate::provision::flash::FlashSupervisor;

/// Maximum provisioning attempts before giving up
pub const PROVISION_ATTEMPTS: usize = 3;

/// Settle delay after the first open (device boot/reset window)
pub const FIRST_ATTEMPT_SETTLE: Duration = Duration::from_millis(1200);

/// Settle delay on later attempts and between retries
pub const RETRY_SETTLE: Duration = Duration::from_millis(350);

/// Gap between the two payload writes and after the last one
pub const WRITE_GAP: Duration = Duration::from_millis(200);

/// Serial read/write timeout
pub const SERIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Credentials and target port for one provisioning run
#[derive(Debug, Clone)]
pub struct WifiOptions {
    pub port: String,
    pub baud: u32,
    pub ssid: String,
    pub password: String,
}

impl WifiOptions {
    /// Serial payload: `ssid,password` terminated by a newline
    pub fn payload(&self) -> String {
        format!("{},{}\n", self.ssid, self.password)
    }
}

/// Serial port operations used by provisioning, abstracted for testing
#[async_trait]
pub trait ProvisionPort: Send {
    /// Write all bytes to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Drive the DTR and RTS control lines
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()>;

    /// Discard any pending input and output
    fn clear_buffers(&mut self) -> io::Result<()>;
}

/// Opens a fresh port for each provisioning attempt
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn ProvisionPort>>;
}

/// Production port backed by `tokio_serial::SerialStream`
pub struct NativeSerialPort {
    port: tokio_serial::SerialStream,
}

#[async_trait]
impl ProvisionPort for NativeSerialPort {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.port.flush().await
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> io::Result<()> {
        self.port
            .write_data_terminal_ready(dtr)
            .and_then(|()| self.port.write_request_to_send(rts))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port
            .clear(tokio_serial::ClearBuffer::All)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Production opener using the native async serial stream
pub struct NativeSerialOpener;

#[async_trait]
impl PortOpener for NativeSerialOpener {
    async fn open(&self, port: &str, baud: u32) -> Result<Box<dyn ProvisionPort>> {
        let stream = tokio_serial::new(port, baud)
            .timeout(SERIAL_TIMEOUT)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| DashBridgeError::Serial(format!("failed to open {port}: {e}")))?;
        Ok(Box::new(NativeSerialPort { port: stream }))
    }
}

/// Push Wi-Fi credentials to the device.
///
/// Rejects immediately when port or SSID is missing, or while any flash job
/// is still running (both operations contend for the same serial device).
///
/// # Errors
///
/// Returns [`DashBridgeError::ProvisionRejected`] for invalid input or a
/// conflicting flash job, and [`DashBridgeError::Serial`] with an
/// operator-actionable message when all attempts fail.
pub async fn provision(flash: &FlashSupervisor, options: &WifiOptions) -> Result<()> {
    if options.port.is_empty() || options.ssid.is_empty() {
        return Err(DashBridgeError::ProvisionRejected(
            "missing port or SSID".to_string(),
        ));
    }
    if flash.any_active() {
        return Err(DashBridgeError::ProvisionRejected(
            "flash still running; wait for it to finish first".to_string(),
        ));
    }

    provision_with(&NativeSerialOpener, options).await
}

/// Provisioning loop with an injectable port opener
pub(crate) async fn provision_with(
    opener: &dyn PortOpener,
    options: &WifiOptions,
) -> Result<()> {
    let payload = options.payload();
    let mut last_error = None;

    for attempt in 0..PROVISION_ATTEMPTS {
        match push_credentials(opener, options, attempt, payload.as_bytes()).await {
            Ok(()) => {
                info!("Wi-Fi credentials sent on attempt {}", attempt + 1);
                return Ok(());
            }
            Err(e) => {
                debug!("provisioning attempt {} failed: {e}", attempt + 1);
                last_error = Some(e);
                sleep(RETRY_SETTLE).await;
            }
        }
    }

    let error = last_error
        .unwrap_or_else(|| DashBridgeError::Serial("unknown serial error".to_string()));
    Err(classify_serial_error(error))
}

async fn push_credentials(
    opener: &dyn PortOpener,
    options: &WifiOptions,
    attempt: usize,
    payload: &[u8],
) -> Result<()> {
    let mut port = opener.open(&options.port, options.baud).await?;

    // Keep DTR/RTS deasserted so the board does not reset into its
    // bootloader; some adapters cannot drive them, which is fine.
    let _ = port.set_control_lines(false, false);

    if attempt == 0 {
        sleep(FIRST_ATTEMPT_SETTLE).await;
    } else {
        sleep(RETRY_SETTLE).await;
    }

    let _ = port.clear_buffers();

    // The device can miss the first write while still booting, send it twice
    for _ in 0..2 {
        port.write_all(payload)
            .await
            .map_err(|e| DashBridgeError::Serial(format!("write failed: {e}")))?;
        port.flush()
            .await
            .map_err(|e| DashBridgeError::Serial(format!("flush failed: {e}")))?;
        sleep(WRITE_GAP).await;
    }

    Ok(())
}

/// Rewrite common Windows USB-serial failures into operator guidance
fn classify_serial_error(error: DashBridgeError) -> DashBridgeError {
    let raw = error.to_string();
    let lower = raw.to_ascii_lowercase();

    if lower.contains("permission")
        || lower.contains("access is denied")
        || lower.contains("writefile failed")
    {
        DashBridgeError::Serial(format!(
            "serial port is busy or the wrong interface is selected; close other serial \
             monitors, pick the USB Serial port (not JTAG), unplug/replug the board, then \
             retry (raw error: {raw})"
        ))
    } else if lower.contains("does not recognize the command")
        || lower.contains("does not understand the command")
    {
        DashBridgeError::Serial(format!(
            "the selected interface rejected the write; pick the USB Serial port (not JTAG) \
             and retry (raw error: {raw})"
        ))
    } else {
        error
    }
}
