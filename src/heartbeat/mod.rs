//! # Heartbeat Monitor
//!
//! Bidirectional UDP keep-alive between the companion and the dashboard
//! device, independent of the telemetry stream so connectivity can be
//! reported even while the simulator is closed.
//!
//! Every 500ms the monitor sends a 2-byte probe; the device answers with an
//! acknowledgment starting with `HB_ACK`. Socket errors are swallowed and
//! retried on the next tick; only stopping the monitor ends the protocol.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Liveness probe payload
pub const PROBE: &[u8] = b"HB";

/// Required acknowledgment prefix (trailing bytes are ignored)
pub const ACK_PREFIX: &[u8] = b"HB_ACK";

/// Interval between probes
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Receive poll timeout, which also bounds stop latency
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// An acknowledgment older than this means the device is disconnected
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct HeartbeatState {
    last_ack: Option<Instant>,
    last_seen: Option<DateTime<Utc>>,
    ever_seen: bool,
}

/// Snapshot of device liveness for status queries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatStatus {
    pub running: bool,
    pub connected: bool,
    pub ever_seen: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub timeout_s: f64,
}

/// Handle to a running heartbeat monitor.
///
/// State is fresh per monitor, so starting a new session starts from
/// "never seen".
pub struct HeartbeatMonitor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    state: Arc<Mutex<HeartbeatState>>,
}

impl HeartbeatMonitor {
    /// Start probing `endpoint`
    pub fn start(endpoint: SocketAddr) -> Self {
        let state = Arc::new(Mutex::new(HeartbeatState::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(endpoint, Arc::clone(&state), shutdown_rx));

        Self {
            shutdown,
            task,
            state,
        }
    }

    /// Signal the worker to stop at its next iteration boundary
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the worker to exit
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Current liveness snapshot
    pub fn status(&self) -> HeartbeatStatus {
        let (last_ack, last_seen, ever_seen) = {
            let state = self.state.lock().expect("heartbeat state lock poisoned");
            (state.last_ack, state.last_seen, state.ever_seen)
        };
        let running = !self.task.is_finished();

        HeartbeatStatus {
            running,
            connected: connected(running, ever_seen, last_ack.map(|t| t.elapsed())),
            ever_seen,
            last_seen,
            timeout_s: ACK_TIMEOUT.as_secs_f64(),
        }
    }
}

/// Connectivity rule: the monitor is alive, the device has answered at least
/// once, and the latest acknowledgment is recent enough
fn connected(running: bool, ever_seen: bool, ack_age: Option<Duration>) -> bool {
    running && ever_seen && ack_age.map_or(false, |age| age <= ACK_TIMEOUT)
}

async fn run_loop(
    endpoint: SocketAddr,
    state: Arc<Mutex<HeartbeatState>>,
    shutdown: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("failed to bind heartbeat socket: {e}");
            return;
        }
    };

    info!("heartbeat monitor started, target {endpoint}");

    let mut last_send: Option<Instant> = None;
    let mut buf = [0u8; 64];

    loop {
        if *shutdown.borrow() {
            break;
        }

        if last_send.map_or(true, |t| t.elapsed() >= PROBE_INTERVAL) {
            if let Err(e) = socket.send_to(PROBE, endpoint).await {
                // Transient; the next tick retries
                debug!("heartbeat send failed: {e}");
            }
            last_send = Some(Instant::now());
        }

        match timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _peer))) if buf[..len].starts_with(ACK_PREFIX) => {
                let mut state = state.lock().expect("heartbeat state lock poisoned");
                state.last_ack = Some(Instant::now());
                state.last_seen = Some(Utc::now());
                state.ever_seen = true;
            }
            Ok(Ok(_)) => {} // unrelated datagram
            Ok(Err(e)) => debug!("heartbeat receive failed: {e}"),
            Err(_) => {} // receive timeout, loop around
        }
    }

    info!("heartbeat monitor stopped");
}
