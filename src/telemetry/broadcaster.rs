//! # Telemetry Broadcaster
//!
//! Worker that turns physics records into dashboard wire packets and decides
//! when to transmit them.
//!
//! The loop polls the telemetry source, derives the device-facing frame, and
//! sends it over UDP through a change-driven gate: changes go out as soon as
//! the rate limit allows, and an internal cadence keeps a slow keep-alive
//! stream flowing when nothing changes. Status and a latest-wins telemetry
//! event are published for the UI through single-slot watch channels.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::telemetry::record::PhysicsRecord;
use crate::telemetry::source::TelemetrySource;
use crate::telemetry::wire::DashboardFrame;

/// Minimum spacing between any two sends (bounds change bursts to 50Hz)
pub const MIN_SEND_INTERVAL: Duration = Duration::from_millis(20);

/// Cadence for keep-alive sends while the packet is unchanged
pub const SEND_CADENCE: Duration = Duration::from_millis(500);

/// How often the simulator liveness probe is re-checked
pub const SIM_PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Delay before retrying while the simulator is inactive or still starting
pub const INACTIVE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Sleep slice between loop iterations
pub const LOOP_SLICE: Duration = Duration::from_millis(5);

/// Decides whether a packet goes out now.
///
/// A packet is sent when the minimum send interval has elapsed and the packet
/// either differs from the last transmitted one or the keep-alive cadence is
/// due. The last-transmitted memory only updates on an actual send, so a
/// change suppressed by the rate limit is retried on the next iteration
/// instead of being lost.
#[derive(Debug, Default)]
pub struct SendGate {
    last_packet: Option<String>,
    last_send: Option<Instant>,
    last_cadence: Option<Instant>,
}

impl SendGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the last transmitted packet so the next one counts as a change
    pub fn reset(&mut self) {
        self.last_packet = None;
    }

    /// Record-keeping check: returns true if `packet` should be sent at `now`
    pub fn should_send(&mut self, packet: &str, now: Instant) -> bool {
        let changed = self.last_packet.as_deref() != Some(packet);
        let cadence_due = self
            .last_cadence
            .map_or(true, |t| now.duration_since(t) >= SEND_CADENCE);
        let rate_ok = self
            .last_send
            .map_or(true, |t| now.duration_since(t) >= MIN_SEND_INTERVAL);

        if rate_ok && (changed || cadence_due) {
            self.last_send = Some(now);
            self.last_packet = Some(packet.to_string());
            if cadence_due {
                self.last_cadence = Some(now);
            }
            true
        } else {
            false
        }
    }
}

/// Broadcaster lifecycle status, surfaced to the UI as a string
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastStatus {
    Idle,
    Running,
    Stopped,
    Error(String),
}

impl fmt::Display for BroadcastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Telemetry running"),
            Self::Stopped => write!(f, "Telemetry stopped"),
            Self::Error(msg) => write!(f, "{msg}"),
        }
    }
}

/// UI-facing telemetry event, published at a throttled rate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    /// Whether the simulator was running when the event was produced
    pub sim_running: bool,

    /// Derived dashboard frame; absent while the simulator is inactive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<DashboardFrame>,

    /// Raw per-wheel wear percentages, clamped to [0, 100]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tire_wear_pct: Option<[f32; 4]>,
}

impl TelemetryEvent {
    fn inactive() -> Self {
        Self {
            sim_running: false,
            frame: None,
            tire_wear_pct: None,
        }
    }

    fn live(record: &PhysicsRecord, frame: DashboardFrame) -> Self {
        Self {
            sim_running: true,
            frame: Some(frame),
            tire_wear_pct: Some(record.tire_wear.map(|w| w.clamp(0.0, 100.0))),
        }
    }
}

/// Handle to a running telemetry broadcaster.
///
/// One broadcaster per session; `stop()` signals the loop cooperatively and
/// the worker exits at its next iteration boundary.
pub struct Broadcaster {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    status_rx: watch::Receiver<BroadcastStatus>,
    event_rx: watch::Receiver<Option<TelemetryEvent>>,
}

impl Broadcaster {
    /// Start broadcasting toward `endpoint`.
    ///
    /// `high_frequency` raises the UI event rate from 1Hz to 10Hz; the wire
    /// send policy is unaffected.
    pub fn start(
        source: Arc<dyn TelemetrySource>,
        endpoint: SocketAddr,
        high_frequency: bool,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(BroadcastStatus::Idle);
        let (event_tx, event_rx) = watch::channel(None);

        let task = tokio::spawn(run_loop(
            source,
            endpoint,
            high_frequency,
            shutdown_rx,
            status_tx,
            event_tx,
        ));

        Self {
            shutdown,
            task,
            status_rx,
            event_rx,
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

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Latest lifecycle status
    pub fn status(&self) -> BroadcastStatus {
        self.status_rx.borrow().clone()
    }

    /// Latest telemetry event, if any was published yet
    pub fn last_event(&self) -> Option<TelemetryEvent> {
        self.event_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BroadcastStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe_events(&self) -> watch::Receiver<Option<TelemetryEvent>> {
        self.event_rx.clone()
    }
}

async fn run_loop(
    source: Arc<dyn TelemetrySource>,
    endpoint: SocketAddr,
    high_frequency: bool,
    mut shutdown: watch::Receiver<bool>,
    status_tx: watch::Sender<BroadcastStatus>,
    event_tx: watch::Sender<Option<TelemetryEvent>>,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            error!("failed to bind telemetry socket: {e}");
            let _ = status_tx.send(BroadcastStatus::Error(format!("Telemetry error: {e}")));
            return;
        }
    };

    info!("telemetry broadcaster started, target {endpoint}");
    let _ = status_tx.send(BroadcastStatus::Running);

    let event_interval = if high_frequency {
        Duration::from_millis(100)
    } else {
        Duration::from_secs(1)
    };

    let mut gate = SendGate::new();
    let mut sim_running = false;
    let mut last_probe: Option<Instant> = None;
    let mut last_event: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Instant::now();
        if last_probe.map_or(true, |t| now.duration_since(t) >= SIM_PROBE_INTERVAL) {
            sim_running = source.sim_running();
            last_probe = Some(now);
        }

        if !sim_running {
            if last_event.map_or(true, |t| t.elapsed() >= event_interval) {
                let _ = event_tx.send(Some(TelemetryEvent::inactive()));
                last_event = Some(Instant::now());
            }
            // Forget the last packet so the first active sample always sends
            gate.reset();
            sleep_or_shutdown(&mut shutdown, INACTIVE_RETRY_DELAY).await;
            continue;
        }

        let raw = match source.read_record() {
            Ok(raw) => raw,
            Err(e) => {
                // The simulator is probably still starting up
                debug!("telemetry source not ready: {e}");
                sleep_or_shutdown(&mut shutdown, INACTIVE_RETRY_DELAY).await;
                continue;
            }
        };

        let record = match PhysicsRecord::decode(&raw) {
            Ok(record) => record,
            Err(e) => {
                error!("telemetry decode failed: {e}");
                let _ = status_tx.send(BroadcastStatus::Error(format!("Telemetry error: {e}")));
                return;
            }
        };

        let frame = DashboardFrame::from_record(&record);
        let packet = frame.encode();

        if gate.should_send(&packet, Instant::now()) {
            if let Err(e) = socket.send_to(packet.as_bytes(), endpoint).await {
                error!("telemetry send failed: {e}");
                let _ = status_tx.send(BroadcastStatus::Error(format!("Telemetry error: {e}")));
                return;
            }
        }

        if last_event.map_or(true, |t| t.elapsed() >= event_interval) {
            let _ = event_tx.send(Some(TelemetryEvent::live(&record, frame)));
            last_event = Some(Instant::now());
        }

        sleep_or_shutdown(&mut shutdown, LOOP_SLICE).await;
    }

    info!("telemetry broadcaster stopped");
    let _ = status_tx.send(BroadcastStatus::Stopped);
}

async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::record::test_support::RecordBuilder;
    use crate::telemetry::source::mocks::MockSource;
    use tokio::time::timeout;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_gate_sends_first_packet() {
        let mut gate = SendGate::new();
        assert!(gate.should_send("a", Instant::now()));
    }

    #[test]
    fn test_gate_identical_packets_follow_cadence() {
        let mut gate = SendGate::new();
        let base = Instant::now();

        assert!(gate.should_send("a", at(base, 0)));
        // Unchanged packets stay quiet until the cadence elapses
        assert!(!gate.should_send("a", at(base, 100)));
        assert!(!gate.should_send("a", at(base, 400)));
        assert!(gate.should_send("a", at(base, 500)));
        assert!(!gate.should_send("a", at(base, 900)));
        assert!(gate.should_send("a", at(base, 1000)));
    }

    #[test]
    fn test_gate_changes_send_immediately_when_rate_allows() {
        let mut gate = SendGate::new();
        let base = Instant::now();

        assert!(gate.should_send("a", at(base, 0)));
        assert!(gate.should_send("b", at(base, 25)));
        assert!(gate.should_send("c", at(base, 50)));
    }

    #[test]
    fn test_gate_rate_limits_change_bursts() {
        let mut gate = SendGate::new();
        let base = Instant::now();

        assert!(gate.should_send("a", at(base, 0)));
        // Too soon, even though the packet changed
        assert!(!gate.should_send("b", at(base, 5)));
        assert!(!gate.should_send("b", at(base, 10)));
        // The suppressed change is still pending and goes out at 20ms
        assert!(gate.should_send("b", at(base, 20)));
    }

    #[test]
    fn test_gate_min_spacing_across_mixed_traffic() {
        let mut gate = SendGate::new();
        let base = Instant::now();
        let mut sent_at = Vec::new();

        for ms in (0..1000).step_by(5) {
            let packet = format!("p{}", ms / 40);
            if gate.should_send(&packet, at(base, ms as u64)) {
                sent_at.push(ms);
            }
        }

        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= 20, "sends too close: {pair:?}");
        }
    }

    #[test]
    fn test_gate_reset_forces_next_send() {
        let mut gate = SendGate::new();
        let base = Instant::now();

        assert!(gate.should_send("a", at(base, 0)));
        assert!(!gate.should_send("a", at(base, 100)));
        gate.reset();
        assert!(gate.should_send("a", at(base, 200)));
    }

    #[test]
    fn test_status_display_strings() {
        assert_eq!(BroadcastStatus::Running.to_string(), "Telemetry running");
        assert_eq!(BroadcastStatus::Stopped.to_string(), "Telemetry stopped");
        assert_eq!(
            BroadcastStatus::Error("Telemetry error: boom".to_string()).to_string(),
            "Telemetry error: boom"
        );
    }

    fn sample_record_bytes() -> Vec<u8> {
        RecordBuilder::new()
            .i32(1) // packetId
            .f32(0.5) // gas
            .f32(0.0) // brake
            .f32(40.0) // fuel
            .i32(3) // gear
            .i32(5000) // rpms
            .f32(0.0) // steerAngle
            .f32(150.0) // speedKmh
            .finish()
    }

    #[tokio::test]
    async fn test_broadcaster_sends_packets_to_device() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = device.local_addr().unwrap();

        let source = MockSource::new();
        source.set_fallback(sample_record_bytes());

        let broadcaster = Broadcaster::start(source, endpoint, false);

        let mut buf = [0u8; 512];
        let (len, _) = timeout(Duration::from_secs(2), device.recv_from(&mut buf))
            .await
            .expect("no packet within 2s")
            .unwrap();

        let expected = DashboardFrame::from_record(
            &PhysicsRecord::decode(&sample_record_bytes()).unwrap(),
        )
        .encode();
        assert_eq!(std::str::from_utf8(&buf[..len]).unwrap(), expected);
        assert_eq!(broadcaster.status(), BroadcastStatus::Running);

        let event = broadcaster.last_event().expect("no telemetry event");
        assert!(event.sim_running);
        assert!(event.frame.is_some());

        broadcaster.stop();
        broadcaster.join().await;
    }

    #[tokio::test]
    async fn test_broadcaster_stop_publishes_stopped_status() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = device.local_addr().unwrap();

        let source = MockSource::new();
        source.set_fallback(sample_record_bytes());

        let broadcaster = Broadcaster::start(source, endpoint, false);
        let mut status_rx = broadcaster.subscribe_status();

        broadcaster.stop();
        broadcaster.join().await;

        // Drain to the final status value
        let status = status_rx.borrow_and_update().clone();
        assert_eq!(status, BroadcastStatus::Stopped);
    }

    #[tokio::test]
    async fn test_broadcaster_reports_inactive_sim() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = device.local_addr().unwrap();

        let source = MockSource::new();
        source.set_running(false);

        let broadcaster = Broadcaster::start(source, endpoint, false);

        let mut event_rx = broadcaster.subscribe_events();
        timeout(Duration::from_secs(2), async {
            loop {
                if event_rx.borrow_and_update().is_some() {
                    break;
                }
                event_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("no inactive event within 2s");

        let event = broadcaster.last_event().unwrap();
        assert!(!event.sim_running);
        assert!(event.frame.is_none());

        // No packets flow while the simulator is down
        let mut buf = [0u8; 64];
        let recv = timeout(Duration::from_millis(300), device.recv_from(&mut buf)).await;
        assert!(recv.is_err(), "unexpected packet while sim inactive");

        broadcaster.stop();
        broadcaster.join().await;
    }

    #[tokio::test]
    async fn test_broadcaster_decode_failure_is_fatal() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = device.local_addr().unwrap();

        let source = MockSource::new();
        source.set_fallback(vec![0u8; 16]); // far too short to decode

        let broadcaster = Broadcaster::start(source, endpoint, false);

        let deadline = Instant::now() + Duration::from_secs(2);
        while broadcaster.is_running() {
            assert!(Instant::now() < deadline, "broadcaster did not terminate");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        match broadcaster.status() {
            BroadcastStatus::Error(msg) => {
                assert!(msg.contains("Telemetry error"), "unexpected error: {msg}")
            }
            other => panic!("expected error status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcaster_retries_while_source_unavailable() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = device.local_addr().unwrap();

        let source = MockSource::new();
        source.fail_reads(true);

        let broadcaster = Broadcaster::start(source.clone(), endpoint, false);

        // Acquisition failures are transient: the loop keeps running
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(broadcaster.is_running());
        assert_eq!(broadcaster.status(), BroadcastStatus::Running);

        // Once the region appears, packets start flowing
        source.set_fallback(sample_record_bytes());
        source.fail_reads(false);

        let mut buf = [0u8; 512];
        let recv = timeout(Duration::from_secs(2), device.recv_from(&mut buf)).await;
        assert!(recv.is_ok(), "no packet after source recovered");

        broadcaster.stop();
        broadcaster.join().await;
    }
}
