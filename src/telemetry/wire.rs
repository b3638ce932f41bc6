//! # Dashboard Wire Protocol
//!
//! Builds the ASCII key:value packet the dashboard device consumes, one UDP
//! datagram per send, plus the layout packet used to reconfigure its zones.
//!
//! Packet grammar (fixed field order, fixed precisions):
//!
//! ```text
//! G:{gear}|PIT:{0|1}|ABS:{0|1}|TC:{0|1}|RL:{0|1}|P1:{0|1}|P2:{0|1}|
//! T0..T3:{0|1}|W0..W3:{int}|SPD:{int}|RPM:{int}|THR:{int}|BRK:{int}|
//! FUEL:{x.y}|BST:{x.yy}|ATMP:{int}|RTMP:{int}|DRS:{0|1}|CLT:{int}|
//! STR:{x.yy}|BTMP:{int}
//! ```

use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::error::{DashBridgeError, Result};
use crate::telemetry::record::PhysicsRecord;

/// Wheel slip above this counts toward the ABS/TC alerts.
///
/// The simulator exposes no explicit "ABS/TC intervening" signal, so the
/// alerts are a heuristic over slip and pedal input. Tuning this threshold
/// changes alert feel only, not any physics.
pub const SLIP_ALERT_THRESHOLD: f32 = 1.0;

/// Wear percentage below which a tire is flagged as worn
pub const LOW_WEAR_THRESHOLD: f32 = 97.9;

/// Wear percentage mapped to an empty display gauge
pub const WEAR_DISPLAY_EMPTY_AT: f32 = 86.0;

/// Damage-zone reading above this raises the damage alert
pub const DAMAGE_ALERT_THRESHOLD: f32 = 0.01;

/// Number of key:value fields in one telemetry packet
const PACKET_FIELDS: usize = 27;

/// Expected field keys, in wire order
const FIELD_KEYS: [&str; PACKET_FIELDS] = [
    "G", "PIT", "ABS", "TC", "RL", "P1", "P2", "T0", "T1", "T2", "T3", "W0", "W1", "W2", "W3",
    "SPD", "RPM", "THR", "BRK", "FUEL", "BST", "ATMP", "RTMP", "DRS", "CLT", "STR", "BTMP",
];

/// Map a raw gear index to its display label.
///
/// 0 is reverse, 1 is neutral, anything else is a forward gear numbered from
/// 1 (raw value minus one).
pub fn gear_label(raw: i32) -> String {
    match raw {
        0 => "R".to_string(),
        1 => "N".to_string(),
        g => (g - 1).to_string(),
    }
}

/// Largest absolute slip value across the four wheels
pub fn max_wheel_slip(slip: &[f32; 4]) -> f32 {
    slip.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Remap a wear percentage onto the 0-100 display gauge.
///
/// Real wear readings live almost entirely in the 86-100 band, so the gauge
/// stretches that band across its full range. Values outside the band clamp.
pub fn wear_display_pct(wear_pct: f32) -> u8 {
    let remapped = (wear_pct - WEAR_DISPLAY_EMPTY_AT) / (100.0 - WEAR_DISPLAY_EMPTY_AT);
    (remapped.clamp(0.0, 1.0) * 100.0).round() as u8
}

/// The derived, device-facing view of one physics snapshot.
///
/// Compared by value against the previously transmitted frame to decide
/// whether a send is due.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardFrame {
    pub gear: String,
    pub pit_limiter: bool,
    pub abs_alert: bool,
    pub tc_alert: bool,
    pub rear_left_low: bool,
    pub tires_out_alert: bool,
    pub damage_alert: bool,
    pub tire_low: [bool; 4],
    pub tire_display_pct: [u8; 4],
    pub speed_kmh: f32,
    pub rpm: i32,
    pub throttle_pct: i32,
    pub brake_pct: i32,
    pub fuel: f32,
    pub turbo_boost: f32,
    pub air_temp: f32,
    pub road_temp: f32,
    pub drs: bool,
    pub clutch_pct: i32,
    pub steer_angle: f32,
    pub brake_temp_avg: f32,
}

impl DashboardFrame {
    /// Derive the dashboard view from a decoded physics record
    pub fn from_record(record: &PhysicsRecord) -> Self {
        let max_slip = max_wheel_slip(&record.wheel_slip);

        // Heuristic proxies for ABS/TC activity: the aid is configured on the
        // car, the wheels are slipping, and the relevant pedal dominates.
        let abs_alert = record.abs > 0.0
            && max_slip > SLIP_ALERT_THRESHOLD
            && record.brake > 0.5
            && record.brake > record.gas;
        let tc_alert = record.tc > 0.0
            && max_slip > SLIP_ALERT_THRESHOLD
            && record.gas > 0.5
            && record.gas > record.brake;

        let mut tire_low = [false; 4];
        let mut tire_display_pct = [0u8; 4];
        for i in 0..4 {
            let wear_pct = record.tire_wear[i].clamp(0.0, 100.0);
            tire_low[i] = wear_pct < LOW_WEAR_THRESHOLD;
            tire_display_pct[i] = wear_display_pct(wear_pct);
        }

        Self {
            gear: gear_label(record.gear),
            pit_limiter: record.pit_limiter_on != 0,
            abs_alert,
            tc_alert,
            rear_left_low: tire_low[2],
            tires_out_alert: record.number_of_tires_out > 0,
            damage_alert: record
                .car_damage
                .iter()
                .any(|d| *d > DAMAGE_ALERT_THRESHOLD),
            tire_low,
            tire_display_pct,
            speed_kmh: record.speed_kmh,
            rpm: record.rpms,
            throttle_pct: (record.gas * 100.0) as i32,
            brake_pct: (record.brake * 100.0) as i32,
            fuel: record.fuel,
            turbo_boost: record.turbo_boost,
            air_temp: record.air_temp,
            road_temp: record.road_temp,
            drs: record.drs_enabled != 0,
            clutch_pct: (record.clutch * 100.0) as i32,
            steer_angle: record.steer_angle,
            brake_temp_avg: record.brake_temp.iter().sum::<f32>() / 4.0,
        }
    }

    /// Encode the frame as one ASCII wire packet
    pub fn encode(&self) -> String {
        format!(
            "G:{}|PIT:{}|ABS:{}|TC:{}|RL:{}|P1:{}|P2:{}|\
             T0:{}|T1:{}|T2:{}|T3:{}|\
             W0:{}|W1:{}|W2:{}|W3:{}|\
             SPD:{:.0}|RPM:{}|THR:{}|BRK:{}|\
             FUEL:{:.1}|BST:{:.2}|ATMP:{:.0}|RTMP:{:.0}|\
             DRS:{}|CLT:{}|STR:{:.2}|BTMP:{:.0}",
            self.gear,
            flag(self.pit_limiter),
            flag(self.abs_alert),
            flag(self.tc_alert),
            flag(self.rear_left_low),
            flag(self.tires_out_alert),
            flag(self.damage_alert),
            flag(self.tire_low[0]),
            flag(self.tire_low[1]),
            flag(self.tire_low[2]),
            flag(self.tire_low[3]),
            self.tire_display_pct[0],
            self.tire_display_pct[1],
            self.tire_display_pct[2],
            self.tire_display_pct[3],
            self.speed_kmh,
            self.rpm,
            self.throttle_pct,
            self.brake_pct,
            self.fuel,
            self.turbo_boost,
            self.air_temp,
            self.road_temp,
            flag(self.drs),
            self.clutch_pct,
            self.steer_angle,
            self.brake_temp_avg,
        )
    }

    /// Parse a wire packet back into a frame.
    ///
    /// Strict about field order and key names; numeric values carry the wire
    /// precision, so `parse(s).encode() == s` for any packet produced by
    /// [`DashboardFrame::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`DashBridgeError::Record`] on a malformed packet.
    pub fn parse(packet: &str) -> Result<Self> {
        let mut values = Vec::with_capacity(PACKET_FIELDS);
        for (i, field) in packet.split('|').enumerate() {
            let (key, value) = field
                .split_once(':')
                .ok_or_else(|| malformed(format!("field {i} has no key: {field:?}")))?;
            match FIELD_KEYS.get(i) {
                Some(expected) if *expected == key => values.push(value),
                Some(expected) => {
                    return Err(malformed(format!(
                        "field {i}: expected key {expected}, got {key}"
                    )))
                }
                None => return Err(malformed("too many fields".to_string())),
            }
        }
        if values.len() != PACKET_FIELDS {
            return Err(malformed(format!(
                "expected {PACKET_FIELDS} fields, got {}",
                values.len()
            )));
        }

        Ok(Self {
            gear: values[0].to_string(),
            pit_limiter: parse_flag(values[1])?,
            abs_alert: parse_flag(values[2])?,
            tc_alert: parse_flag(values[3])?,
            rear_left_low: parse_flag(values[4])?,
            tires_out_alert: parse_flag(values[5])?,
            damage_alert: parse_flag(values[6])?,
            tire_low: [
                parse_flag(values[7])?,
                parse_flag(values[8])?,
                parse_flag(values[9])?,
                parse_flag(values[10])?,
            ],
            tire_display_pct: [
                parse_num(values[11])?,
                parse_num(values[12])?,
                parse_num(values[13])?,
                parse_num(values[14])?,
            ],
            speed_kmh: parse_num(values[15])?,
            rpm: parse_num(values[16])?,
            throttle_pct: parse_num(values[17])?,
            brake_pct: parse_num(values[18])?,
            fuel: parse_num(values[19])?,
            turbo_boost: parse_num(values[20])?,
            air_temp: parse_num(values[21])?,
            road_temp: parse_num(values[22])?,
            drs: parse_flag(values[23])?,
            clutch_pct: parse_num(values[24])?,
            steer_angle: parse_num(values[25])?,
            brake_temp_avg: parse_num(values[26])?,
        })
    }
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

fn malformed(detail: String) -> DashBridgeError {
    DashBridgeError::Record(format!("malformed wire packet: {detail}"))
}

fn parse_flag(value: &str) -> Result<bool> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(malformed(format!("expected 0/1 flag, got {other:?}"))),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| malformed(format!("bad numeric field {value:?}")))
}

/// One display zone of the dashboard layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct LayoutZone {
    #[serde(default)]
    pub primary: Option<String>,

    #[serde(default)]
    pub secondary: Option<String>,
}

/// Dashboard layout: which readouts each of the three zones shows
#[derive(Debug, Clone, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct Layout {
    #[serde(default)]
    pub left: LayoutZone,

    #[serde(default)]
    pub middle: LayoutZone,

    #[serde(default)]
    pub right: LayoutZone,
}

impl Layout {
    /// Encode the layout packet; unset zone fields become the literal `none`
    pub fn encode(&self) -> String {
        format!(
            "LAYOUT:{}|{}|{}",
            zone_str(&self.left),
            zone_str(&self.middle),
            zone_str(&self.right)
        )
    }
}

fn zone_str(zone: &LayoutZone) -> String {
    format!(
        "{},{}",
        zone.primary.as_deref().unwrap_or("none"),
        zone.secondary.as_deref().unwrap_or("none")
    )
}

/// Send a layout packet to the device as a single UDP datagram
pub async fn send_layout(endpoint: SocketAddr, layout: &Layout) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(layout.encode().as_bytes(), endpoint).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::record::PhysicsRecord;

    fn sample_record() -> PhysicsRecord {
        PhysicsRecord {
            gear: 4,
            pit_limiter_on: 1,
            abs: 1.0,
            tc: 1.0,
            gas: 0.2,
            brake: 0.8,
            wheel_slip: [0.1, 0.2, 0.3, 1.4],
            tire_wear: [98.0, 97.5, 96.0, 99.0],
            car_damage: [0.0, 0.0, 0.5, 0.0, 0.0],
            number_of_tires_out: 0,
            speed_kmh: 212.4,
            rpms: 7200,
            fuel: 38.5,
            turbo_boost: 1.25,
            air_temp: 26.0,
            road_temp: 31.0,
            drs_enabled: 1,
            clutch: 0.5,
            steer_angle: -0.12,
            brake_temp: [410.0, 420.0, 380.0, 390.0],
            ..PhysicsRecord::default()
        }
    }

    const GOLDEN_PACKET: &str = "G:3|PIT:1|ABS:1|TC:0|RL:1|P1:0|P2:1|\
        T0:0|T1:1|T2:1|T3:0|W0:86|W1:82|W2:71|W3:93|\
        SPD:212|RPM:7200|THR:20|BRK:80|FUEL:38.5|BST:1.25|ATMP:26|RTMP:31|\
        DRS:1|CLT:50|STR:-0.12|BTMP:400";

    #[test]
    fn test_gear_labels() {
        assert_eq!(gear_label(0), "R");
        assert_eq!(gear_label(1), "N");
        for raw in 2..=8 {
            assert_eq!(gear_label(raw), (raw - 1).to_string());
        }
    }

    #[test]
    fn test_wear_display_remap() {
        assert_eq!(wear_display_pct(97.9), 85);
        assert_eq!(wear_display_pct(86.0), 0);
        assert_eq!(wear_display_pct(100.0), 100);
        // Out of the plausible band clamps instead of extrapolating
        assert_eq!(wear_display_pct(50.0), 0);
    }

    #[test]
    fn test_low_wear_flag_threshold() {
        let mut record = sample_record();
        record.tire_wear = [97.89, 97.9, 150.0, -5.0];
        let frame = DashboardFrame::from_record(&record);
        // 97.9 itself is not low; out-of-range wear clamps to [0, 100] first
        assert_eq!(frame.tire_low, [true, false, false, true]);
        assert_eq!(frame.tire_display_pct[2], 100);
        assert_eq!(frame.tire_display_pct[3], 0);
    }

    #[test]
    fn test_abs_alert_requires_all_conditions() {
        let base = sample_record();
        assert!(DashboardFrame::from_record(&base).abs_alert);

        let mut no_abs = base.clone();
        no_abs.abs = 0.0;
        assert!(!DashboardFrame::from_record(&no_abs).abs_alert);

        let mut no_slip = base.clone();
        no_slip.wheel_slip = [0.2, 0.2, 0.2, 0.9];
        assert!(!DashboardFrame::from_record(&no_slip).abs_alert);

        let mut light_brake = base.clone();
        light_brake.brake = 0.4;
        assert!(!DashboardFrame::from_record(&light_brake).abs_alert);

        let mut throttle_dominates = base.clone();
        throttle_dominates.gas = 0.9;
        assert!(!DashboardFrame::from_record(&throttle_dominates).abs_alert);
    }

    #[test]
    fn test_tc_alert_mirrors_abs_with_throttle() {
        let mut record = sample_record();
        record.gas = 0.9;
        record.brake = 0.1;
        let frame = DashboardFrame::from_record(&record);
        assert!(frame.tc_alert);
        assert!(!frame.abs_alert);

        record.tc = 0.0;
        assert!(!DashboardFrame::from_record(&record).tc_alert);
    }

    #[test]
    fn test_damage_and_tires_out_alerts() {
        let mut record = sample_record();
        assert!(DashboardFrame::from_record(&record).damage_alert);

        record.car_damage = [0.0, 0.009, 0.0, 0.0, 0.0];
        assert!(!DashboardFrame::from_record(&record).damage_alert);

        record.number_of_tires_out = 2;
        assert!(DashboardFrame::from_record(&record).tires_out_alert);
    }

    #[test]
    fn test_golden_packet() {
        let frame = DashboardFrame::from_record(&sample_record());
        assert_eq!(frame.encode(), GOLDEN_PACKET);
    }

    #[test]
    fn test_packet_round_trip() {
        let frame = DashboardFrame::from_record(&sample_record());
        let packet = frame.encode();
        let parsed = DashboardFrame::parse(&packet).unwrap();

        assert_eq!(parsed.encode(), packet);
        assert_eq!(parsed.gear, "3");
        assert_eq!(parsed.tire_display_pct, [86, 82, 71, 93]);
        assert_eq!(parsed.rpm, 7200);
        assert_eq!(parsed.fuel, 38.5);
        assert_eq!(parsed.steer_angle, -0.12);
        assert!(parsed.abs_alert);
        assert!(!parsed.tc_alert);
    }

    #[test]
    fn test_parse_rejects_malformed_packets() {
        assert!(DashboardFrame::parse("").is_err());
        assert!(DashboardFrame::parse("G:3|PIT:1").is_err());
        assert!(DashboardFrame::parse(&GOLDEN_PACKET.replace("RPM:", "RPMS:")).is_err());
        assert!(DashboardFrame::parse(&GOLDEN_PACKET.replace("PIT:1", "PIT:2")).is_err());
        assert!(DashboardFrame::parse(&format!("{GOLDEN_PACKET}|X:1")).is_err());
    }

    #[test]
    fn test_layout_encoding() {
        let layout = Layout {
            left: LayoutZone {
                primary: Some("speed".to_string()),
                secondary: Some("gear".to_string()),
            },
            middle: LayoutZone {
                primary: Some("rpm".to_string()),
                secondary: None,
            },
            right: LayoutZone::default(),
        };
        assert_eq!(layout.encode(), "LAYOUT:speed,gear|rpm,none|none,none");
    }

    #[test]
    fn test_layout_default_is_all_none() {
        assert_eq!(Layout::default().encode(), "LAYOUT:none,none|none,none|none,none");
    }
}
