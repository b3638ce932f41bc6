//! # Physics Record Decode
//!
//! Decodes the fixed-layout binary physics record the simulator publishes
//! through its shared memory region.
//!
//! The layout is owned by the simulator: 4-byte packed, little-endian, every
//! field 4 bytes wide (`i32`/`f32`/arrays thereof). Field order below must
//! stay bit-exact with the producer; any drift is a hard compatibility
//! failure, not something that can be papered over at decode time.

use bytes::Buf;

use crate::error::{DashBridgeError, Result};

/// Number of 4-byte slots in the physics record
const RECORD_SLOTS: usize = 92;

/// Exact size in bytes of one physics record
pub const RECORD_SIZE: usize = RECORD_SLOTS * 4;

/// One decoded snapshot of simulator physics state.
///
/// Immutable after decode. Fields are declared in wire order; unused fields
/// are still decoded so the layout contract stays visible in one place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicsRecord {
    pub packet_id: i32,
    pub gas: f32,
    pub brake: f32,
    pub fuel: f32,
    pub gear: i32,
    pub rpms: i32,
    pub steer_angle: f32,
    pub speed_kmh: f32,
    pub velocity: [f32; 3],
    pub acc_g: [f32; 3],
    pub wheel_slip: [f32; 4],
    pub wheel_load: [f32; 4],
    pub wheels_pressure: [f32; 4],
    pub wheel_angular_speed: [f32; 4],
    pub tire_wear: [f32; 4],
    pub tire_dirty_level: [f32; 4],
    pub tire_core_temp: [f32; 4],
    pub camber_rad: [f32; 4],
    pub suspension_travel: [f32; 4],
    pub drs: f32,
    pub tc: f32,
    pub heading: f32,
    pub pitch: f32,
    pub roll: f32,
    pub cg_height: f32,
    pub car_damage: [f32; 5],
    pub number_of_tires_out: i32,
    pub pit_limiter_on: i32,
    pub abs: f32,
    pub kers_charge: f32,
    pub kers_input: f32,
    pub auto_shifter_on: i32,
    pub ride_height: [f32; 2],
    pub turbo_boost: f32,
    pub ballast: f32,
    pub air_density: f32,
    pub air_temp: f32,
    pub road_temp: f32,
    pub local_angular_vel: [f32; 3],
    pub final_ff: f32,
    pub performance_meter: f32,
    pub engine_brake: i32,
    pub ers_recovery_level: i32,
    pub ers_power_level: i32,
    pub ers_heat_charging: i32,
    pub ers_is_charging: i32,
    pub kers_current_kj: f32,
    pub drs_available: i32,
    pub drs_enabled: i32,
    pub brake_temp: [f32; 4],
    pub clutch: f32,
}

impl PhysicsRecord {
    /// Decode one physics record from a raw shared-memory snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DashBridgeError::Record`] if `data` is shorter than
    /// [`RECORD_SIZE`].
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_SIZE {
            return Err(DashBridgeError::Record(format!(
                "record too short: expected {} bytes, got {}",
                RECORD_SIZE,
                data.len()
            )));
        }

        let mut buf = &data[..RECORD_SIZE];

        // Struct literal fields evaluate in declaration order, which matches
        // the wire order, so the sequential reads below line up exactly.
        Ok(Self {
            packet_id: buf.get_i32_le(),
            gas: buf.get_f32_le(),
            brake: buf.get_f32_le(),
            fuel: buf.get_f32_le(),
            gear: buf.get_i32_le(),
            rpms: buf.get_i32_le(),
            steer_angle: buf.get_f32_le(),
            speed_kmh: buf.get_f32_le(),
            velocity: f32_array(&mut buf),
            acc_g: f32_array(&mut buf),
            wheel_slip: f32_array(&mut buf),
            wheel_load: f32_array(&mut buf),
            wheels_pressure: f32_array(&mut buf),
            wheel_angular_speed: f32_array(&mut buf),
            tire_wear: f32_array(&mut buf),
            tire_dirty_level: f32_array(&mut buf),
            tire_core_temp: f32_array(&mut buf),
            camber_rad: f32_array(&mut buf),
            suspension_travel: f32_array(&mut buf),
            drs: buf.get_f32_le(),
            tc: buf.get_f32_le(),
            heading: buf.get_f32_le(),
            pitch: buf.get_f32_le(),
            roll: buf.get_f32_le(),
            cg_height: buf.get_f32_le(),
            car_damage: f32_array(&mut buf),
            number_of_tires_out: buf.get_i32_le(),
            pit_limiter_on: buf.get_i32_le(),
            abs: buf.get_f32_le(),
            kers_charge: buf.get_f32_le(),
            kers_input: buf.get_f32_le(),
            auto_shifter_on: buf.get_i32_le(),
            ride_height: f32_array(&mut buf),
            turbo_boost: buf.get_f32_le(),
            ballast: buf.get_f32_le(),
            air_density: buf.get_f32_le(),
            air_temp: buf.get_f32_le(),
            road_temp: buf.get_f32_le(),
            local_angular_vel: f32_array(&mut buf),
            final_ff: buf.get_f32_le(),
            performance_meter: buf.get_f32_le(),
            engine_brake: buf.get_i32_le(),
            ers_recovery_level: buf.get_i32_le(),
            ers_power_level: buf.get_i32_le(),
            ers_heat_charging: buf.get_i32_le(),
            ers_is_charging: buf.get_i32_le(),
            kers_current_kj: buf.get_f32_le(),
            drs_available: buf.get_i32_le(),
            drs_enabled: buf.get_i32_le(),
            brake_temp: f32_array(&mut buf),
            clutch: buf.get_f32_le(),
        })
    }
}

fn f32_array<const N: usize>(buf: &mut &[u8]) -> [f32; N] {
    let mut out = [0.0; N];
    for value in &mut out {
        *value = buf.get_f32_le();
    }
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::RECORD_SIZE;

    /// Incrementally builds a raw physics record for tests, writing fields in
    /// the same wire order the decoder reads them.
    pub struct RecordBuilder {
        data: Vec<u8>,
    }

    impl RecordBuilder {
        pub fn new() -> Self {
            Self {
                data: Vec::with_capacity(RECORD_SIZE),
            }
        }

        pub fn i32(mut self, value: i32) -> Self {
            self.data.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn f32(mut self, value: f32) -> Self {
            self.data.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn f32s(mut self, values: &[f32]) -> Self {
            for v in values {
                self.data.extend_from_slice(&v.to_le_bytes());
            }
            self
        }

        /// Zero-fill up to the full record size and return the raw bytes
        pub fn finish(mut self) -> Vec<u8> {
            assert!(self.data.len() <= RECORD_SIZE, "builder overflowed record");
            self.data.resize(RECORD_SIZE, 0);
            self.data
        }
    }
}
