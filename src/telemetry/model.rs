//! Telemetry sample types
//!
//! Field names follow the flight controller's telemetry vocabulary so
//! samples can be consumed downstream without renaming.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub relative_altitude_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub temperature_degc: f64,
    pub voltage_v: f64,
    pub remaining_percent: f64,
}

/// Pre-flight sensor checks reported by the flight controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub is_gyrometer_calibration_ok: bool,
    pub is_accelerometer_calibration_ok: bool,
    pub is_magnetometer_calibration_ok: bool,
    pub is_local_position_ok: bool,
    pub is_global_position_ok: bool,
    pub is_home_position_ok: bool,
}

/// Raw velocity in the local north-east-down frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocityNed {
    pub north_m_s: f64,
    pub east_m_s: f64,
    pub down_m_s: f64,
}

impl VelocityNed {
    /// Horizontal speed over ground
    pub fn ground_speed(&self) -> f64 {
        self.north_m_s.hypot(self.east_m_s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub ground_speed_ms: f64,
    pub heading_deg: f64,
}

/// One combined sample as published to the telemetry topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryData {
    pub device_name: String,
    pub timestamp: DateTime<Utc>,
    pub position: Position,
    pub battery: Battery,
    pub health: Health,
    pub velocity: Velocity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_speed_ignores_vertical_component() {
        let v = VelocityNed {
            north_m_s: 3.0,
            east_m_s: 4.0,
            down_m_s: -12.0,
        };
        assert_eq!(v.ground_speed(), 5.0);
    }
}
