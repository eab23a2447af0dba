// Telemetry domain models
use serde::{Deserialize, Serialize};

/// Controller operating mode reported by the roaster firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Auto,
    Manual,
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::Auto
    }
}

/// One timestamped sample from a roaster device.
///
/// `ts` is seconds since the Unix epoch. Within a device's buffer it rises
/// monotonically under normal operation, but arrival order is preserved even
/// when a late point violates that (see `RingBuffer::append`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub ts: f64,
    pub bean_temp: f64,
    pub env_temp: f64,
    pub setpoint: Option<f64>,
    pub fan_pwm: Option<u16>,
    pub heater_pwm: Option<u8>,
    pub control_mode: ControlMode,
    pub heater_enable: bool,
    /// Device-reported rate of rise in degC/min. Distinct from the estimate
    /// derived by `RoREstimator`.
    pub rate_of_rise: Option<f64>,
    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub kd: Option<f64>,
}

impl TelemetryPoint {
    /// A point carrying only the always-present fields; the rest default to
    /// absent. Mostly useful as a base to build fuller samples from.
    pub fn new(ts: f64, bean_temp: f64, env_temp: f64) -> Self {
        Self {
            ts,
            bean_temp,
            env_temp,
            setpoint: None,
            fan_pwm: None,
            heater_pwm: None,
            control_mode: ControlMode::default(),
            heater_enable: false,
            rate_of_rise: None,
            kp: None,
            ki: None,
            kd: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let p = TelemetryPoint::new(100.0, 180.5, 210.0);
        assert_eq!(p.ts, 100.0);
        assert_eq!(p.bean_temp, 180.5);
        assert_eq!(p.control_mode, ControlMode::Auto);
        assert!(p.setpoint.is_none());
        assert!(!p.heater_enable);
    }
}
