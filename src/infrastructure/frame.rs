// Wire-frame parsing and normalization at the stream boundary
//
// The roaster firmware publishes camelCase keys ("beanTemp"), while rows
// replayed from the history API carry snake_case ("bean_temp"). Both map
// into the one canonical TelemetryPoint here and nowhere else.
use crate::domain::telemetry::{ControlMode, TelemetryPoint};
use crate::error::{Result, TelemetryError};
use serde::Deserialize;

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Heartbeat acknowledgement; consumed silently.
    Pong,
    Telemetry {
        device_id: String,
        point: TelemetryPoint,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    device_id: Option<String>,
    telemetry: Option<WireTelemetry>,
}

/// Telemetry payload as it appears on the wire, tolerant of both historical
/// field-naming conventions.
#[derive(Debug, Deserialize)]
pub struct WireTelemetry {
    #[serde(default, alias = "timestamp")]
    pub ts: Option<f64>,
    #[serde(default, rename = "beanTemp", alias = "bean_temp")]
    pub bean_temp: Option<f64>,
    #[serde(default, rename = "envTemp", alias = "env_temp")]
    pub env_temp: Option<f64>,
    #[serde(default)]
    pub setpoint: Option<f64>,
    #[serde(default, rename = "fanPWM", alias = "fan_pwm")]
    pub fan_pwm: Option<u16>,
    #[serde(default, rename = "heaterPWM", alias = "heater_pwm")]
    pub heater_pwm: Option<u8>,
    #[serde(default, rename = "controlMode", alias = "control_mode")]
    pub control_mode: Option<WireMode>,
    #[serde(default, rename = "heaterEnable", alias = "heater_enable")]
    pub heater_enable: Option<WireFlag>,
    #[serde(default, rename = "rateOfRise", alias = "rate_of_rise")]
    pub rate_of_rise: Option<f64>,
    #[serde(default, rename = "Kp", alias = "kp")]
    pub kp: Option<f64>,
    #[serde(default, rename = "Ki", alias = "ki")]
    pub ki: Option<f64>,
    #[serde(default, rename = "Kd", alias = "kd")]
    pub kd: Option<f64>,
}

/// Control mode arrives as "auto"/"manual" from the API path and as 1/0
/// from the firmware.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireMode {
    Text(String),
    Num(i64),
}

/// Booleans arrive as true/false or 1/0.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireFlag {
    Bool(bool),
    Num(i64),
}

impl WireMode {
    fn normalize(&self) -> Result<ControlMode> {
        match self {
            WireMode::Text(s) => match s.to_lowercase().as_str() {
                "auto" => Ok(ControlMode::Auto),
                "manual" => Ok(ControlMode::Manual),
                other => Err(TelemetryError::MalformedFrame(format!(
                    "unknown control mode '{other}'"
                ))),
            },
            WireMode::Num(1) => Ok(ControlMode::Auto),
            WireMode::Num(0) => Ok(ControlMode::Manual),
            WireMode::Num(other) => Err(TelemetryError::MalformedFrame(format!(
                "unknown control mode {other}"
            ))),
        }
    }
}

impl WireFlag {
    fn as_bool(&self) -> bool {
        match self {
            WireFlag::Bool(b) => *b,
            WireFlag::Num(n) => *n != 0,
        }
    }
}

impl WireTelemetry {
    /// Map either naming convention into the canonical point. `received_at`
    /// stands in for a missing or zero device timestamp (the firmware
    /// reports uptime-relative zeros until it has synced its clock).
    pub fn normalize(self, received_at: f64) -> Result<TelemetryPoint> {
        let bean_temp = self.bean_temp.ok_or_else(|| {
            TelemetryError::MalformedFrame("missing bean temperature".to_string())
        })?;
        let env_temp = self
            .env_temp
            .ok_or_else(|| TelemetryError::MalformedFrame("missing env temperature".to_string()))?;
        let ts = match self.ts {
            Some(t) if t > 0.0 => t,
            _ => received_at,
        };
        Ok(TelemetryPoint {
            ts,
            bean_temp,
            env_temp,
            setpoint: self.setpoint,
            fan_pwm: self.fan_pwm,
            heater_pwm: self.heater_pwm,
            control_mode: self
                .control_mode
                .map(|m| m.normalize())
                .transpose()?
                .unwrap_or_default(),
            heater_enable: self.heater_enable.map(|f| f.as_bool()).unwrap_or(false),
            rate_of_rise: self.rate_of_rise,
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
        })
    }
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str, received_at: f64) -> Result<InboundFrame> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|e| TelemetryError::MalformedFrame(e.to_string()))?;
    if raw.kind.as_deref() == Some("pong") {
        return Ok(InboundFrame::Pong);
    }
    match (raw.device_id, raw.telemetry) {
        (Some(device_id), Some(telemetry)) => Ok(InboundFrame::Telemetry {
            point: telemetry.normalize(received_at)?,
            device_id,
        }),
        _ => Err(TelemetryError::MalformedFrame(
            "missing device_id or telemetry".to_string(),
        )),
    }
}

/// Outbound heartbeat frame.
pub fn ping_frame() -> String {
    serde_json::json!({ "type": "ping" }).to_string()
}

/// Typed control command for a device, validated against the firmware's
/// accepted ranges before it reaches the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Setpoint(f64),
    FanPwm(u16),
    HeaterPwm(u8),
    Mode(ControlMode),
    HeaterEnable(bool),
    Pid { kp: f64, ki: f64, kd: f64 },
    EmergencyStop,
}

impl DeviceCommand {
    pub fn validate(&self) -> Result<()> {
        match self {
            DeviceCommand::Setpoint(v) if !(0.0..=300.0).contains(v) => Err(
                TelemetryError::InvalidCommand(format!("setpoint {v} outside 0..=300 C")),
            ),
            DeviceCommand::FanPwm(v) if *v > 255 => Err(TelemetryError::InvalidCommand(
                format!("fan pwm {v} outside 0..=255"),
            )),
            DeviceCommand::HeaterPwm(v) if *v > 100 => Err(TelemetryError::InvalidCommand(
                format!("heater pwm {v} outside 0..=100"),
            )),
            _ => Ok(()),
        }
    }
}

/// Outbound command frame.
pub fn command_frame(device_id: &str, command: &DeviceCommand) -> String {
    let body = match command {
        DeviceCommand::Setpoint(v) => serde_json::json!({ "type": "setpoint", "value": v }),
        DeviceCommand::FanPwm(v) => serde_json::json!({ "type": "fan_pwm", "value": v }),
        DeviceCommand::HeaterPwm(v) => serde_json::json!({ "type": "heater_pwm", "value": v }),
        DeviceCommand::Mode(mode) => serde_json::json!({
            "type": "mode",
            "mode": match mode { ControlMode::Auto => "auto", ControlMode::Manual => "manual" },
        }),
        DeviceCommand::HeaterEnable(enabled) => {
            serde_json::json!({ "type": "heater_enable", "enabled": enabled })
        }
        DeviceCommand::Pid { kp, ki, kd } => {
            serde_json::json!({ "type": "pid", "kp": kp, "ki": ki, "kd": kd })
        }
        DeviceCommand::EmergencyStop => serde_json::json!({ "type": "emergency_stop" }),
    };
    serde_json::json!({ "device_id": device_id, "command": body }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_firmware_frame_camel_case() {
        let text = r#"{
            "device_id": "roaster-1",
            "telemetry": {
                "timestamp": 1700000000,
                "beanTemp": 182.4,
                "envTemp": 210.1,
                "rateOfRise": 11.5,
                "heaterPWM": 55,
                "fanPWM": 180,
                "setpoint": 200.0,
                "controlMode": 1,
                "heaterEnable": 1,
                "Kp": 15.0,
                "Ki": 1.0,
                "Kd": 25.0
            }
        }"#;
        let frame = parse_frame(text, 0.0).unwrap();
        let InboundFrame::Telemetry { device_id, point } = frame else {
            panic!("expected telemetry frame");
        };
        assert_eq!(device_id, "roaster-1");
        assert_eq!(point.ts, 1_700_000_000.0);
        assert_eq!(point.bean_temp, 182.4);
        assert_eq!(point.fan_pwm, Some(180));
        assert_eq!(point.control_mode, ControlMode::Auto);
        assert!(point.heater_enable);
        assert_eq!(point.kp, Some(15.0));
    }

    #[test]
    fn test_parse_history_frame_snake_case() {
        let text = r#"{
            "device_id": "roaster-1",
            "telemetry": {
                "ts": 1700000042,
                "bean_temp": 190.0,
                "env_temp": 215.0,
                "rate_of_rise": 9.0,
                "heater_pwm": 60,
                "fan_pwm": 200,
                "control_mode": "manual",
                "heater_enable": true
            }
        }"#;
        let frame = parse_frame(text, 0.0).unwrap();
        let InboundFrame::Telemetry { point, .. } = frame else {
            panic!("expected telemetry frame");
        };
        assert_eq!(point.control_mode, ControlMode::Manual);
        assert_eq!(point.heater_pwm, Some(60));
        assert!(point.heater_enable);
    }

    #[test]
    fn test_zero_timestamp_falls_back_to_receive_time() {
        let text = r#"{"device_id":"r1","telemetry":{"timestamp":0,"beanTemp":100.0,"envTemp":90.0}}"#;
        let InboundFrame::Telemetry { point, .. } = parse_frame(text, 1234.5).unwrap() else {
            panic!("expected telemetry frame");
        };
        assert_eq!(point.ts, 1234.5);
    }

    #[test]
    fn test_pong_is_recognized() {
        assert_eq!(parse_frame(r#"{"type":"pong"}"#, 0.0).unwrap(), InboundFrame::Pong);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(parse_frame("not json", 0.0).is_err());
        assert!(parse_frame(r#"{"device_id":"r1"}"#, 0.0).is_err());
        // Missing bean temperature.
        assert!(parse_frame(r#"{"device_id":"r1","telemetry":{"envTemp":90.0}}"#, 0.0).is_err());
        // Unknown control mode value.
        assert!(parse_frame(
            r#"{"device_id":"r1","telemetry":{"beanTemp":1.0,"envTemp":2.0,"controlMode":7}}"#,
            0.0
        )
        .is_err());
    }

    #[test]
    fn test_command_validation_ranges() {
        assert!(DeviceCommand::Setpoint(200.0).validate().is_ok());
        assert!(DeviceCommand::Setpoint(301.0).validate().is_err());
        assert!(DeviceCommand::FanPwm(255).validate().is_ok());
        assert!(DeviceCommand::FanPwm(256).validate().is_err());
        assert!(DeviceCommand::HeaterPwm(100).validate().is_ok());
        assert!(DeviceCommand::HeaterPwm(101).validate().is_err());
        assert!(DeviceCommand::EmergencyStop.validate().is_ok());
    }

    #[test]
    fn test_frames_serialize() {
        assert_eq!(ping_frame(), r#"{"type":"ping"}"#);
        let frame = command_frame("r1", &DeviceCommand::Mode(ControlMode::Auto));
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["device_id"], "r1");
        assert_eq!(value["command"]["mode"], "auto");
    }
}
