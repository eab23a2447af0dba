// Delta/quantized encoding of point sequences for durable snapshots
use crate::domain::telemetry::{ControlMode, TelemetryPoint};
use serde::{Deserialize, Serialize};

/// Quantization unit for temperature-like fields, in degC.
pub const DEFAULT_PRECISION: f64 = 0.1;

/// Timestamps are quantized to milliseconds regardless of field precision.
const TS_PRECISION: f64 = 1e-3;

/// Rolling cursor for incremental encoding of one device's history.
///
/// `last_point` is the last point already encoded, held in quantized form so
/// encoder and decoder advance through identical states. `base_timestamp` is
/// the delta reference for the first record ever encoded, and the age used
/// for retention pruning of persisted entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionState {
    pub last_point: Option<TelemetryPoint>,
    pub base_timestamp: f64,
}

impl CompressionState {
    pub fn new(base_timestamp: f64) -> Self {
        Self {
            last_point: None,
            base_timestamp,
        }
    }
}

/// One encoded point. Numeric fields are stored as quantized deltas against
/// the previous point (or zero where the previous point lacked the field);
/// `dt` is millisecond ticks since the previous point's timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedRecord {
    pub dt: i64,
    pub bean: i64,
    pub env: i64,
    pub set: Option<i64>,
    pub fan: Option<i32>,
    pub heater: Option<i32>,
    pub mode: ControlMode,
    pub heater_enable: bool,
    pub ror: Option<i64>,
    pub kp: Option<i64>,
    pub ki: Option<i64>,
    pub kd: Option<i64>,
}

/// A self-ordered run of encoded points. Decoding requires the
/// `CompressionState` as it was when the block was encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedBlock {
    pub base_timestamp: f64,
    pub precision: f64,
    pub records: Vec<EncodedRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionCodec {
    precision: f64,
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PRECISION)
    }
}

fn quantize(value: f64, precision: f64) -> i64 {
    (value / precision).round() as i64
}

fn dequantize(ticks: i64, precision: f64) -> f64 {
    ticks as f64 * precision
}

impl CompressionCodec {
    pub fn new(precision: f64) -> Self {
        Self { precision }
    }

    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Encode `points` incrementally against `state`, returning the block and
    /// the advanced cursor. The input is not re-scanned: callers pass only
    /// points not yet covered by `state.last_point`.
    pub fn encode(
        &self,
        points: &[TelemetryPoint],
        state: &CompressionState,
    ) -> (EncodedBlock, CompressionState) {
        let mut next = state.clone();
        let mut records = Vec::with_capacity(points.len());
        for point in points {
            records.push(self.encode_record(point, &next));
            next.last_point = Some(self.quantized(point));
        }
        let block = EncodedBlock {
            base_timestamp: state.base_timestamp,
            precision: self.precision,
            records,
        };
        (block, next)
    }

    /// Exact inverse of `encode` given the same starting `state`, up to the
    /// stated quantization. Also returns the advanced cursor so chained
    /// blocks decode sequentially.
    pub fn decode(
        &self,
        block: &EncodedBlock,
        state: &CompressionState,
    ) -> (Vec<TelemetryPoint>, CompressionState) {
        let mut next = state.clone();
        let mut points = Vec::with_capacity(block.records.len());
        for record in &block.records {
            let point = self.decode_record(record, &next, block.precision);
            next.last_point = Some(point.clone());
            points.push(point);
        }
        (points, next)
    }

    fn quantized(&self, p: &TelemetryPoint) -> TelemetryPoint {
        let q = |v: f64| dequantize(quantize(v, self.precision), self.precision);
        TelemetryPoint {
            ts: dequantize(quantize(p.ts, TS_PRECISION), TS_PRECISION),
            bean_temp: q(p.bean_temp),
            env_temp: q(p.env_temp),
            setpoint: p.setpoint.map(q),
            fan_pwm: p.fan_pwm,
            heater_pwm: p.heater_pwm,
            control_mode: p.control_mode,
            heater_enable: p.heater_enable,
            rate_of_rise: p.rate_of_rise.map(q),
            kp: p.kp.map(q),
            ki: p.ki.map(q),
            kd: p.kd.map(q),
        }
    }

    fn encode_record(&self, p: &TelemetryPoint, state: &CompressionState) -> EncodedRecord {
        let prec = self.precision;
        let prev = state.last_point.as_ref();
        let prev_ts = prev.map(|l| l.ts).unwrap_or(state.base_timestamp);
        let delta = |cur: f64, prev: Option<f64>| {
            quantize(cur, prec) - prev.map(|v| quantize(v, prec)).unwrap_or(0)
        };
        EncodedRecord {
            dt: quantize(p.ts, TS_PRECISION) - quantize(prev_ts, TS_PRECISION),
            bean: delta(p.bean_temp, prev.map(|l| l.bean_temp)),
            env: delta(p.env_temp, prev.map(|l| l.env_temp)),
            set: p.setpoint.map(|v| delta(v, prev.and_then(|l| l.setpoint))),
            fan: p
                .fan_pwm
                .map(|v| v as i32 - prev.and_then(|l| l.fan_pwm).unwrap_or(0) as i32),
            heater: p
                .heater_pwm
                .map(|v| v as i32 - prev.and_then(|l| l.heater_pwm).unwrap_or(0) as i32),
            mode: p.control_mode,
            heater_enable: p.heater_enable,
            ror: p
                .rate_of_rise
                .map(|v| delta(v, prev.and_then(|l| l.rate_of_rise))),
            kp: p.kp.map(|v| delta(v, prev.and_then(|l| l.kp))),
            ki: p.ki.map(|v| delta(v, prev.and_then(|l| l.ki))),
            kd: p.kd.map(|v| delta(v, prev.and_then(|l| l.kd))),
        }
    }

    fn decode_record(
        &self,
        r: &EncodedRecord,
        state: &CompressionState,
        precision: f64,
    ) -> TelemetryPoint {
        let prev = state.last_point.as_ref();
        let prev_ts = prev.map(|l| l.ts).unwrap_or(state.base_timestamp);
        let undelta = |d: i64, prev: Option<f64>| {
            dequantize(prev.map(|v| quantize(v, precision)).unwrap_or(0) + d, precision)
        };
        TelemetryPoint {
            ts: dequantize(quantize(prev_ts, TS_PRECISION) + r.dt, TS_PRECISION),
            bean_temp: undelta(r.bean, prev.map(|l| l.bean_temp)),
            env_temp: undelta(r.env, prev.map(|l| l.env_temp)),
            setpoint: r.set.map(|d| undelta(d, prev.and_then(|l| l.setpoint))),
            fan_pwm: r
                .fan
                .map(|d| (prev.and_then(|l| l.fan_pwm).unwrap_or(0) as i32 + d) as u16),
            heater_pwm: r
                .heater
                .map(|d| (prev.and_then(|l| l.heater_pwm).unwrap_or(0) as i32 + d) as u8),
            control_mode: r.mode,
            heater_enable: r.heater_enable,
            rate_of_rise: r.ror.map(|d| undelta(d, prev.and_then(|l| l.rate_of_rise))),
            kp: r.kp.map(|d| undelta(d, prev.and_then(|l| l.kp))),
            ki: r.ki.map(|d| undelta(d, prev.and_then(|l| l.ki))),
            kd: r.kd.map(|d| undelta(d, prev.and_then(|l| l.kd))),
        }
    }
}
