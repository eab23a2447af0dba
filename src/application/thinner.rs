// Adaptive downsampling of point series for chart rendering
use crate::domain::telemetry::TelemetryPoint;

/// How a series is reduced to the render budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinningMode {
    /// Keep every `ceil(n / budget)`-th point. Deterministic fallback.
    Stride,
    /// Keep points where a tracked field moved past the threshold since the
    /// last kept point, with a bounded gap between kept points.
    ChangeThreshold,
}

#[derive(Debug, Clone, Copy)]
pub struct ThinnerConfig {
    /// Minimum movement (degC for temperatures, raw units for PWM) that makes
    /// a point worth keeping.
    pub change_threshold: f64,
}

impl Default for ThinnerConfig {
    fn default() -> Self {
        Self {
            change_threshold: 0.5,
        }
    }
}

/// Reduced series plus how aggressively it was cut.
#[derive(Debug, Clone)]
pub struct ThinnedSeries {
    pub points: Vec<TelemetryPoint>,
    /// `output_len / input_len`; 1.0 when nothing was dropped.
    pub compression_ratio: f64,
}

/// Reduce `points` to at most `budget` points, preserving order and always
/// retaining the first and last input point when the input is non-empty.
pub fn thin(
    points: &[TelemetryPoint],
    budget: usize,
    mode: ThinningMode,
    config: &ThinnerConfig,
) -> ThinnedSeries {
    if points.is_empty() || budget == 0 {
        return ThinnedSeries {
            points: Vec::new(),
            compression_ratio: 1.0,
        };
    }
    if points.len() <= budget {
        return ThinnedSeries {
            points: points.to_vec(),
            compression_ratio: 1.0,
        };
    }

    let kept = match mode {
        ThinningMode::Stride => stride(points, budget),
        ThinningMode::ChangeThreshold => {
            let by_change = change_threshold(points, budget, config);
            // The threshold walk can still overshoot a tight budget on busy
            // data; decimate its output as a final clamp.
            if by_change.len() > budget {
                stride(&by_change, budget)
            } else {
                by_change
            }
        }
    };

    let ratio = kept.len() as f64 / points.len() as f64;
    ThinnedSeries {
        points: kept,
        compression_ratio: ratio,
    }
}

fn stride(points: &[TelemetryPoint], budget: usize) -> Vec<TelemetryPoint> {
    let step = points.len().div_ceil(budget);
    let mut kept: Vec<TelemetryPoint> = points.iter().step_by(step).cloned().collect();
    // step_by starts at index 0; make sure the final point survives by
    // replacing the last pick rather than growing past the budget.
    if let (Some(slot), Some(last)) = (kept.last_mut(), points.last()) {
        if slot.ts != last.ts {
            *slot = last.clone();
        }
    }
    kept
}

fn change_threshold(
    points: &[TelemetryPoint],
    budget: usize,
    config: &ThinnerConfig,
) -> Vec<TelemetryPoint> {
    let max_gap = points.len().div_ceil(budget).max(1);
    let mut kept = vec![points[0].clone()];
    let mut anchor = points[0].clone();
    let mut skipped = 0usize;
    for point in &points[1..points.len() - 1] {
        if skipped + 1 >= max_gap || significant_change(&anchor, point, config.change_threshold) {
            kept.push(point.clone());
            anchor = point.clone();
            skipped = 0;
        } else {
            skipped += 1;
        }
    }
    kept.push(points[points.len() - 1].clone());
    kept
}

fn significant_change(prev: &TelemetryPoint, cur: &TelemetryPoint, threshold: f64) -> bool {
    let moved = |a: f64, b: f64| (a - b).abs() > threshold;
    let opt_moved = |a: Option<f64>, b: Option<f64>| match (a, b) {
        (Some(a), Some(b)) => moved(a, b),
        (None, None) => false,
        _ => true,
    };
    moved(prev.bean_temp, cur.bean_temp)
        || moved(prev.env_temp, cur.env_temp)
        || opt_moved(prev.setpoint, cur.setpoint)
        || opt_moved(
            prev.fan_pwm.map(f64::from),
            cur.fan_pwm.map(f64::from),
        )
        || opt_moved(
            prev.heater_pwm.map(f64::from),
            cur.heater_pwm.map(f64::from),
        )
        || prev.control_mode != cur.control_mode
        || prev.heater_enable != cur.heater_enable
}
