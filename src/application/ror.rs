// Derived rate-of-rise estimation over noisy telemetry
use crate::domain::telemetry::TelemetryPoint;
use std::collections::VecDeque;

/// Sliding-window estimator parameters.
#[derive(Debug, Clone, Copy)]
pub struct RoRConfig {
    /// Number of most recent samples fitted per output point.
    pub data_window: usize,
    /// Degree of the least-squares polynomial.
    pub poly_degree: usize,
}

impl Default for RoRConfig {
    fn default() -> Self {
        Self {
            data_window: 30,
            poly_degree: 4,
        }
    }
}

/// One derived sample. `value` is `None` when the window held fewer than
/// `poly_degree + 1` points; the estimator never fabricates a zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoRPoint {
    pub ts: f64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoREstimator {
    config: RoRConfig,
}

impl RoREstimator {
    pub fn new(config: RoRConfig) -> Self {
        Self { config }
    }

    /// Estimate d(bean_temp)/dt in degC/min at every input point, each from a
    /// window of the most recent `data_window` samples ending at that point.
    pub fn compute(&self, points: &[TelemetryPoint]) -> Vec<RoRPoint> {
        (0..points.len())
            .map(|i| {
                let start = (i + 1).saturating_sub(self.config.data_window);
                RoRPoint {
                    ts: points[i].ts,
                    value: self.fit_window(&points[start..=i]),
                }
            })
            .collect()
    }

    /// Estimate at the newest sample only.
    pub fn estimate_at_end(&self, points: &[TelemetryPoint]) -> Option<f64> {
        let start = points.len().saturating_sub(self.config.data_window);
        self.fit_window(&points[start..])
    }

    fn fit_window(&self, window: &[TelemetryPoint]) -> Option<f64> {
        let degree = self.config.poly_degree.max(1);
        if window.len() < degree + 1 {
            return None;
        }
        let t0 = window.last()?.ts;
        let samples: Vec<(f64, f64)> = window
            .iter()
            .map(|p| (p.ts - t0, p.bean_temp))
            .collect();
        // Slope at the window end in degC/s, reported in degC/min.
        derivative_at_origin(&samples, degree).map(|s| s * 60.0)
    }
}

/// Least-squares fit of a degree-`degree` polynomial through `samples`
/// (abscissae pre-centered so the evaluation point is x = 0), returning the
/// first derivative at x = 0. `None` when the normal equations are singular,
/// e.g. duplicate timestamps.
fn derivative_at_origin(samples: &[(f64, f64)], degree: usize) -> Option<f64> {
    let m = degree + 1;
    // Normal equations: A[j][k] = sum x^(j+k), b[j] = sum y * x^j.
    let mut powers = vec![0.0f64; 2 * degree + 1];
    let mut b = vec![0.0f64; m];
    for &(x, y) in samples {
        let mut xp = 1.0;
        for (j, slot) in powers.iter_mut().enumerate() {
            *slot += xp;
            if j < m {
                b[j] += y * xp;
            }
            xp *= x;
        }
    }
    let mut a: Vec<Vec<f64>> = (0..m)
        .map(|j| (0..m).map(|k| powers[j + k]).collect())
        .collect();
    let coeffs = solve(&mut a, &mut b)?;
    Some(coeffs[1])
}

/// Gaussian elimination with partial pivoting.
fn solve(a: &mut [Vec<f64>], b: &mut [f64]) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0f64; n];
    for row in (0..n).rev() {
        let mut acc = b[row];
        for k in row + 1..n {
            acc -= a[row][k] * x[k];
        }
        x[row] = acc / a[row][row];
    }
    Some(x)
}

/// Second-stage smoothing applied to the raw derivative before display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    None,
    Simple,
    Exponential,
}

/// Stateful post-filter. Switching `kind` discards the other filter's
/// internal buffer, so the first value after a switch passes through
/// unchanged.
#[derive(Debug, Clone)]
pub struct RoRFilter {
    kind: FilterKind,
    smoothing_window: usize,
    alpha: f64,
    window: VecDeque<f64>,
    ema: Option<f64>,
}

impl RoRFilter {
    pub fn new(kind: FilterKind, smoothing_window: usize, alpha: f64) -> Self {
        Self {
            kind,
            smoothing_window: smoothing_window.max(1),
            alpha,
            window: VecDeque::new(),
            ema: None,
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FilterKind) {
        if kind != self.kind {
            self.window.clear();
            self.ema = None;
            self.kind = kind;
        }
    }

    pub fn apply(&mut self, raw: f64) -> f64 {
        match self.kind {
            FilterKind::None => raw,
            FilterKind::Simple => {
                if self.window.len() == self.smoothing_window {
                    self.window.pop_front();
                }
                self.window.push_back(raw);
                self.window.iter().sum::<f64>() / self.window.len() as f64
            }
            FilterKind::Exponential => {
                let next = match self.ema {
                    None => raw,
                    Some(prev) => self.alpha * raw + (1.0 - self.alpha) * prev,
                };
                self.ema = Some(next);
                next
            }
        }
    }

    /// Filter a derived series in place order. Gaps (`value == None`) pass
    /// through without touching filter state.
    pub fn apply_series(&mut self, series: &[RoRPoint]) -> Vec<RoRPoint> {
        series
            .iter()
            .map(|p| RoRPoint {
                ts: p.ts,
                value: p.value.map(|v| self.apply(v)),
            })
            .collect()
    }
}

impl Default for RoRFilter {
    fn default() -> Self {
        Self::new(FilterKind::None, 5, 0.3)
    }
}

/// Summary of a RoR series, optionally restricted to `ts` in
/// `[range.0, range.1]` for phase-specific views (drying end to first crack
/// and the like). `None` when the selection holds no defined values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseStats {
    pub overall: f64,
    pub max: f64,
    pub min: f64,
}

pub fn phase_stats(series: &[RoRPoint], range: Option<(f64, f64)>) -> Option<PhaseStats> {
    let values: Vec<f64> = series
        .iter()
        .filter(|p| match range {
            Some((start, end)) => p.ts >= start && p.ts <= end,
            None => true,
        })
        .filter_map(|p| p.value)
        .collect();
    if values.is_empty() {
        return None;
    }
    let overall = values.iter().sum::<f64>() / values.len() as f64;
    let max = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    let min = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    Some(PhaseStats { overall, max, min })
}
