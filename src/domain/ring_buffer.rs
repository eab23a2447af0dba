// Fixed-capacity FIFO history for one device
use crate::domain::telemetry::TelemetryPoint;
use crate::error::{Result, TelemetryError};
use std::collections::VecDeque;

/// Bounded, oldest-evicted-first store of telemetry points for one device.
///
/// Points are kept in arrival order. The buffer never re-sorts: a backdated
/// point lands after newer ones and merely downgrades `range` from binary
/// search to a linear scan.
#[derive(Debug)]
pub struct RingBuffer {
    points: VecDeque<TelemetryPoint>,
    capacity: usize,
    monotonic: bool,
}

impl RingBuffer {
    /// Fails fast on a zero capacity rather than producing a buffer that can
    /// never hold a point.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TelemetryError::InvalidCapacity(capacity));
        }
        Ok(Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            monotonic: true,
        })
    }

    /// Append a point, evicting the single oldest entry when at capacity.
    /// Never fails.
    pub fn append(&mut self, point: TelemetryPoint) {
        if let Some(last) = self.points.back() {
            if point.ts < last.ts {
                self.monotonic = false;
            }
        }
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    /// Full ordered contents, oldest first.
    pub fn points(&self) -> Vec<TelemetryPoint> {
        self.points.iter().cloned().collect()
    }

    /// Contiguous subsequence with `start <= ts <= end`, both endpoints
    /// inclusive. Binary search while timestamps have stayed monotonic,
    /// linear scan once an out-of-order append has been observed.
    pub fn range(&self, start: f64, end: f64) -> Vec<TelemetryPoint> {
        if end < start {
            return Vec::new();
        }
        if self.monotonic {
            let lo = self.points.partition_point(|p| p.ts < start);
            let hi = self.points.partition_point(|p| p.ts <= end);
            self.points.iter().skip(lo).take(hi.saturating_sub(lo)).cloned().collect()
        } else {
            self.points
                .iter()
                .filter(|p| p.ts >= start && p.ts <= end)
                .cloned()
                .collect()
        }
    }

    /// Most recent point, if any.
    pub fn latest(&self) -> Option<&TelemetryPoint> {
        self.points.back()
    }

    /// Empty the buffer. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.points.clear();
        self.monotonic = true;
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(ts: f64) -> TelemetryPoint {
        TelemetryPoint::new(ts, 150.0 + ts, 200.0)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            RingBuffer::new(0),
            Err(TelemetryError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_append_evicts_oldest() {
        let mut buf = RingBuffer::new(3).unwrap();
        for i in 0..5 {
            buf.append(pt(i as f64));
        }
        assert_eq!(buf.len(), 3);
        let ts: Vec<f64> = buf.points().iter().map(|p| p.ts).collect();
        assert_eq!(ts, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_size_bounded_by_capacity() {
        let mut buf = RingBuffer::new(10).unwrap();
        for i in 0..4 {
            buf.append(pt(i as f64));
        }
        assert_eq!(buf.len(), 4);
        for i in 4..25 {
            buf.append(pt(i as f64));
        }
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.capacity(), 10);
    }

    #[test]
    fn test_range_inclusive_both_ends() {
        let mut buf = RingBuffer::new(100).unwrap();
        for i in 0..50 {
            buf.append(pt(i as f64));
        }
        let slice = buf.range(10.0, 20.0);
        assert_eq!(slice.len(), 11);
        assert_eq!(slice.first().unwrap().ts, 10.0);
        assert_eq!(slice.last().unwrap().ts, 20.0);
    }

    #[test]
    fn test_range_linear_fallback_on_out_of_order() {
        let mut buf = RingBuffer::new(100).unwrap();
        buf.append(pt(1.0));
        buf.append(pt(5.0));
        buf.append(pt(3.0)); // backdated, appended in arrival order
        buf.append(pt(6.0));
        let ts: Vec<f64> = buf.points().iter().map(|p| p.ts).collect();
        assert_eq!(ts, vec![1.0, 5.0, 3.0, 6.0]);
        let slice = buf.range(3.0, 5.0);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].ts, 5.0);
        assert_eq!(slice[1].ts, 3.0);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = RingBuffer::new(5).unwrap();
        buf.append(pt(1.0));
        buf.append(pt(2.0));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 5);
        buf.append(pt(3.0));
        assert_eq!(buf.len(), 1);
    }
}
