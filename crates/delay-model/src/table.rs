//! Per-station delay tables.
//!
//! A table is an ordered list of `(time, delay)` rows. A row whose time is
//! zero is a scan break: it closes the current segment and starts a new one.
//! Jobs must never straddle a break, see [`DelayTable::covers`].

use tracing::debug;

use crate::akima::AkimaSpline;
use crate::time::{MICROS_PER_SECOND, Time};
use crate::DelayError;

/// Minimum number of rows a segment needs for Akima interpolation.
pub const MIN_POINTS_PER_SEGMENT: usize = 5;

/// Station clock: `offset + rate * (t - epoch)`, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockModel {
    pub offset_s: f64,
    pub rate: f64,
    pub epoch: Time,
}

impl ClockModel {
    pub fn at(&self, t: Time) -> f64 {
        self.offset_s + self.rate * ((t - self.epoch) as f64 / MICROS_PER_SECOND as f64)
    }
}

/// A contiguous run of delay samples between two scan breaks.
#[derive(Debug, Clone, PartialEq)]
pub struct DelaySegment {
    start: Time,
    stop: Time,
    spline: AkimaSpline,
}

impl DelaySegment {
    fn build(index: usize, rows: &[(Time, f64)]) -> Result<Self, DelayError> {
        if rows.len() < MIN_POINTS_PER_SEGMENT {
            return Err(DelayError::TooFewPoints {
                segment: index,
                points: rows.len(),
                min: MIN_POINTS_PER_SEGMENT,
            });
        }
        if let Some(row) = rows.windows(2).position(|w| w[1].0 <= w[0].0) {
            return Err(DelayError::NotMonotonic {
                segment: index,
                row: row + 1,
            });
        }

        let start = rows[0].0;
        let xs: Vec<f64> = rows
            .iter()
            .map(|(t, _)| (*t - start) as f64 / MICROS_PER_SECOND as f64)
            .collect();
        let ys: Vec<f64> = rows.iter().map(|(_, d)| *d).collect();

        Ok(Self {
            start,
            stop: rows[rows.len() - 1].0,
            spline: AkimaSpline::new(&xs, &ys),
        })
    }

    pub fn start(&self) -> Time {
        self.start
    }

    pub fn stop(&self) -> Time {
        self.stop
    }

    pub fn contains(&self, t: Time) -> bool {
        self.start <= t && t <= self.stop
    }

    fn geometric_delay(&self, t: Time) -> f64 {
        self.spline
            .eval((t - self.start) as f64 / MICROS_PER_SECOND as f64)
    }
}

/// Interpolated delay model for one station.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayTable {
    segments: Vec<DelaySegment>,
    clock: ClockModel,
}

impl DelayTable {
    /// Builds a table from raw rows; rows with a zero time are scan breaks.
    pub fn from_rows(rows: &[(Time, f64)]) -> Result<Self, DelayError> {
        let mut segments = Vec::new();
        for chunk in rows
            .split(|(t, _)| t.as_micros() == 0)
            .filter(|chunk| !chunk.is_empty())
        {
            segments.push(DelaySegment::build(segments.len(), chunk)?);
        }
        if segments.is_empty() {
            return Err(DelayError::Empty);
        }
        debug!(segments = segments.len(), "Built delay table");
        Ok(Self {
            segments,
            clock: ClockModel::default(),
        })
    }

    /// Parses whitespace-separated `time_s delay_s` lines, time in seconds
    /// since the Unix epoch. `#` starts a comment; a `0 0` line is a break.
    pub fn parse_text(text: &str) -> Result<Self, DelayError> {
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(t), Some(d), None) = (fields.next(), fields.next(), fields.next()) else {
                return Err(DelayError::parse(idx + 1, "expected two columns"));
            };
            let t: f64 = t
                .parse()
                .map_err(|e| DelayError::parse(idx + 1, format!("time: {e}")))?;
            let d: f64 = d
                .parse()
                .map_err(|e| DelayError::parse(idx + 1, format!("delay: {e}")))?;
            rows.push((Time::from_seconds(t), d));
        }
        Self::from_rows(&rows)
    }

    /// Samples a delay polynomial `sum c_k (t - epoch)^k` (seconds) over each
    /// window, one segment per window.
    pub fn from_polynomial(
        coeffs: &[f64],
        epoch: Time,
        windows: &[(Time, Time)],
        step_us: i64,
    ) -> Result<Self, DelayError> {
        let eval = |t: Time| {
            let dt = (t - epoch) as f64 / MICROS_PER_SECOND as f64;
            coeffs.iter().rev().fold(0.0, |acc, c| acc * dt + c)
        };

        let mut rows = Vec::new();
        for &(start, stop) in windows {
            let span = (stop - start).max(1);
            // at least MIN_POINTS_PER_SEGMENT rows per window
            let step = step_us
                .min(span / (MIN_POINTS_PER_SEGMENT as i64 - 1))
                .max(1);
            if !rows.is_empty() {
                rows.push((Time::from_micros(0), 0.0));
            }
            let mut t = start;
            while t < stop {
                rows.push((t, eval(t)));
                t = t + step;
            }
            rows.push((stop, eval(stop)));
        }
        Self::from_rows(&rows)
    }

    pub fn with_clock(mut self, clock: ClockModel) -> Self {
        self.clock = clock;
        self
    }

    pub fn segments(&self) -> &[DelaySegment] {
        &self.segments
    }

    pub fn segment_index(&self, t: Time) -> Option<usize> {
        self.segments.iter().position(|s| s.contains(t))
    }

    /// Total delay in seconds (geometric plus clock) at `t`.
    pub fn delay_at(&self, t: Time) -> Result<f64, DelayError> {
        let segment = self
            .segment_index(t)
            .map(|idx| &self.segments[idx])
            .ok_or(DelayError::OutOfRange { time: t })?;
        Ok(segment.geometric_delay(t) + self.clock.at(t))
    }

    /// True when `[start, stop]` lies inside a single segment.
    pub fn covers(&self, start: Time, stop: Time) -> bool {
        self.segments
            .iter()
            .any(|s| s.start <= start && stop <= s.stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rows(start_s: i64, n: usize, slope: f64) -> Vec<(Time, f64)> {
        (0..n)
            .map(|i| {
                let t = Time::from_micros((start_s + i as i64) * MICROS_PER_SECOND);
                (t, 1e-3 + slope * i as f64)
            })
            .collect()
    }

    fn secs(s: i64) -> Time {
        Time::from_micros(s * MICROS_PER_SECOND)
    }

    #[test]
    fn test_linear_delay_interpolation() {
        let table = DelayTable::from_rows(&rows(100, 6, 1e-6)).unwrap();
        let t = secs(102) + 500_000;
        let delay = table.delay_at(t).unwrap();
        assert!((delay - (1e-3 + 2.5e-6)).abs() < 1e-15);
    }

    #[test]
    fn test_too_few_points() {
        let err = DelayTable::from_rows(&rows(100, 4, 0.0)).unwrap_err();
        assert_eq!(
            err,
            DelayError::TooFewPoints {
                segment: 0,
                points: 4,
                min: MIN_POINTS_PER_SEGMENT
            }
        );
    }

    #[test]
    fn test_not_monotonic() {
        let mut r = rows(100, 6, 0.0);
        r.swap(2, 3);
        assert!(matches!(
            DelayTable::from_rows(&r),
            Err(DelayError::NotMonotonic { segment: 0, row: 3 })
        ));
    }

    #[test]
    fn test_scan_breaks_split_segments() {
        let mut r = rows(100, 5, 0.0);
        r.push((Time::from_micros(0), 0.0));
        r.extend(rows(200, 5, 0.0));
        let table = DelayTable::from_rows(&r).unwrap();

        assert_eq!(table.segments().len(), 2);
        assert_eq!(table.segment_index(secs(102)), Some(0));
        assert_eq!(table.segment_index(secs(203)), Some(1));
        assert!(table.delay_at(secs(150)).is_err());
    }

    #[rstest]
    #[case(100, 104, true)]
    #[case(101, 103, true)]
    #[case(103, 201, false)]
    #[case(99, 101, false)]
    #[case(200, 204, true)]
    fn test_covers(#[case] start: i64, #[case] stop: i64, #[case] expected: bool) {
        let mut r = rows(100, 5, 0.0);
        r.push((Time::from_micros(0), 0.0));
        r.extend(rows(200, 5, 0.0));
        let table = DelayTable::from_rows(&r).unwrap();
        assert_eq!(table.covers(secs(start), secs(stop)), expected);
    }

    #[test]
    fn test_clock_model_is_added() {
        let clock = ClockModel {
            offset_s: 2e-6,
            rate: 1e-9,
            epoch: secs(100),
        };
        let table = DelayTable::from_rows(&rows(100, 5, 0.0))
            .unwrap()
            .with_clock(clock);
        let delay = table.delay_at(secs(102)).unwrap();
        assert!((delay - (1e-3 + 2e-6 + 2e-9)).abs() < 1e-15);
    }

    #[test]
    fn test_parse_text() {
        let text = "# station A\n100 0.001\n101 0.001\n102 0.001\n103 0.001\n104 0.001\n0 0\n\
                    200 0.002\n201 0.002\n202 0.002\n203 0.002\n204 0.002 # last\n";
        let table = DelayTable::parse_text(text).unwrap();
        assert_eq!(table.segments().len(), 2);
        assert!((table.delay_at(secs(202)).unwrap() - 0.002).abs() < 1e-15);
    }

    #[test]
    fn test_parse_text_rejects_bad_lines() {
        assert!(matches!(
            DelayTable::parse_text("100 0.1 7\n"),
            Err(DelayError::Parse { line: 1, .. })
        ));
        assert!(matches!(
            DelayTable::parse_text("100 abc\n"),
            Err(DelayError::Parse { line: 1, .. })
        ));
        assert_eq!(DelayTable::parse_text("# only comments\n"), Err(DelayError::Empty));
    }

    #[test]
    fn test_from_polynomial() {
        let epoch = secs(1000);
        let table = DelayTable::from_polynomial(
            &[1e-3, 2e-7],
            epoch,
            &[(secs(1000), secs(1002)), (secs(1010), secs(1020))],
            1_000_000,
        )
        .unwrap();

        assert_eq!(table.segments().len(), 2);
        assert!(table.covers(secs(1000), secs(1002)));
        assert!(!table.covers(secs(1001), secs(1011)));
        let d = table.delay_at(secs(1015)).unwrap();
        assert!((d - (1e-3 + 15.0 * 2e-7)).abs() < 1e-12);
    }
}
