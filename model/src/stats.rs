//! Statistical summaries of numeric readings.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Descriptive statistics of a set of readings.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (with Bessel's correction). 0 for a single reading.
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

/// Summarize `values`, or return [`None`] if there are none.
pub fn summarize(values: &[f64]) -> Option<Summary> {
    let (&first, rest) = values.split_first()?;
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let std_dev = if count > 1 {
        let ss = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
        (ss / (count - 1) as f64).sqrt()
    } else {
        0.0
    };
    let (min, max) = rest
        .iter()
        .fold((first, first), |(min, max), &v| (min.min(v), max.max(v)));
    Some(Summary {
        count,
        mean,
        std_dev,
        min,
        max,
        range: max - min,
    })
}

/// The outcome of checking a reading against its limits.
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Deserialize, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// The reading has no limits to check against.
    Unchecked,
}

/// Inclusive acceptance limits. Either bound may be absent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Limits {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Limits {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { lower, upper }
    }

    pub fn between(lower: f64, upper: f64) -> Self {
        Self::new(Some(lower), Some(upper))
    }

    pub fn is_open(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn check(&self, value: f64) -> Verdict {
        if self.is_open() {
            return Verdict::Unchecked;
        }
        let above = self.lower.map_or(true, |lower| value >= lower);
        let below = self.upper.map_or(true, |upper| value <= upper);
        if above && below {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

/// An item together with the verdict of checking it against its limits.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Checked<T> {
    #[serde(flatten)]
    pub item: T,
    pub verdict: Verdict,
}

/// Percentage of `passed` out of `total`, or [`None`] if `total` is 0.
pub fn pass_rate(passed: usize, total: usize) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(100.0 * passed as f64 / total as f64)
    }
}

/// Process capability indices.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Capability {
    pub cp: f64,
    pub cpk: f64,
}

/// Compute Cp and Cpk of a process against two-sided limits.
///
/// Returns [`None`] unless both limits are set and the summary has at least two readings with
/// some spread.
pub fn capability(summary: &Summary, limits: &Limits) -> Option<Capability> {
    let (lower, upper) = (limits.lower?, limits.upper?);
    if summary.count < 2 || summary.std_dev <= 0.0 {
        return None;
    }
    let s = summary.std_dev;
    Some(Capability {
        cp: (upper - lower) / (6.0 * s),
        cpk: (upper - summary.mean).min(summary.mean - lower) / (3.0 * s),
    })
}

/// Counts of verdicts over a set of readings or records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Tally {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub unchecked: usize,
    /// Percentage of checked items which passed.
    pub pass_rate: Option<f64>,
    pub verdict: Verdict,
}

impl Default for Verdict {
    fn default() -> Self {
        Self::Unchecked
    }
}

impl Tally {
    pub fn add(&mut self, verdict: Verdict) {
        self.total += 1;
        match verdict {
            Verdict::Pass => self.passed += 1,
            Verdict::Fail => self.failed += 1,
            Verdict::Unchecked => self.unchecked += 1,
        }
        self.pass_rate = pass_rate(self.passed, self.passed + self.failed);
        self.verdict = if self.failed > 0 {
            Verdict::Fail
        } else if self.passed > 0 {
            Verdict::Pass
        } else {
            Verdict::Unchecked
        };
    }
}

impl FromIterator<Verdict> for Tally {
    fn from_iter<I: IntoIterator<Item = Verdict>>(iter: I) -> Self {
        let mut tally = Self::default();
        for verdict in iter {
            tally.add(verdict);
        }
        tally
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize(&[]), None);

        let single = summarize(&[42.0]).unwrap();
        assert_eq!(single.std_dev, 0.0);
        assert_eq!(single.range, 0.0);

        let s = summarize(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(s.count, 8);
        assert!(close(s.mean, 5.0));
        // Population variance is 4; the sample variance is 32/7.
        assert!(close(s.std_dev, (32.0f64 / 7.0).sqrt()));
        assert_eq!((s.min, s.max, s.range), (2.0, 9.0, 7.0));
    }

    #[test]
    fn test_limits() {
        let limits = Limits::between(58.0, 62.0);
        assert_eq!(limits.check(58.0), Verdict::Pass);
        assert_eq!(limits.check(62.0), Verdict::Pass);
        assert_eq!(limits.check(62.1), Verdict::Fail);
        assert_eq!(Limits::new(None, Some(0.04)).check(0.05), Verdict::Fail);
        assert_eq!(Limits::new(Some(0.3), None).check(0.5), Verdict::Pass);
        assert_eq!(Limits::default().check(1.0), Verdict::Unchecked);
    }

    #[test]
    fn test_pass_rate() {
        assert_eq!(pass_rate(0, 0), None);
        assert_eq!(pass_rate(3, 4), Some(75.0));
    }

    #[test]
    fn test_capability() {
        let s = summarize(&[59.0, 60.0, 61.0]).unwrap();
        let c = capability(&s, &Limits::between(57.0, 63.0)).unwrap();
        assert!(close(c.cp, 1.0));
        assert!(close(c.cpk, 1.0));

        // Off-center processes have Cpk < Cp.
        let s = summarize(&[61.0, 62.0, 63.0]).unwrap();
        let c = capability(&s, &Limits::between(57.0, 63.0)).unwrap();
        assert!(close(c.cpk, 1.0 / 3.0));

        assert_eq!(capability(&s, &Limits::new(Some(57.0), None)), None);
        let flat = summarize(&[60.0, 60.0]).unwrap();
        assert_eq!(capability(&flat, &Limits::between(57.0, 63.0)), None);
    }

    #[test]
    fn test_tally() {
        let tally: Tally = [Verdict::Pass, Verdict::Unchecked, Verdict::Pass]
            .into_iter()
            .collect();
        assert_eq!(tally.verdict, Verdict::Pass);
        assert_eq!(tally.pass_rate, Some(100.0));

        let tally: Tally = [Verdict::Pass, Verdict::Fail].into_iter().collect();
        assert_eq!(tally.verdict, Verdict::Fail);
        assert_eq!(tally.pass_rate, Some(50.0));

        let tally: Tally = [Verdict::Unchecked].into_iter().collect();
        assert_eq!(tally.verdict, Verdict::Unchecked);
        assert_eq!(tally.pass_rate, None);
    }
}
