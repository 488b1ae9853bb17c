//! Task-local progress reporting for long tile loops.
use std::time::{Duration, Instant};

/// Default spacing between progress log lines.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Counts processed pixels for one task and logs the completion percentage at
/// most once per interval. Each task owns its own instance.
#[derive(Debug)]
pub struct Progress {
    label: String,
    total: usize,
    done: usize,
    interval: Duration,
    last: Instant,
}

impl Progress {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        Self {
            label: label.into(),
            total,
            done: 0,
            interval: REPORT_INTERVAL,
            last: Instant::now(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn advance(&mut self, pixels: usize) {
        self.done += pixels;
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            tracing::info!("{} approx. {:.2}% complete", self.label, self.percent());
        }
    }

    pub fn done(&self) -> usize {
        self.done
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.done as f64 / self.total as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_tracks_advances() {
        let mut p = Progress::new("count", 200).with_interval(Duration::ZERO);
        p.advance(50);
        p.advance(50);
        assert_eq!(p.done(), 100);
        assert!((p.percent() - 50.0).abs() < 1e-12);
    }

    #[test]
    fn empty_total_reports_complete() {
        assert_eq!(Progress::new("empty", 0).percent(), 100.0);
    }
}
