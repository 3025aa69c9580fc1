//! Online-history ring.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// One fixed-width window of contact outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub window_start: DateTime<Utc>,
    pub online_count: u64,
    pub total_count: u64,
}

impl Window {
    fn online_ratio(&self) -> f64 {
        if self.total_count == 0 {
            1.0
        } else {
            self.online_count as f64 / self.total_count as f64
        }
    }
}

/// Ring of audit-contact windows over a tracking period.
///
/// Each audit appends to the window containing its timestamp; windows
/// older than the tracking period fall off the back. The online score is
/// the average ratio of all *completed* windows; the window still being
/// filled never counts, so a single early failure cannot crater a node's
/// score mid-window.
#[derive(Debug, Clone)]
pub struct AuditHistory {
    window_size: Duration,
    tracking_period: Duration,
    windows: VecDeque<Window>,
}

impl AuditHistory {
    pub fn new(window_size: std::time::Duration, tracking_period: std::time::Duration) -> Self {
        Self {
            window_size: Duration::from_std(window_size).unwrap_or_else(|_| Duration::hours(12)),
            tracking_period: Duration::from_std(tracking_period)
                .unwrap_or_else(|_| Duration::days(30)),
            windows: VecDeque::new(),
        }
    }

    /// Records one audit contact at `now`.
    pub fn add_audit(&mut self, online: bool, now: DateTime<Utc>) {
        let window_start = self.truncate(now);

        match self.windows.back_mut() {
            Some(window) if window.window_start == window_start => {
                window.total_count += 1;
                if online {
                    window.online_count += 1;
                }
            }
            _ => {
                self.windows.push_back(Window {
                    window_start,
                    online_count: u64::from(online),
                    total_count: 1,
                });
                let horizon = now - self.tracking_period;
                while self
                    .windows
                    .front()
                    .is_some_and(|window| window.window_start < horizon)
                {
                    self.windows.pop_front();
                }
            }
        }
    }

    /// Average online ratio over completed windows; `1.0` with no history.
    pub fn online_score(&self) -> f64 {
        let completed = self.windows.len().saturating_sub(1);
        if completed == 0 {
            return 1.0;
        }
        let sum: f64 = self
            .windows
            .iter()
            .take(completed)
            .map(Window::online_ratio)
            .sum();
        sum / completed as f64
    }

    pub fn windows(&self) -> impl Iterator<Item = &Window> {
        self.windows.iter()
    }

    fn truncate(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window_secs = self.window_size.num_seconds().max(1);
        let ts = now.timestamp();
        DateTime::from_timestamp(ts - ts.rem_euclid(window_secs), 0)
            .expect("truncated timestamp in range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    const HOUR: StdDuration = StdDuration::from_secs(60 * 60);

    fn at(hours: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(hours * 3600, 0).unwrap()
    }

    #[test]
    fn score_is_one_without_completed_windows() {
        let mut history = AuditHistory::new(HOUR, StdDuration::from_secs(48 * 3600));
        assert_eq!(history.online_score(), 1.0);

        // Only the current window has data; still no completed window.
        history.add_audit(false, at(0));
        assert_eq!(history.online_score(), 1.0);
    }

    #[test]
    fn score_averages_completed_windows() {
        let mut history = AuditHistory::new(HOUR, StdDuration::from_secs(48 * 3600));
        // Window 0: 1/2 online.
        history.add_audit(true, at(0));
        history.add_audit(false, at(0));
        // Window 1: 1/1 online.
        history.add_audit(true, at(1));
        // Window 2 opens; windows 0 and 1 complete.
        history.add_audit(true, at(2));

        assert!((history.online_score() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn windows_fall_off_after_tracking_period() {
        let mut history = AuditHistory::new(HOUR, StdDuration::from_secs(2 * 3600));
        history.add_audit(false, at(0));
        history.add_audit(true, at(1));
        history.add_audit(true, at(10));

        // The hour-0 and hour-1 windows are outside the 2h tracking period.
        assert_eq!(history.windows().count(), 1);
        assert_eq!(history.online_score(), 1.0);
    }

    #[test]
    fn same_window_accumulates() {
        let mut history = AuditHistory::new(HOUR, StdDuration::from_secs(48 * 3600));
        history.add_audit(true, at(0));
        history.add_audit(true, at(0));
        history.add_audit(false, at(0));

        let window = history.windows().next().unwrap();
        assert_eq!(window.total_count, 3);
        assert_eq!(window.online_count, 2);
    }
}
