//! Checksum health tracking for one channel.
//!
//! Counters cover the whole lifetime of the channel and survive reconnects;
//! only [`ChecksumMonitor::reset`] clears them. Alerts are throttled per kind
//! so a noisy line produces one warning a minute, not one per frame.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

use crate::config::HealthConfig;
use crate::protocol::ChannelId;

/// Something the UI may want to show about link integrity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthNotice {
    /// A good frame arrived after `after_errors` consecutive failures.
    Recovered { after_errors: u32 },
    ConsecutiveErrors { count: u32 },
    /// Recent error rate (0.0-1.0) crossed the configured threshold.
    ErrorRate { rate: f64, window: usize },
}

/// Read-only view of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChecksumStats {
    pub total_packets: u64,
    pub total_errors: u64,
    pub consecutive_errors: u32,
    pub recent_error_rate: f64,
    pub recent_window: usize,
    /// Milliseconds since the most recent alert of any kind.
    pub since_last_alert_ms: Option<u64>,
    /// Most recent recovery or alert, kept until the next one or a reset.
    pub last_notice: Option<HealthNotice>,
}

/// Allows one event per interval.
#[derive(Debug, Clone)]
struct AlertLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl AlertLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn try_fire(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChecksumMonitor {
    channel: ChannelId,
    config: HealthConfig,
    total_packets: u64,
    total_errors: u64,
    consecutive_errors: u32,
    recent: VecDeque<bool>,
    consecutive_limiter: AlertLimiter,
    rate_limiter: AlertLimiter,
    last_notice: Option<HealthNotice>,
}

impl ChecksumMonitor {
    pub fn new(channel: ChannelId, config: HealthConfig) -> Self {
        let interval = config.alert_interval();
        Self {
            channel,
            recent: VecDeque::with_capacity(config.window),
            config,
            total_packets: 0,
            total_errors: 0,
            consecutive_errors: 0,
            consecutive_limiter: AlertLimiter::new(interval),
            rate_limiter: AlertLimiter::new(interval),
            last_notice: None,
        }
    }

    pub fn record_failure(&mut self) -> Vec<HealthNotice> {
        self.record_failure_at(Instant::now())
    }

    pub fn record_success(&mut self) -> Option<HealthNotice> {
        self.total_packets += 1;
        self.push_outcome(false);

        if self.consecutive_errors == 0 {
            return None;
        }
        let after_errors = self.consecutive_errors;
        self.consecutive_errors = 0;
        info!(
            "channel {}: checksum recovered after {} consecutive errors",
            self.channel, after_errors
        );
        let notice = HealthNotice::Recovered { after_errors };
        self.last_notice = Some(notice.clone());
        Some(notice)
    }

    pub fn record_failure_at(&mut self, now: Instant) -> Vec<HealthNotice> {
        self.total_packets += 1;
        self.total_errors += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.push_outcome(true);

        let mut notices = Vec::new();

        if self.consecutive_errors >= self.config.consecutive_threshold
            && self.consecutive_limiter.try_fire(now)
        {
            warn!(
                "channel {}: {} consecutive checksum errors",
                self.channel, self.consecutive_errors
            );
            notices.push(HealthNotice::ConsecutiveErrors {
                count: self.consecutive_errors,
            });
        }

        let rate = self.recent_error_rate();
        if rate >= self.config.rate_threshold && self.rate_limiter.try_fire(now) {
            warn!(
                "channel {}: checksum error rate {:.1}% over last {} frames",
                self.channel,
                rate * 100.0,
                self.recent.len()
            );
            notices.push(HealthNotice::ErrorRate {
                rate,
                window: self.recent.len(),
            });
        }

        if let Some(last) = notices.last() {
            self.last_notice = Some(last.clone());
        }
        notices
    }

    /// Failures divided by the number of outcomes in the recent window.
    pub fn recent_error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|&&failed| failed).count();
        failures as f64 / self.recent.len() as f64
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn snapshot(&self) -> ChecksumStats {
        let last_alert = match (self.consecutive_limiter.last, self.rate_limiter.last) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        ChecksumStats {
            total_packets: self.total_packets,
            total_errors: self.total_errors,
            consecutive_errors: self.consecutive_errors,
            recent_error_rate: self.recent_error_rate(),
            recent_window: self.recent.len(),
            since_last_alert_ms: last_alert.map(|t| t.elapsed().as_millis() as u64),
            last_notice: self.last_notice.clone(),
        }
    }

    /// Clear counters, window and alert history.
    pub fn reset(&mut self) {
        *self = Self::new(self.channel, self.config.clone());
    }

    fn push_outcome(&mut self, failed: bool) {
        if self.recent.len() == self.config.window {
            self.recent.pop_front();
        }
        self.recent.push_back(failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ChecksumMonitor {
        ChecksumMonitor::new(0, HealthConfig::default())
    }

    fn has_consecutive(notices: &[HealthNotice]) -> bool {
        notices
            .iter()
            .any(|n| matches!(n, HealthNotice::ConsecutiveErrors { .. }))
    }

    #[test]
    fn consecutive_alert_at_threshold() {
        let mut m = monitor();
        let t0 = Instant::now();
        for _ in 0..4 {
            assert!(!has_consecutive(&m.record_failure_at(t0)));
        }
        let notices = m.record_failure_at(t0);
        assert!(notices.contains(&HealthNotice::ConsecutiveErrors { count: 5 }));
    }

    #[test]
    fn success_resets_and_rearms_after_five_new_failures() {
        let mut m = monitor();
        let t0 = Instant::now();
        for _ in 0..5 {
            m.record_failure_at(t0);
        }
        assert_eq!(
            m.record_success(),
            Some(HealthNotice::Recovered { after_errors: 5 })
        );
        assert_eq!(m.consecutive_errors(), 0);

        // Past the throttle interval, only the fifth new failure alerts again.
        let later = t0 + Duration::from_secs(61);
        for _ in 0..4 {
            assert!(!has_consecutive(&m.record_failure_at(later)));
        }
        assert!(has_consecutive(&m.record_failure_at(later)));
    }

    #[test]
    fn alerts_are_throttled_per_kind() {
        let mut m = monitor();
        let t0 = Instant::now();
        let mut consecutive = 0;
        for i in 0..20 {
            let notices = m.record_failure_at(t0 + Duration::from_secs(i));
            consecutive += notices
                .iter()
                .filter(|n| matches!(n, HealthNotice::ConsecutiveErrors { .. }))
                .count();
        }
        assert_eq!(consecutive, 1);
        let notices = m.record_failure_at(t0 + Duration::from_secs(70));
        assert!(has_consecutive(&notices));
    }

    #[test]
    fn rate_alert_uses_window() {
        let mut m = monitor();
        let t0 = Instant::now();
        for _ in 0..99 {
            m.record_success();
        }
        // 1 failure in 100 = 1%: below threshold.
        assert!(m.record_failure_at(t0).is_empty());
        for _ in 0..3 {
            m.record_success();
            m.record_failure_at(t0);
        }
        m.record_success();
        let notices = m.record_failure_at(t0);
        assert!(notices
            .iter()
            .any(|n| matches!(n, HealthNotice::ErrorRate { rate, .. } if *rate >= 0.05)));
        assert_eq!(m.snapshot().recent_window, 100);
    }

    #[test]
    fn reset_clears_everything() {
        let mut m = monitor();
        m.record_failure();
        m.record_success();
        m.reset();
        let stats = m.snapshot();
        assert_eq!(stats.total_packets, 0);
        assert_eq!(stats.total_errors, 0);
        assert_eq!(stats.recent_window, 0);
        assert_eq!(stats.since_last_alert_ms, None);
        assert_eq!(stats.last_notice, None);
    }

    #[test]
    fn snapshot_keeps_latest_notice() {
        let mut m = monitor();
        assert_eq!(m.snapshot().last_notice, None);
        let t0 = Instant::now();
        for _ in 0..5 {
            m.record_failure_at(t0);
        }
        assert_eq!(
            m.snapshot().last_notice,
            Some(HealthNotice::ConsecutiveErrors { count: 5 })
        );
        m.record_success();
        let stats = m.snapshot();
        assert_eq!(
            stats.last_notice,
            Some(HealthNotice::Recovered { after_errors: 5 })
        );
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["last_notice"]["kind"], "recovered");
        assert_eq!(json["last_notice"]["after_errors"], 5);
    }
}
