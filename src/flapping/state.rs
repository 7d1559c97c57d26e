//! Per-show flapping state and the pure decision over it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::ConfigParseError;
use crate::protocol::is_error;

use super::timer::RetryTimer;

pub const DEFAULT_TIMES: u32 = 2;
pub const DEFAULT_WITHIN: f64 = 1.0;
pub const DEFAULT_RETRY_IN: f64 = 7.0;
pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Seconds as a `Duration`, saturating instead of panicking on huge values.
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Flapping thresholds of one show.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlapConfig {
    /// Deaths that make a burst. Always at least 1.
    pub times: u32,
    /// Longest span, in seconds, a burst may cover to count as flapping.
    pub within: f64,
    /// Seconds between the stop and the retried start.
    pub retry_in: f64,
    /// Restarts allowed before the show is terminated.
    pub max_retry: u32,
}

impl Default for FlapConfig {
    fn default() -> Self {
        Self {
            times: DEFAULT_TIMES,
            within: DEFAULT_WITHIN,
            retry_in: DEFAULT_RETRY_IN,
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

/// The flapping keys found in an `options` reply. Absent keys stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigUpdate {
    pub times: Option<u32>,
    pub within: Option<f64>,
    pub retry_in: Option<f64>,
    pub max_retry: Option<u32>,
}

impl ConfigUpdate {
    /// Parse newline-separated `key: value` pairs.
    ///
    /// Keys other than the four thresholds are skipped. Any malformed line
    /// or unparsable threshold rejects the whole reply.
    pub fn parse(reply: &str) -> Result<Self, ConfigParseError> {
        if is_error(reply) {
            return Err(ConfigParseError::ErrorReply(reply.to_string()));
        }

        let mut update = ConfigUpdate::default();
        for line in reply.lines().filter(|l| !l.trim().is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                return Err(ConfigParseError::MissingSeparator(line.to_string()));
            };
            let (key, value) = (key.trim(), value.trim());
            let invalid = || ConfigParseError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "times" => {
                    let times: u32 = value.parse().map_err(|_| invalid())?;
                    if times == 0 {
                        return Err(invalid());
                    }
                    update.times = Some(times);
                }
                "within" => update.within = Some(parse_seconds(value).ok_or_else(invalid)?),
                "retry_in" => update.retry_in = Some(parse_seconds(value).ok_or_else(invalid)?),
                "max_retry" => update.max_retry = Some(value.parse().map_err(|_| invalid())?),
                _ => {}
            }
        }
        Ok(update)
    }

    pub fn is_empty(&self) -> bool {
        *self == ConfigUpdate::default()
    }

    /// Overlay the present keys on `base`.
    pub fn apply_to(self, base: FlapConfig) -> FlapConfig {
        FlapConfig {
            times: self.times.unwrap_or(base.times),
            within: self.within.unwrap_or(base.within),
            retry_in: self.retry_in.unwrap_or(base.retry_in),
            max_retry: self.max_retry.unwrap_or(base.max_retry),
        }
    }
}

fn parse_seconds(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

/// What to do after a death was recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Fewer than `times` deaths so far.
    Pending,
    /// The burst was too slow to be flapping.
    Recovered { span: Duration },
    /// Flapping, and a restart is still allowed.
    Retry { span: Duration },
    /// Flapping, and the retry budget is spent.
    Exhausted { span: Duration },
}

/// Everything the detector tracks for one show.
#[derive(Debug, Default)]
pub struct FlapState {
    timeline: VecDeque<Instant>,
    tries: u32,
    pending: Option<RetryTimer>,
    config: Option<FlapConfig>,
}

impl FlapState {
    pub fn timeline_len(&self) -> usize {
        self.timeline.len()
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn config(&self) -> Option<FlapConfig> {
        self.config
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending.is_some()
    }

    /// Delay of the pending restart, if one is armed.
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending.as_ref().map(RetryTimer::delay)
    }

    pub(crate) fn pending_generation(&self) -> Option<u64> {
        self.pending.as_ref().map(RetryTimer::generation)
    }

    /// Store new thresholds, trimming the timeline if `times` shrank.
    pub fn set_config(&mut self, config: FlapConfig) {
        self.config = Some(config);
        self.trim(config.times);
    }

    /// Append a death at `at`, keeping only the newest `times` entries.
    pub fn record_death(&mut self, at: Instant, times: u32) {
        self.timeline.push_back(at);
        self.trim(times);
    }

    fn trim(&mut self, times: u32) {
        let keep = usize::try_from(times.max(1)).unwrap_or(usize::MAX);
        while self.timeline.len() > keep {
            self.timeline.pop_front();
        }
    }

    /// Decide what the current timeline means under `config`.
    ///
    /// The span is measured first to last death, less `check_delay`.
    pub fn evaluate(&self, config: &FlapConfig, check_delay: Duration) -> Verdict {
        let full = usize::try_from(config.times).is_ok_and(|t| self.timeline.len() == t);
        let (Some(first), Some(last)) = (self.timeline.front(), self.timeline.back()) else {
            return Verdict::Pending;
        };
        if !full {
            return Verdict::Pending;
        }

        let span = last.duration_since(*first).saturating_sub(check_delay);
        if span > secs(config.within) {
            Verdict::Recovered { span }
        } else if self.tries < config.max_retry {
            Verdict::Retry { span }
        } else {
            Verdict::Exhausted { span }
        }
    }

    /// A restart was issued: start a fresh burst and count the attempt.
    pub fn begin_retry(&mut self) -> u32 {
        self.timeline.clear();
        self.tries += 1;
        self.tries
    }

    /// Install the timer for the pending restart, cancelling any older one.
    pub fn arm(&mut self, timer: RetryTimer) {
        if let Some(old) = self.pending.replace(timer) {
            old.cancel();
        }
    }

    /// Take the pending timer if it is the one with `generation`.
    pub(crate) fn take_due(&mut self, generation: u64) -> Option<RetryTimer> {
        if self.pending_generation() == Some(generation) {
            self.pending.take()
        } else {
            None
        }
    }

    /// Forget the burst and the attempts made so far.
    pub fn clear(&mut self) {
        self.timeline.clear();
        self.tries = 0;
    }

    /// [`FlapState::clear`], and cancel any pending restart.
    /// Returns whether a restart was cancelled.
    pub fn reset(&mut self) -> bool {
        self.clear();
        match self.pending.take() {
            Some(timer) => {
                timer.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(times: u32, within: f64, retry_in: f64, max_retry: u32) -> FlapConfig {
        FlapConfig {
            times,
            within,
            retry_in,
            max_retry,
        }
    }

    fn burst(state: &mut FlapState, start: Instant, offsets: &[u64], times: u32) {
        for offset in offsets {
            state.record_death(start + Duration::from_secs(*offset), times);
        }
    }

    #[test]
    fn parse_reads_only_flapping_keys() {
        let reply = "numprocesses: 1\nworking_dir: /srv/app\ntimes: 3\nwithin: 5.0\n\
                     retry_in: 2\nmax_retry: 1\ncmd: sleep 1";
        let update = ConfigUpdate::parse(reply).unwrap();
        assert_eq!(
            update,
            ConfigUpdate {
                times: Some(3),
                within: Some(5.0),
                retry_in: Some(2.0),
                max_retry: Some(1),
            }
        );
    }

    #[test]
    fn parse_splits_on_the_first_colon_only() {
        let update = ConfigUpdate::parse("cmd: python -c 'print(1:2)'\ntimes: 4").unwrap();
        assert_eq!(update.times, Some(4));
    }

    #[test]
    fn parse_is_all_or_nothing() {
        assert!(matches!(
            ConfigUpdate::parse("times: 5\nwithin: soon"),
            Err(ConfigParseError::InvalidValue { key, .. }) if key == "within"
        ));
        assert!(matches!(
            ConfigUpdate::parse("times: 5\ngarbage"),
            Err(ConfigParseError::MissingSeparator(_))
        ));
        assert!(ConfigUpdate::parse("times: 0").is_err());
        assert!(ConfigUpdate::parse("max_retry: -1").is_err());
        assert!(ConfigUpdate::parse("retry_in: -3").is_err());
        assert!(ConfigUpdate::parse("within: NaN").is_err());
    }

    #[test]
    fn error_replies_are_not_configs() {
        assert!(matches!(
            ConfigUpdate::parse("error: program web not found"),
            Err(ConfigParseError::ErrorReply(_))
        ));
    }

    #[test]
    fn merge_updates_only_present_keys() {
        let cached = config(3, 5.0, 2.0, 1);
        let update = ConfigUpdate::parse("times: 5").unwrap();
        assert_eq!(update.apply_to(cached), config(5, 5.0, 2.0, 1));
    }

    #[test]
    fn empty_update_falls_back_to_defaults() {
        let update = ConfigUpdate::parse("numprocesses: 2").unwrap();
        assert!(update.is_empty());
        assert_eq!(update.apply_to(FlapConfig::default()), config(2, 1.0, 7.0, 5));
    }

    #[test]
    fn timeline_is_a_sliding_window() {
        let mut state = FlapState::default();
        burst(&mut state, Instant::now(), &[0, 1, 2, 3, 4], 3);
        assert_eq!(state.timeline_len(), 3);

        state.set_config(config(2, 1.0, 1.0, 1));
        assert_eq!(state.timeline_len(), 2);
    }

    #[test]
    fn pending_until_times_deaths() {
        let mut state = FlapState::default();
        let cfg = config(3, 5.0, 2.0, 1);
        burst(&mut state, Instant::now(), &[0, 1], cfg.times);
        assert_eq!(state.evaluate(&cfg, Duration::ZERO), Verdict::Pending);
        assert_eq!(FlapState::default().evaluate(&cfg, Duration::ZERO), Verdict::Pending);
    }

    #[test]
    fn fast_burst_with_budget_is_a_retry() {
        let mut state = FlapState::default();
        let cfg = config(3, 5.0, 2.0, 1);
        burst(&mut state, Instant::now(), &[0, 1, 2], cfg.times);
        assert_eq!(
            state.evaluate(&cfg, Duration::ZERO),
            Verdict::Retry {
                span: Duration::from_secs(2)
            }
        );

        assert_eq!(state.begin_retry(), 1);
        assert_eq!(state.timeline_len(), 0);
    }

    #[test]
    fn fast_burst_without_budget_is_exhausted() {
        let mut state = FlapState::default();
        let cfg = config(3, 5.0, 2.0, 1);
        state.begin_retry();
        burst(&mut state, Instant::now(), &[0, 1, 2], cfg.times);
        assert!(matches!(
            state.evaluate(&cfg, Duration::ZERO),
            Verdict::Exhausted { .. }
        ));
    }

    #[test]
    fn slow_burst_recovers() {
        let mut state = FlapState::default();
        let cfg = config(3, 5.0, 2.0, 1);
        burst(&mut state, Instant::now(), &[0, 3, 6], cfg.times);
        assert_eq!(
            state.evaluate(&cfg, Duration::ZERO),
            Verdict::Recovered {
                span: Duration::from_secs(6)
            }
        );
    }

    #[test]
    fn check_delay_is_subtracted_from_the_span() {
        let mut state = FlapState::default();
        let cfg = config(2, 1.0, 2.0, 1);
        burst(&mut state, Instant::now(), &[0, 2], cfg.times);
        assert!(matches!(
            state.evaluate(&cfg, Duration::ZERO),
            Verdict::Recovered { .. }
        ));
        assert!(matches!(
            state.evaluate(&cfg, Duration::from_secs(1)),
            Verdict::Retry { .. }
        ));
        assert_eq!(
            state.evaluate(&cfg, Duration::from_secs(10)),
            Verdict::Retry { span: Duration::ZERO }
        );
    }

    #[test]
    fn reset_clears_everything_and_is_idempotent() {
        let mut state = FlapState::default();
        burst(&mut state, Instant::now(), &[0, 1], 3);
        state.begin_retry();

        assert!(!state.reset());
        assert_eq!(state.timeline_len(), 0);
        assert_eq!(state.tries(), 0);

        assert!(!state.reset());
        assert_eq!(state.timeline_len(), 0);
        assert_eq!(state.tries(), 0);
    }

    #[test]
    fn huge_seconds_saturate() {
        assert_eq!(secs(f64::MAX), Duration::MAX);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }
}
