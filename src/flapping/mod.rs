//! Flapping detector: notices shows dying in bursts and backs them off.
//!
//! ## Decision per show
//!
//! ```text
//! reap       → append now to the timeline (newest `times` kept)
//!            → timeline full?  no → wait for more deaths
//! span ≤ within, tries < max_retry → stop_show, tries += 1, arm retry timer
//! span ≤ within, tries = max_retry → reset, terminate (one-way)
//! span > within                    → reset (recovered)
//! retry due  → start_show
//! updated    → options, merge thresholds
//! ```
//!
//! All state lives on the detector thread. The feed thread, retry timers and
//! [`FlappingHandle`] only ever post [`DetectorMessage`]s into its queue.

pub mod state;
pub mod timer;

use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::client::Commander;
use crate::error::ClientError;
use crate::log::{ExecutionLog, LogEvent};
use crate::protocol::is_error;
use crate::pubsub::{EventKind, FeedCloser, Subscriber, Topic};

pub use state::{ConfigUpdate, FlapConfig, FlapState, Verdict};
pub use timer::RetryTimer;

use state::secs;

/// Default allowance subtracted from every measured burst span.
pub const DEFAULT_CHECK_DELAY: Duration = Duration::from_secs(1);

/// Everything the detector loop reacts to.
#[derive(Debug)]
pub enum DetectorMessage {
    /// A lifecycle event arrived from the feed at `at`.
    Event {
        show: String,
        kind: EventKind,
        at: Instant,
    },
    /// A retry timer expired.
    RetryDue { show: String, generation: u64 },
    /// Operator asked to forget a show's flapping state.
    Reset(String),
    /// The event feed ended.
    FeedClosed,
    Shutdown,
}

/// What became of a command sent to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// A non-error reply came back.
    Applied,
    /// The controller answered `error:` or was never reached.
    Refused,
    /// The command went out but its reply was lost, so it may have run.
    Unknown,
}

/// Cloneable way into a detector's queue.
#[derive(Debug, Clone)]
pub struct FlappingHandle {
    queue: Sender<DetectorMessage>,
}

impl FlappingHandle {
    /// Ask the detector to reset `show`. `false` if the detector is gone.
    pub fn reset(&self, show: &str) -> bool {
        self.post(DetectorMessage::Reset(show.to_string()))
    }

    pub fn shutdown(&self) -> bool {
        self.post(DetectorMessage::Shutdown)
    }

    fn post(&self, message: DetectorMessage) -> bool {
        self.queue.send(message).is_ok()
    }
}

pub struct FlappingDetector {
    commander: Arc<dyn Commander>,
    check_delay: Duration,
    states: HashMap<String, FlapState>,
    queue: Sender<DetectorMessage>,
    inbox: Receiver<DetectorMessage>,
    next_generation: u64,
    audit: Option<Arc<ExecutionLog>>,
}

impl FlappingDetector {
    pub fn new(commander: Arc<dyn Commander>, check_delay: Duration) -> Self {
        let (queue, inbox) = mpsc::channel();
        Self {
            commander,
            check_delay,
            states: HashMap::new(),
            queue,
            inbox,
            next_generation: 0,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<ExecutionLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn handle(&self) -> FlappingHandle {
        FlappingHandle {
            queue: self.queue.clone(),
        }
    }

    pub fn state(&self, show: &str) -> Option<&FlapState> {
        self.states.get(show)
    }

    /// Process messages until [`DetectorMessage::Shutdown`], then cancel
    /// every pending retry.
    pub fn run(mut self) {
        info!(check_delay = ?self.check_delay, "flapping detector started");
        while let Ok(message) = self.inbox.recv() {
            if self.handle_message(message).is_break() {
                break;
            }
        }
        let cancelled = self
            .states
            .values_mut()
            .map(FlapState::reset)
            .filter(|cancelled| *cancelled)
            .count();
        info!(cancelled_retries = cancelled, "flapping detector stopped");
    }

    /// Wait up to `timeout` for one queued message and handle it.
    /// Returns `None` when nothing arrived.
    pub fn process_next(&mut self, timeout: Duration) -> Option<ControlFlow<()>> {
        let message = self.inbox.recv_timeout(timeout).ok()?;
        Some(self.handle_message(message))
    }

    pub fn handle_message(&mut self, message: DetectorMessage) -> ControlFlow<()> {
        match message {
            DetectorMessage::Event {
                show,
                kind: EventKind::Reap,
                at,
            } => self.on_death(&show, at),
            DetectorMessage::Event {
                show,
                kind: EventKind::Updated,
                ..
            } => {
                self.refresh_config(&show);
            }
            DetectorMessage::Event { .. } => {}
            DetectorMessage::RetryDue { show, generation } => self.on_retry_due(&show, generation),
            DetectorMessage::Reset(show) => self.reset(&show),
            DetectorMessage::FeedClosed => {
                warn!("event feed closed; no further deaths will be observed");
            }
            DetectorMessage::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn on_death(&mut self, show: &str, at: Instant) {
        let Some(config) = self.config_for(show) else {
            warn!(show, "dropping death event: flapping thresholds unavailable");
            return;
        };

        let state = self.states.entry(show.to_string()).or_default();
        state.record_death(at, config.times);
        let verdict = state.evaluate(&config, self.check_delay);
        debug!(show, deaths = state.timeline_len(), tries = state.tries(), ?verdict, "death recorded");

        match verdict {
            Verdict::Pending => {}
            Verdict::Recovered { span } => {
                state.clear();
                debug!(show, span = ?span, "deaths too far apart; not flapping");
                self.audit(LogEvent::Recovered {
                    show: show.to_string(),
                    span_secs: span.as_secs_f64(),
                });
            }
            Verdict::Retry { span } => {
                self.flapping_detected(show, span);
                self.schedule_retry(show, config);
            }
            Verdict::Exhausted { span } => {
                self.flapping_detected(show, span);
                self.escalate(show, config);
            }
        }
    }

    fn flapping_detected(&self, show: &str, span: Duration) {
        let deaths = self.states.get(show).map_or(0, FlapState::timeline_len);
        self.audit(LogEvent::FlappingDetected {
            show: show.to_string(),
            deaths,
            span_secs: span.as_secs_f64(),
        });
    }

    fn schedule_retry(&mut self, show: &str, config: FlapConfig) {
        match self.command(&format!("stop_show {show}")) {
            Outcome::Applied => {}
            Outcome::Refused => return,
            Outcome::Unknown => {
                warn!(show, "stop_show reply lost; assuming the show stopped and arming the retry");
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let timer = {
            let queue = self.queue.clone();
            let show = show.to_string();
            RetryTimer::arm(secs(config.retry_in), generation, move || {
                let _ = queue.send(DetectorMessage::RetryDue { show, generation });
            })
        };

        let Some(state) = self.states.get_mut(show) else {
            return;
        };
        let attempt = state.begin_retry();
        match timer {
            Ok(timer) => state.arm(timer),
            Err(e) => {
                error!(show, error = %e, "could not arm retry timer; show stays stopped");
                return;
            }
        }

        info!(show, attempt, retry_in = config.retry_in, "flapping detected: retry scheduled");
        self.audit(LogEvent::RetryScheduled {
            show: show.to_string(),
            attempt,
            retry_in_secs: config.retry_in,
        });
    }

    fn escalate(&mut self, show: &str, config: FlapConfig) {
        if let Some(state) = self.states.get_mut(show) {
            state.reset();
        }
        info!(show, max_retry = config.max_retry, "flapping detected: retry limit reached, terminating");

        let command = format!("terminate {show}");
        if let Err(e) = self.commander.send_one_way(&command) {
            warn!(show, error = %e, "could not send terminate");
            self.audit(LogEvent::CommandFailed {
                command,
                reason: e.to_string(),
            });
        }
        self.audit(LogEvent::Terminated {
            show: show.to_string(),
            max_retry: config.max_retry,
        });
    }

    fn on_retry_due(&mut self, show: &str, generation: u64) {
        let Some(timer) = self
            .states
            .get_mut(show)
            .and_then(|state| state.take_due(generation))
        else {
            debug!(show, generation, "ignoring stale retry");
            return;
        };
        timer.cancel();

        if self.command(&format!("start_show {show}")) == Outcome::Applied {
            info!(show, "retry: show started again");
            self.audit(LogEvent::RetryStarted {
                show: show.to_string(),
            });
        }
    }

    /// Clear the show's timeline and tries and cancel its pending retry.
    pub fn reset(&mut self, show: &str) {
        let Some(state) = self.states.get_mut(show) else {
            debug!(show, "nothing to reset");
            return;
        };
        let cancelled_retry = state.reset();
        info!(show, cancelled_retry, "flapping state reset");
        self.audit(LogEvent::Reset {
            show: show.to_string(),
            cancelled_retry,
        });
    }

    fn config_for(&mut self, show: &str) -> Option<FlapConfig> {
        match self.states.get(show).and_then(FlapState::config) {
            Some(config) => Some(config),
            None => self.refresh_config(show),
        }
    }

    /// Fetch `options` for the show and merge the thresholds it carries.
    fn refresh_config(&mut self, show: &str) -> Option<FlapConfig> {
        let command = format!("options {show}");
        let reply = match self.commander.call(&command) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(show, error = %e, "could not fetch flapping thresholds");
                self.audit(LogEvent::CommandFailed {
                    command,
                    reason: e.to_string(),
                });
                return None;
            }
        };

        let update = match ConfigUpdate::parse(&reply) {
            Ok(update) => update,
            Err(e) => {
                warn!(show, error = %e, "ignoring unusable options reply");
                return None;
            }
        };

        let state = self.states.entry(show.to_string()).or_default();
        let config = update.apply_to(state.config().unwrap_or_default());
        state.set_config(config);
        debug!(show, ?config, "flapping thresholds refreshed");
        self.audit(LogEvent::ConfigRefreshed {
            show: show.to_string(),
            times: config.times,
            within: config.within,
            retry_in: config.retry_in,
            max_retry: config.max_retry,
        });
        Some(config)
    }

    /// Round trip `command`. A failed connect means nothing was sent; any
    /// later transport failure leaves the outcome unknown.
    fn command(&self, command: &str) -> Outcome {
        let (outcome, reason) = match self.commander.call(command) {
            Ok(reply) if !is_error(&reply) => return Outcome::Applied,
            Ok(reply) => (Outcome::Refused, reply),
            Err(e @ ClientError::Connect { .. }) => (Outcome::Refused, e.to_string()),
            Err(e) => (Outcome::Unknown, e.to_string()),
        };
        warn!(command, reason = %reason, ?outcome, "controller command failed");
        self.audit(LogEvent::CommandFailed {
            command: command.to_string(),
            reason,
        });
        outcome
    }

    fn audit(&self, event: LogEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }
}

/// A detector running on its own thread, fed by a subscriber thread.
pub struct RunningDetector {
    handle: FlappingHandle,
    closer: FeedCloser,
    feed: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl RunningDetector {
    pub fn spawn(detector: FlappingDetector, subscriber: Subscriber) -> io::Result<Self> {
        let handle = detector.handle();
        let closer = subscriber.closer()?;

        let worker = thread::Builder::new()
            .name("ringmaster-flapping".to_string())
            .spawn(move || detector.run())?;

        let feed = {
            let handle = handle.clone();
            thread::Builder::new()
                .name("ringmaster-feed".to_string())
                .spawn(move || feed_loop(subscriber, handle))
        };
        let feed = match feed {
            Ok(feed) => feed,
            Err(e) => {
                handle.shutdown();
                let _ = worker.join();
                return Err(e);
            }
        };

        Ok(Self {
            handle,
            closer,
            feed: Some(feed),
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> FlappingHandle {
        self.handle.clone()
    }

    /// Stop both threads and cancel every pending retry.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.shutdown();
        self.closer.close();
        if let Some(feed) = self.feed.take() {
            let _ = feed.join();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RunningDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn feed_loop(mut subscriber: Subscriber, handle: FlappingHandle) {
    loop {
        let publication = match subscriber.recv() {
            Ok(Some(publication)) => publication,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "event feed failed");
                break;
            }
        };

        let Some(topic) = Topic::parse(&publication.topic) else {
            debug!(topic = %publication.topic, "ignoring foreign topic");
            continue;
        };
        let message = DetectorMessage::Event {
            show: topic.show,
            kind: topic.kind,
            at: Instant::now(),
        };
        if !handle.post(message) {
            return;
        }
    }
    handle.post(DetectorMessage::FeedClosed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::pubsub::{EventSink, Publisher};
    use std::sync::Mutex;

    const RESTART_OPTIONS: &str = "numprocesses: 1\ntimes: 3\nwithin: 5.0\nretry_in: 2.0\nmax_retry: 1";

    #[derive(Default)]
    struct FakeController {
        options: Mutex<HashMap<String, String>>,
        refuse: Mutex<Vec<String>>,
        lose: Mutex<Vec<String>>,
        unreachable: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
        one_way: Mutex<Vec<String>>,
    }

    impl FakeController {
        fn with_options(show: &str, options: &str) -> Arc<Self> {
            let fake = Self::default();
            fake.set_options(show, options);
            Arc::new(fake)
        }

        fn set_options(&self, show: &str, options: &str) {
            self.options
                .lock()
                .unwrap()
                .insert(show.to_string(), options.to_string());
        }

        fn refuse(&self, command: &str) {
            self.refuse.lock().unwrap().push(command.to_string());
        }

        /// The command reaches the controller but its reply times out.
        fn lose_reply(&self, command: &str) {
            self.lose.lock().unwrap().push(command.to_string());
        }

        /// The command never leaves: connecting fails.
        fn fail_connect(&self, command: &str) {
            self.unreachable.lock().unwrap().push(command.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn one_way(&self) -> Vec<String> {
            self.one_way.lock().unwrap().clone()
        }

        fn count(&self, command: &str) -> usize {
            self.calls().iter().filter(|c| *c == command).count()
        }
    }

    impl Commander for FakeController {
        fn call(&self, command: &str) -> Result<String, ClientError> {
            self.calls.lock().unwrap().push(command.to_string());
            if self.refuse.lock().unwrap().iter().any(|r| r == command) {
                return Ok(format!("error: refused '{command}'"));
            }
            if self.lose.lock().unwrap().iter().any(|r| r == command) {
                return Err(ClientError::Frame(FrameError::Io(io::Error::from(
                    io::ErrorKind::WouldBlock,
                ))));
            }
            if self.unreachable.lock().unwrap().iter().any(|r| r == command) {
                return Err(ClientError::Connect {
                    endpoint: "127.0.0.1:1".to_string(),
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                });
            }
            if let Some(show) = command.strip_prefix("options ") {
                return match self.options.lock().unwrap().get(show) {
                    Some(options) => Ok(options.clone()),
                    None => Err(ClientError::Closed),
                };
            }
            Ok("ok".to_string())
        }

        fn send_one_way(&self, command: &str) -> Result<(), ClientError> {
            self.one_way.lock().unwrap().push(command.to_string());
            Ok(())
        }
    }

    fn detector(fake: &Arc<FakeController>) -> FlappingDetector {
        FlappingDetector::new(Arc::clone(fake) as Arc<dyn Commander>, Duration::ZERO)
    }

    fn death(detector: &mut FlappingDetector, show: &str, at: Instant) {
        let flow = detector.handle_message(DetectorMessage::Event {
            show: show.to_string(),
            kind: EventKind::Reap,
            at,
        });
        assert!(flow.is_continue());
    }

    fn burst(detector: &mut FlappingDetector, show: &str, offsets: &[u64]) {
        let t = Instant::now();
        for offset in offsets {
            death(detector, show, t + Duration::from_secs(*offset));
        }
    }

    fn updated(detector: &mut FlappingDetector, show: &str) {
        detector.handle_message(DetectorMessage::Event {
            show: show.to_string(),
            kind: EventKind::Updated,
            at: Instant::now(),
        });
    }

    #[test]
    fn fast_burst_stops_and_schedules_a_restart() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        let mut detector = detector(&fake);

        burst(&mut detector, "web", &[0, 1, 2]);

        assert_eq!(fake.calls(), vec!["options web", "stop_show web"]);
        assert!(fake.one_way().is_empty());
        let state = detector.state("web").unwrap();
        assert_eq!(state.timeline_len(), 0);
        assert_eq!(state.tries(), 1);
        assert_eq!(state.pending_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn exhausted_budget_terminates_without_a_timer() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        let mut detector = detector(&fake);

        burst(&mut detector, "web", &[0, 1, 2]);
        burst(&mut detector, "web", &[0, 1, 2]);

        assert_eq!(fake.one_way(), vec!["terminate web"]);
        assert_eq!(fake.count("stop_show web"), 1);
        let state = detector.state("web").unwrap();
        assert_eq!(state.timeline_len(), 0);
        assert_eq!(state.tries(), 0);
        assert!(!state.has_pending_retry());
    }

    #[test]
    fn slow_deaths_recover_without_commands() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        let mut detector = detector(&fake);

        burst(&mut detector, "web", &[0, 3, 6]);

        assert_eq!(fake.calls(), vec!["options web"]);
        assert!(fake.one_way().is_empty());
        let state = detector.state("web").unwrap();
        assert_eq!(state.timeline_len(), 0);
        assert_eq!(state.tries(), 0);
        assert!(!state.has_pending_retry());
    }

    #[test]
    fn retry_timer_starts_the_show_exactly_once() {
        let fake = FakeController::with_options(
            "web",
            "times: 2\nwithin: 5\nretry_in: 0.05\nmax_retry: 3",
        );
        let mut detector = detector(&fake);
        burst(&mut detector, "web", &[0, 1]);
        let generation = detector.state("web").unwrap().pending_generation().unwrap();

        let flow = detector.process_next(Duration::from_secs(5));
        assert_eq!(flow, Some(ControlFlow::Continue(())));
        assert_eq!(fake.count("start_show web"), 1);
        assert!(!detector.state("web").unwrap().has_pending_retry());

        // A duplicate expiry for the same timer is stale.
        detector.handle_message(DetectorMessage::RetryDue {
            show: "web".into(),
            generation,
        });
        assert_eq!(fake.count("start_show web"), 1);
    }

    #[test]
    fn failed_stop_changes_nothing() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        fake.refuse("stop_show web");
        let mut detector = detector(&fake);

        burst(&mut detector, "web", &[0, 1, 2]);

        let state = detector.state("web").unwrap();
        assert_eq!(state.tries(), 0);
        assert_eq!(state.timeline_len(), 3);
        assert!(!state.has_pending_retry());
    }

    #[test]
    fn timed_out_stop_still_arms_the_retry() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        fake.lose_reply("stop_show web");
        let mut detector = detector(&fake);

        burst(&mut detector, "web", &[0, 1, 2]);

        let state = detector.state("web").unwrap();
        assert_eq!(state.tries(), 1);
        assert_eq!(state.timeline_len(), 0);
        assert_eq!(state.pending_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn unreachable_controller_changes_nothing() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        fake.fail_connect("stop_show web");
        let mut detector = detector(&fake);

        burst(&mut detector, "web", &[0, 1, 2]);

        let state = detector.state("web").unwrap();
        assert_eq!(state.tries(), 0);
        assert_eq!(state.timeline_len(), 3);
        assert!(!state.has_pending_retry());
    }

    #[test]
    fn updated_merges_only_the_keys_present() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        let mut detector = detector(&fake);
        updated(&mut detector, "web");

        fake.set_options("web", "times: 5");
        updated(&mut detector, "web");

        let config = detector.state("web").unwrap().config().unwrap();
        assert_eq!(
            config,
            FlapConfig {
                times: 5,
                within: 5.0,
                retry_in: 2.0,
                max_retry: 1,
            }
        );
    }

    #[test]
    fn malformed_options_reply_applies_nothing() {
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        let mut detector = detector(&fake);
        updated(&mut detector, "web");

        fake.set_options("web", "times: 5\nwithin: soon");
        updated(&mut detector, "web");

        assert_eq!(detector.state("web").unwrap().config().unwrap().times, 3);
    }

    #[test]
    fn first_fetch_falls_back_to_defaults() {
        let fake = FakeController::with_options("web", "numprocesses: 4\ntimes: 4");
        let mut detector = detector(&fake);
        updated(&mut detector, "web");

        let config = detector.state("web").unwrap().config().unwrap();
        assert_eq!(
            config,
            FlapConfig {
                times: 4,
                ..FlapConfig::default()
            }
        );
    }

    #[test]
    fn death_without_thresholds_is_dropped() {
        let fake = Arc::new(FakeController::default());
        let mut detector = detector(&fake);

        death(&mut detector, "ghost", Instant::now());

        assert!(detector.state("ghost").is_none());
        assert_eq!(fake.calls(), vec!["options ghost"]);
    }

    #[test]
    fn config_is_fetched_once_then_cached() {
        let fake = FakeController::with_options("web", "times: 10");
        let mut detector = detector(&fake);

        burst(&mut detector, "web", &[0, 1, 2, 3]);

        assert_eq!(fake.count("options web"), 1);
        assert_eq!(detector.state("web").unwrap().timeline_len(), 4);
    }

    #[test]
    fn reset_cancels_the_pending_retry_and_is_idempotent() {
        let fake = FakeController::with_options(
            "web",
            "times: 2\nwithin: 5\nretry_in: 0.5\nmax_retry: 3",
        );
        let mut detector = detector(&fake);
        burst(&mut detector, "web", &[0, 1]);
        assert!(detector.state("web").unwrap().has_pending_retry());

        let handle = detector.handle();
        assert!(handle.reset("web"));
        assert!(handle.reset("web"));
        detector.process_next(Duration::from_secs(1));
        detector.process_next(Duration::from_secs(1));

        let state = detector.state("web").unwrap();
        assert_eq!(state.tries(), 0);
        assert_eq!(state.timeline_len(), 0);
        assert!(!state.has_pending_retry());

        assert!(detector.process_next(Duration::from_millis(800)).is_none());
        assert_eq!(fake.count("start_show web"), 0);
    }

    #[test]
    fn reset_of_unknown_show_is_a_no_op() {
        let fake = Arc::new(FakeController::default());
        let mut detector = detector(&fake);
        detector.reset("ghost");
        assert!(detector.state("ghost").is_none());
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn decisions_land_in_the_audit_log() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("flapping.jsonl");
        let audit = Arc::new(ExecutionLog::new(&path).unwrap());
        let fake = FakeController::with_options("web", RESTART_OPTIONS);
        let mut detector = detector(&fake).with_audit(audit);

        burst(&mut detector, "web", &[0, 1, 2]);
        burst(&mut detector, "web", &[0, 1, 2]);

        let content = std::fs::read_to_string(&path).unwrap();
        let events: Vec<String> = content
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                "config_refreshed",
                "flapping_detected",
                "retry_scheduled",
                "flapping_detected",
                "terminated",
            ]
        );
    }

    #[test]
    fn shutdown_breaks_the_loop() {
        let fake = Arc::new(FakeController::default());
        let mut detector = detector(&fake);
        assert!(detector.handle_message(DetectorMessage::Shutdown).is_break());
    }

    #[test]
    fn running_detector_consumes_the_feed_and_stops_cleanly() {
        let publisher = Publisher::bind("127.0.0.1:0").unwrap();
        let fake = FakeController::with_options(
            "web",
            "times: 2\nwithin: 30\nretry_in: 60\nmax_retry: 1",
        );
        let subscriber = Subscriber::connect(publisher.local_addr(), "show.").unwrap();
        let running = RunningDetector::spawn(detector(&fake), subscriber).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while publisher.subscriber_count() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        publisher.publish("show.web.reap", "{}");
        publisher.publish("show.web.spawn", "{}");
        publisher.publish("show.web.reap", "{}");

        while fake.count("stop_show web") == 0 {
            assert!(Instant::now() < deadline, "detector never reacted: {:?}", fake.calls());
            thread::sleep(Duration::from_millis(5));
        }

        // The pending 60s retry must not hold up shutdown.
        let started = Instant::now();
        running.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fake.count("start_show web"), 0);
    }
}
