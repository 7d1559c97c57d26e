//! A show: a named group of identical worker processes.
//!
//! The show keeps `numprocesses` copies of `cmd` running, reaps the ones that
//! die, and publishes every lifecycle change on `show.<name>.<kind>`. All
//! process handling is non-blocking except stopping, which waits up to
//! `graceful_timeout` for the workers to exit before killing them.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::flapping::state::{
    DEFAULT_MAX_RETRY, DEFAULT_RETRY_IN, DEFAULT_TIMES, DEFAULT_WITHIN, secs,
};
use crate::pubsub::{EventSink, show_topic};
use crate::target::{HandlerResult, Reply, Target};

const STOP_POLL: Duration = Duration::from_millis(50);

/// Option names, in the order `options` lists them.
pub const OPTION_NAMES: &[&str] = &[
    "numprocesses",
    "warmup_delay",
    "working_dir",
    "send_hup",
    "shell",
    "env",
    "cmd",
    "times",
    "within",
    "retry_in",
    "max_retry",
    "graceful_timeout",
];

const OPERATIONS: &[&str] = &[
    "set",
    "mset",
    "get",
    "mget",
    "options",
    "status",
    "start",
    "stop",
    "quit",
    "kill",
    "terminate",
    "restart",
    "reload",
    "hup",
    "numprocesses",
    "processes",
    "info",
    "incr",
    "decr",
    "signal",
];

const INVALID_PARAMETERS: &str = "invalid number of parameters";

fn default_numprocesses() -> u32 {
    1
}

fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn default_times() -> u32 {
    DEFAULT_TIMES
}

fn default_within() -> f64 {
    DEFAULT_WITHIN
}

fn default_retry_in() -> f64 {
    DEFAULT_RETRY_IN
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_graceful_timeout() -> f64 {
    30.0
}

/// Everything that can be set on a show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowOptions {
    pub cmd: String,
    #[serde(default = "default_numprocesses")]
    pub numprocesses: u32,
    /// Seconds to wait between consecutive spawns.
    #[serde(default)]
    pub warmup_delay: f64,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Reload by sending SIGHUP instead of respawning.
    #[serde(default)]
    pub send_hup: bool,
    /// Run `cmd` through `sh -c`.
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_times")]
    pub times: u32,
    #[serde(default = "default_within")]
    pub within: f64,
    #[serde(default = "default_retry_in")]
    pub retry_in: f64,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout: f64,
}

impl ShowOptions {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            numprocesses: default_numprocesses(),
            warmup_delay: 0.0,
            working_dir: default_working_dir(),
            send_hup: false,
            shell: false,
            env: BTreeMap::new(),
            times: default_times(),
            within: default_within(),
            retry_in: default_retry_in(),
            max_retry: default_max_retry(),
            graceful_timeout: default_graceful_timeout(),
        }
    }

    /// Render one option the way `get` and `options` report it.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "numprocesses" => self.numprocesses.to_string(),
            "warmup_delay" => self.warmup_delay.to_string(),
            "working_dir" => self.working_dir.display().to_string(),
            "send_hup" => self.send_hup.to_string(),
            "shell" => self.shell.to_string(),
            "env" => env_to_str(&self.env),
            "cmd" => self.cmd.clone(),
            "times" => self.times.to_string(),
            "within" => self.within.to_string(),
            "retry_in" => self.retry_in.to_string(),
            "max_retry" => self.max_retry.to_string(),
            "graceful_timeout" => self.graceful_timeout.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Parse and store one option. Returns what the change requires.
    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<Action> {
        let action = match key {
            "numprocesses" => {
                self.numprocesses = parse_value(key, value)?;
                Action::Manage
            }
            "warmup_delay" => {
                self.warmup_delay = parse_seconds(key, value)?;
                Action::Manage
            }
            "working_dir" => {
                self.working_dir = PathBuf::from(value);
                Action::Respawn
            }
            "send_hup" => {
                self.send_hup = to_bool(value)?;
                Action::Manage
            }
            "shell" => {
                self.shell = to_bool(value)?;
                Action::Respawn
            }
            "env" => {
                self.env = parse_env(value)?;
                Action::Respawn
            }
            "cmd" => {
                if value.trim().is_empty() {
                    bail!("cmd must not be empty");
                }
                self.cmd = value.to_string();
                Action::Respawn
            }
            "times" => {
                let times: u32 = parse_value(key, value)?;
                if times == 0 {
                    bail!("times must be at least 1");
                }
                self.times = times;
                Action::Manage
            }
            "within" => {
                self.within = parse_seconds(key, value)?;
                Action::Manage
            }
            "retry_in" => {
                self.retry_in = parse_seconds(key, value)?;
                Action::Manage
            }
            "max_retry" => {
                self.max_retry = parse_value(key, value)?;
                Action::Manage
            }
            "graceful_timeout" => {
                self.graceful_timeout = parse_seconds(key, value)?;
                Action::Manage
            }
            _ => bail!("'{key}' option not found"),
        };
        Ok(action)
    }

    fn command(&self) -> io::Result<Command> {
        let mut command = if self.shell {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&self.cmd);
            command
        } else {
            let mut words = self.cmd.split_whitespace();
            let Some(program) = words.next() else {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
            };
            let mut command = Command::new(program);
            command.args(words);
            command
        };
        command
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::null());
        Ok(command)
    }
}

fn parse_value<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value '{value}' for {key}"))
}

fn parse_seconds(key: &str, value: &str) -> anyhow::Result<f64> {
    let seconds: f64 = parse_value(key, value)?;
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("invalid value '{value}' for {key}: expected a non-negative number of seconds");
    }
    Ok(seconds)
}

/// `true`/`1` and `false`/`0`, case-insensitive.
pub fn to_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => bail!("invalid boolean '{other}'"),
    }
}

/// `KEY=VALUE,KEY2=VALUE2`.
pub fn parse_env(value: &str) -> anyhow::Result<BTreeMap<String, String>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => bail!("invalid environment entry '{pair}'"),
        })
        .collect()
}

pub fn env_to_str(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Manage,
    Respawn,
}

/// Signals the control protocol can deliver to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Kill,
    Usr1,
    Usr2,
    Term,
    Cont,
    Stop,
}

impl Signal {
    /// Accepts `TERM`, `term` and `SIGTERM`.
    pub fn from_name(name: &str) -> Option<Signal> {
        let upper = name.to_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        let signal = match bare {
            "HUP" => Signal::Hup,
            "INT" => Signal::Int,
            "QUIT" => Signal::Quit,
            "KILL" => Signal::Kill,
            "USR1" => Signal::Usr1,
            "USR2" => Signal::Usr2,
            "TERM" => Signal::Term,
            "CONT" => Signal::Cont,
            "STOP" => Signal::Stop,
            _ => return None,
        };
        Some(signal)
    }

    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Kill => libc::SIGKILL,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Term => libc::SIGTERM,
            Signal::Cont => libc::SIGCONT,
            Signal::Stop => libc::SIGSTOP,
        }
    }
}

/// Deliver `signal` to `child`. A process that is already gone is not an error.
#[cfg(unix)]
fn send_signal(child: &Child, signal: Signal) -> io::Result<()> {
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal.as_raw()) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, signal: Signal) -> io::Result<()> {
    match signal {
        Signal::Kill | Signal::Term | Signal::Quit | Signal::Int => match child.kill() {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other,
        },
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{signal:?} is not supported on this platform"),
        )),
    }
}

struct Process {
    id: u32,
    child: Child,
}

impl Process {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn info(&self) -> String {
        format!("{}: pid {}", self.id, self.pid())
    }

    fn signal(&mut self, signal: Signal) -> io::Result<()> {
        #[cfg(unix)]
        {
            send_signal(&self.child, signal)
        }
        #[cfg(not(unix))]
        {
            send_signal(&mut self.child, signal)
        }
    }

    /// Exited (and reaped), or no longer observable.
    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A named group of identical worker processes.
pub struct Show {
    name: String,
    options: ShowOptions,
    processes: BTreeMap<u32, Process>,
    /// Killed workers not yet reaped. They never produce `reap` events.
    dying: Vec<Process>,
    counter: u32,
    stopped: bool,
    events: Arc<dyn EventSink>,
}

impl Show {
    /// A stopped show. Call [`Show::start`] to spawn its workers.
    pub fn new(name: &str, options: ShowOptions, events: Arc<dyn EventSink>) -> Self {
        Self {
            name: name.to_lowercase(),
            options,
            processes: BTreeMap::new(),
            dying: Vec::new(),
            counter: 0,
            stopped: true,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ShowOptions {
        &self.options
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn process_ids(&self) -> Vec<u32> {
        self.processes.keys().copied().collect()
    }

    fn publish(&self, kind: &str, payload: serde_json::Value) {
        self.events
            .publish(&show_topic(&self.name, kind), &payload.to_string());
    }

    /// Reap dead workers and spawn or retire workers to match `numprocesses`.
    pub fn maintain(&mut self) -> io::Result<()> {
        self.reap();
        self.manage()
    }

    /// Collect exited workers, publishing `reap` for each.
    pub fn reap(&mut self) {
        self.dying.retain_mut(|process| !process.has_exited());
        if self.stopped {
            return;
        }

        let mut exited: Vec<(u32, Option<ExitStatus>)> = Vec::new();
        for (id, process) in &mut self.processes {
            match process.child.try_wait() {
                Ok(Some(status)) => exited.push((*id, Some(status))),
                Ok(None) => {}
                Err(e) => {
                    warn!(show = %self.name, process = id, error = %e, "worker status unavailable");
                    exited.push((*id, None));
                }
            }
        }

        for (id, status) in exited {
            let Some(process) = self.processes.remove(&id) else {
                continue;
            };
            let exit_code = status.and_then(|s| s.code());
            debug!(show = %self.name, process = id, pid = process.pid(), ?exit_code, "worker reaped");
            self.publish(
                "reap",
                json!({
                    "process_id": id,
                    "pid": process.pid(),
                    "exit_code": exit_code,
                    "time": now_rfc3339(),
                }),
            );
        }
    }

    fn manage(&mut self) -> io::Result<()> {
        if self.stopped {
            return Ok(());
        }

        let target = usize::try_from(self.options.numprocesses).unwrap_or(usize::MAX);
        while self.processes.len() < target {
            self.spawn_process()?;
            if self.stopped {
                return Ok(());
            }
            if self.processes.len() < target && self.options.warmup_delay > 0.0 {
                thread::sleep(secs(self.options.warmup_delay));
            }
        }

        while self.processes.len() > target {
            let Some((_, process)) = self.processes.pop_first() else {
                break;
            };
            self.retire(process, Signal::Term);
        }
        Ok(())
    }

    /// Spawn one worker, retrying up to `max_retry` times. When every attempt
    /// fails the show is stopped and the last error returned.
    fn spawn_process(&mut self) -> io::Result<()> {
        self.counter += 1;
        let id = self.counter;
        let attempts = self.options.max_retry.max(1);

        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.options.command().and_then(|mut command| command.spawn()) {
                Ok(child) => {
                    let process = Process { id, child };
                    info!(show = %self.name, process = id, pid = process.pid(), "worker running");
                    self.publish(
                        "spawn",
                        json!({ "process_id": id, "pid": process.pid(), "time": now_rfc3339() }),
                    );
                    self.processes.insert(id, process);
                    return Ok(());
                }
                Err(e) => {
                    warn!(show = %self.name, attempt, error = %e, "failed to spawn worker");
                    last_err = Some(e);
                }
            }
        }

        self.stop(true);
        Err(last_err.unwrap_or_else(|| io::Error::other("worker was never spawned")))
    }

    /// Signal a worker that is no longer tracked and park it until it exits.
    fn retire(&mut self, mut process: Process, signal: Signal) {
        if let Err(e) = self.kill_process(&mut process, signal) {
            warn!(show = %self.name, process = process.id, error = %e, "failed to signal worker");
        }
        self.dying.push(process);
    }

    fn kill_process(&self, process: &mut Process, signal: Signal) -> io::Result<()> {
        self.publish(
            "kill",
            json!({ "process_id": process.id, "pid": process.pid(), "time": now_rfc3339() }),
        );
        info!(show = %self.name, process = process.id, pid = process.pid(), ?signal, "killing worker");
        process.signal(signal)
    }

    /// Stop every worker: signal, wait up to `graceful_timeout`, then kill.
    ///
    /// Graceful stops send SIGQUIT, non-graceful ones SIGTERM.
    pub fn stop(&mut self, graceful: bool) {
        self.stopped = true;
        let signal = if graceful { Signal::Quit } else { Signal::Term };

        let mut dying: Vec<Process> = std::mem::take(&mut self.processes).into_values().collect();
        for process in &mut dying {
            if let Err(e) = self.kill_process(process, signal) {
                warn!(show = %self.name, process = process.id, error = %e, "failed to signal worker");
            }
        }
        dying.append(&mut self.dying);

        let deadline = Instant::now() + secs(self.options.graceful_timeout);
        loop {
            dying.retain_mut(|process| !process.has_exited());
            if dying.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(STOP_POLL);
        }

        for mut process in dying {
            warn!(show = %self.name, process = process.id, "worker outlived graceful timeout; killing");
            let _ = process.signal(Signal::Kill);
            let _ = process.child.wait();
        }

        self.publish("stop", json!({ "time": now_rfc3339() }));
        info!(show = %self.name, graceful, "show stopped");
    }

    /// Start a stopped show. Starting a running show does nothing.
    pub fn start(&mut self) -> io::Result<()> {
        if !self.stopped {
            return Ok(());
        }
        self.stopped = false;
        self.maintain()?;
        info!(show = %self.name, "show started");
        self.publish("start", json!({ "time": now_rfc3339() }));
        Ok(())
    }

    pub fn restart(&mut self) -> io::Result<()> {
        self.publish("restart", json!({ "time": now_rfc3339() }));
        self.stop(true);
        self.start()
    }

    /// HUP every worker when `send_hup` is set, otherwise replace them all.
    pub fn reload(&mut self) -> io::Result<()> {
        if self.options.send_hup {
            for process in self.processes.values_mut() {
                info!(show = %self.name, process = process.id, pid = process.pid(), "sending HUP");
                process.signal(Signal::Hup)?;
            }
        } else if !self.stopped {
            self.respawn()?;
        }
        self.publish("reload", json!({ "time": now_rfc3339() }));
        info!(show = %self.name, "show reloaded");
        Ok(())
    }

    /// Spawn a full set of fresh workers, then retire the oldest surplus.
    fn respawn(&mut self) -> io::Result<()> {
        for _ in 0..self.options.numprocesses {
            self.spawn_process()?;
            if self.stopped {
                return Ok(());
            }
        }
        self.manage()
    }

    fn apply(&mut self, action: Action) -> io::Result<()> {
        if self.stopped {
            return Ok(());
        }
        match action {
            Action::Manage => self.maintain(),
            Action::Respawn => self.respawn(),
        }
    }

    /// Set one option and publish `updated`.
    pub fn set_option(&mut self, key: &str, value: &str) -> HandlerResult {
        if !OPTION_NAMES.contains(&key) {
            return Ok(Reply::error(format!("'{key}' option not found")));
        }
        let action = self.options.set(key, value)?;
        self.publish("updated", json!({ "time": now_rfc3339() }));
        self.apply(action)?;
        Ok(Reply::ok())
    }

    fn handle_mset(&mut self, args: &[String]) -> HandlerResult {
        if args.len() < 2 || args.len() % 2 != 0 {
            return Ok(Reply::error(INVALID_PARAMETERS));
        }
        if let Some(unknown) = args
            .iter()
            .step_by(2)
            .find(|key| !OPTION_NAMES.contains(&key.as_str()))
        {
            return Ok(Reply::error(format!("'{unknown}' option not found")));
        }

        // All pairs land or none do.
        let mut options = self.options.clone();
        let mut action = Action::Manage;
        for pair in args.chunks(2) {
            if options.set(&pair[0], &pair[1])? == Action::Respawn {
                action = Action::Respawn;
            }
        }
        self.options = options;
        self.publish("updated", json!({ "time": now_rfc3339() }));
        self.apply(action)?;
        Ok(Reply::ok())
    }

    fn handle_mget(&self, keys: &[String]) -> Reply {
        if keys.is_empty() {
            return Reply::error(INVALID_PARAMETERS);
        }
        let mut lines = Vec::with_capacity(keys.len());
        for key in keys {
            match self.options.get(key) {
                Some(value) => lines.push(format!("{key}: {value}")),
                None => return Reply::error(format!("'{key}' option not found")),
            }
        }
        Reply::text(lines.join("\n"))
    }

    fn options_text(&self) -> String {
        OPTION_NAMES
            .iter()
            .filter_map(|key| Some(format!("{key}: {}", self.options.get(key)?)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn parse_process_id(raw: &str) -> anyhow::Result<u32> {
        raw.parse()
            .with_context(|| format!("invalid process id '{raw}'"))
    }

    /// `quit`/`terminate` with a process id: retire just that worker.
    fn handle_retire(&mut self, args: &[String], signal: Signal, graceful: bool) -> HandlerResult {
        let Some(raw) = args.first() else {
            self.stop(graceful);
            return Ok(Reply::ok());
        };
        let id = Self::parse_process_id(raw)?;
        let Some(mut process) = self.processes.remove(&id) else {
            return Ok(Reply::error(format!("process '{id}' not found")));
        };
        let result = self.kill_process(&mut process, signal);
        self.dying.push(process);
        result?;
        Ok(Reply::ok())
    }

    fn handle_info(&self, args: &[String]) -> HandlerResult {
        let Some(raw) = args.first() else {
            let lines: Vec<String> = self.processes.values().map(Process::info).collect();
            return Ok(Reply::text(lines.join("\n")));
        };
        let id = Self::parse_process_id(raw)?;
        Ok(match self.processes.get(&id) {
            Some(process) => Reply::text(process.info()),
            None => Reply::error(format!("process '{id}' not found")),
        })
    }

    fn handle_signal(&mut self, args: &[String]) -> HandlerResult {
        let [raw_id, name] = args else {
            return Ok(Reply::error(INVALID_PARAMETERS));
        };
        let Some(signal) = Signal::from_name(name) else {
            return Ok(Reply::error(format!("unknown signal {name}")));
        };
        let id = Self::parse_process_id(raw_id)?;
        let Some(process) = self.processes.get_mut(&id) else {
            return Ok(Reply::error("process not found"));
        };
        process.signal(signal)?;
        Ok(Reply::ok())
    }

    fn scale(&mut self, grow: bool) -> HandlerResult {
        self.options.numprocesses = if grow {
            self.options.numprocesses.saturating_add(1)
        } else {
            self.options.numprocesses.saturating_sub(1)
        };
        self.manage()?;
        Ok(Reply::text(self.options.numprocesses.to_string()))
    }

    /// Snapshot for `status`-style listings: `(id, pid)` per live worker.
    pub fn pids(&self) -> HashMap<u32, u32> {
        self.processes
            .iter()
            .map(|(id, process)| (*id, process.pid()))
            .collect()
    }
}

impl Target for Show {
    fn has_operation(&self, verb: &str) -> bool {
        OPERATIONS.contains(&verb)
    }

    fn invoke(&mut self, verb: &str, args: &[String]) -> HandlerResult {
        match verb {
            "set" => match args {
                [key, value @ ..] if !value.is_empty() => self.set_option(key, &value.join(" ")),
                _ => Ok(Reply::error(INVALID_PARAMETERS)),
            },
            "mset" => self.handle_mset(args),
            "get" => Ok(match args.first() {
                Some(key) => match self.options.get(key) {
                    Some(value) => Reply::text(value),
                    None => Reply::error(format!("'{key}' option not found")),
                },
                None => Reply::error(INVALID_PARAMETERS),
            }),
            "mget" => Ok(self.handle_mget(args)),
            "options" => Ok(Reply::text(self.options_text())),
            "status" => Ok(Reply::text(if self.stopped { "stopped" } else { "active" })),
            "start" => {
                self.start()?;
                Ok(Reply::ok())
            }
            "stop" | "quit" | "kill" => self.handle_retire(args, Signal::Term, true),
            "terminate" => self.handle_retire(args, Signal::Term, false),
            "restart" => {
                self.restart()?;
                Ok(Reply::ok())
            }
            "reload" | "hup" => {
                self.reload()?;
                Ok(Reply::ok())
            }
            "numprocesses" => Ok(Reply::text(self.options.numprocesses.to_string())),
            "processes" => Ok(Reply::text(
                self.process_ids()
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            )),
            "info" => self.handle_info(args),
            "incr" => self.scale(true),
            "decr" => self.scale(false),
            "signal" => self.handle_signal(args),
            _ => unreachable!("no handler for listed operation '{verb}'"),
        }
    }
}

impl Drop for Show {
    fn drop(&mut self) {
        for process in self.processes.values_mut().chain(self.dying.iter_mut()) {
            let _ = process.signal(Signal::Kill);
            let _ = process.child.wait();
        }
    }
}
