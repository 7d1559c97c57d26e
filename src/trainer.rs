//! The trainer: global supervisor owning every show.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::flapping::FlappingHandle;
use crate::pubsub::EventSink;
use crate::show::{Show, ShowOptions};
use crate::target::{HandlerResult, Registry, Reply, Target};

const OPERATIONS: &[&str] = &[
    "add_show",
    "del_show",
    "stop_show",
    "start_show",
    "reset_flapping",
    "list",
    "numshows",
    "numprocesses",
    "status",
    "reload",
    "stop",
    "quit",
    "terminate",
];

const INVALID_PARAMETERS: &str = "invalid number of parameters";

/// Owns the shows and answers supervisor-wide commands.
pub struct Trainer {
    shows: BTreeMap<String, Show>,
    events: Arc<dyn EventSink>,
    stop: Arc<AtomicBool>,
    flapping: Option<FlappingHandle>,
}

impl Trainer {
    /// `stop` is raised by `stop`, `quit` and `terminate` to end the
    /// controller loop.
    pub fn new(events: Arc<dyn EventSink>, stop: Arc<AtomicBool>) -> Self {
        Self {
            shows: BTreeMap::new(),
            events,
            stop,
            flapping: None,
        }
    }

    /// Route `reset_flapping` to a running detector.
    pub fn attach_flapping(&mut self, handle: FlappingHandle) {
        self.flapping = Some(handle);
    }

    /// Add a show and start it. Names are case-insensitive.
    pub fn add_show(&mut self, name: &str, options: ShowOptions) -> HandlerResult {
        let name = name.to_lowercase();
        if self.shows.contains_key(&name) {
            return Ok(Reply::error(format!("show {name} already exists")));
        }

        let mut show = Show::new(&name, options, Arc::clone(&self.events));
        let started = show.start();
        self.shows.insert(name.clone(), show);
        started?;
        info!(show = %name, "show added");
        Ok(Reply::ok())
    }

    pub fn show(&self, name: &str) -> Option<&Show> {
        self.shows.get(name)
    }

    pub fn show_names(&self) -> Vec<&str> {
        self.shows.keys().map(String::as_str).collect()
    }

    /// Stop every show. Graceful stops give workers their timeout first.
    pub fn stop_all(&mut self, graceful: bool) {
        for show in self.shows.values_mut() {
            show.stop(graceful);
        }
    }

    fn shutdown(&mut self, graceful: bool) -> HandlerResult {
        info!(graceful, "trainer shutting down");
        self.stop_all(graceful);
        self.stop.store(true, Ordering::Release);
        Ok(Reply::ok())
    }

    fn named<'a>(&mut self, args: &'a [String]) -> Result<(&'a str, &mut Show), Reply> {
        let Some(name) = args.first() else {
            return Err(Reply::error(INVALID_PARAMETERS));
        };
        match self.shows.get_mut(name.as_str()) {
            Some(show) => Ok((name.as_str(), show)),
            None => Err(Reply::error(format!("program {name} not found"))),
        }
    }

    fn del_show(&mut self, args: &[String]) -> HandlerResult {
        let name = match self.named(args) {
            Ok((name, show)) => {
                show.stop(true);
                name
            }
            Err(reply) => return Ok(reply),
        };
        self.shows.remove(name);
        if let Some(flapping) = &self.flapping {
            flapping.reset(name);
        }
        info!(show = %name, "show deleted");
        Ok(Reply::ok())
    }

    fn reset_flapping(&mut self, args: &[String]) -> HandlerResult {
        let name = match self.named(args) {
            Ok((name, _)) => name,
            Err(reply) => return Ok(reply),
        };
        match &self.flapping {
            Some(flapping) if flapping.reset(name) => Ok(Reply::ok()),
            _ => Ok(Reply::error("flapping detector is not running")),
        }
    }

    fn status(&self) -> String {
        self.shows
            .iter()
            .map(|(name, show)| {
                let status = if show.is_stopped() { "stopped" } else { "active" };
                format!("{name}: {status}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Target for Trainer {
    fn has_operation(&self, verb: &str) -> bool {
        OPERATIONS.contains(&verb)
    }

    fn invoke(&mut self, verb: &str, args: &[String]) -> HandlerResult {
        match verb {
            "add_show" => match args {
                [name, cmd] => self.add_show(name, ShowOptions::new(cmd.as_str())),
                _ => Ok(Reply::error(INVALID_PARAMETERS)),
            },
            "del_show" => self.del_show(args),
            "stop_show" => match self.named(args) {
                Ok((_, show)) => {
                    show.stop(true);
                    Ok(Reply::ok())
                }
                Err(reply) => Ok(reply),
            },
            "start_show" => match self.named(args) {
                Ok((_, show)) => {
                    show.start()?;
                    Ok(Reply::ok())
                }
                Err(reply) => Ok(reply),
            },
            "reset_flapping" => self.reset_flapping(args),
            "list" => Ok(Reply::text(self.show_names().join(","))),
            "numshows" => Ok(Reply::text(self.shows.len().to_string())),
            "numprocesses" => {
                let total: usize = self.shows.values().map(Show::len).sum();
                Ok(Reply::text(total.to_string()))
            }
            "status" => Ok(Reply::text(self.status())),
            "reload" => {
                for show in self.shows.values_mut() {
                    show.reload()?;
                }
                Ok(Reply::ok())
            }
            "stop" | "quit" => self.shutdown(true),
            "terminate" => self.shutdown(false),
            _ => unreachable!("no handler for listed operation '{verb}'"),
        }
    }
}

impl Registry for Trainer {
    fn contains(&self, name: &str) -> bool {
        self.shows.contains_key(name)
    }

    fn resolve(&mut self, name: &str) -> Option<&mut dyn Target> {
        self.shows
            .get_mut(name)
            .map(|show| show as &mut dyn Target)
    }

    fn maintain(&mut self) {
        for (name, show) in &mut self.shows {
            if let Err(e) = show.maintain() {
                warn!(show = %name, error = %e, "show maintenance failed");
            }
        }
    }
}
