//! Command-line parsing and routing.
//!
//! A message is `<verb> [<name>] [<args...>]`. The verb is case-insensitive
//! and show names are lower-cased. Routing picks the target the verb runs on:
//!
//! ```text
//! stop                    → supervisor, []
//! add_show web cmd -x     → supervisor, ["web", "cmd -x"]
//! del_show web            → supervisor, ["web"]   (web must exist)
//! status web              → show "web", []
//! set web numprocesses 3  → show "web", ["numprocesses", "3"]
//! ```

use crate::error::MessageError;
use crate::target::Registry;

/// Verbs that name a show but run on the global supervisor. The show must
/// exist before the message is dispatched.
pub const SHOW_SCOPED_GLOBAL_VERBS: &[&str] =
    &["del_show", "stop_show", "start_show", "reset_flapping"];

/// Supervisor verbs whose handler may shut the controller down.
pub const SHUTDOWN_VERBS: &[&str] = &["stop", "quit", "terminate"];

const ADD_SHOW: &str = "add_show";

/// Where a parsed command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHandle {
    /// The global supervisor.
    Supervisor,
    /// A named show.
    Show(String),
}

/// A parsed command, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub verb: String,
    pub target: TargetHandle,
    pub args: Vec<String>,
}

impl RoutingDecision {
    fn supervisor(verb: String, args: Vec<String>) -> Self {
        Self {
            verb,
            target: TargetHandle::Supervisor,
            args,
        }
    }

    /// Whether the caller must be acknowledged before the handler runs.
    ///
    /// Stopping the global supervisor ends the controller's own loop, so
    /// there is no chance to reply afterwards.
    pub fn requires_early_ack(&self) -> bool {
        self.target == TargetHandle::Supervisor && SHUTDOWN_VERBS.contains(&self.verb.as_str())
    }
}

/// Parse a raw command line and decide which target it runs on.
///
/// Name resolution happens here, so `del_show missing` fails before any
/// handler is looked up.
pub fn parse_message(raw: &str, registry: &dyn Registry) -> Result<RoutingDecision, MessageError> {
    let mut tokens = raw.split_whitespace();
    let Some(first) = tokens.next() else {
        return Err(MessageError::Empty);
    };
    let verb = first.to_lowercase();

    let Some(second) = tokens.next() else {
        return Ok(RoutingDecision::supervisor(verb, Vec::new()));
    };
    let name = second.to_lowercase();
    let rest: Vec<String> = tokens.map(str::to_string).collect();

    if verb == ADD_SHOW {
        if rest.is_empty() {
            return Err(MessageError::InvalidParameters);
        }
        return Ok(RoutingDecision::supervisor(verb, vec![name, rest.join(" ")]));
    }

    if !registry.contains(&name) {
        return Err(MessageError::TargetNotFound(name));
    }

    if SHOW_SCOPED_GLOBAL_VERBS.contains(&verb.as_str()) {
        return Ok(RoutingDecision::supervisor(verb, vec![name]));
    }

    Ok(RoutingDecision {
        verb,
        target: TargetHandle::Show(name),
        args: rest,
    })
}
