//! Seam between the controller and whatever it controls.
//!
//! The controller never knows what a show is. It resolves names through a
//! [`Registry`] (the global supervisor), asks the resolved [`Target`] whether
//! it has an operation for the verb, then invokes it.

use crate::error::HandlerError;
use crate::protocol::{self, OK};

/// What a handler hands back to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sent verbatim to the caller.
    Text(String),
    /// Nothing is sent for this request.
    Silent,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn ok() -> Self {
        Reply::Text(OK.to_string())
    }

    /// An `error: ...` reply produced by the handler itself.
    pub fn error(detail: impl std::fmt::Display) -> Self {
        Reply::Text(protocol::error_reply(detail))
    }
}

pub type HandlerResult = Result<Reply, HandlerError>;

/// A named controllable unit exposing verb-named operations.
pub trait Target {
    /// Whether `verb` (already lower-cased) names an operation on this target.
    fn has_operation(&self, verb: &str) -> bool;

    /// Run the operation for `verb`. Only called after `has_operation` said yes.
    fn invoke(&mut self, verb: &str, args: &[String]) -> HandlerResult;
}

/// The global supervisor: a target that also owns every named target.
pub trait Registry: Target {
    fn contains(&self, name: &str) -> bool;

    fn resolve(&mut self, name: &str) -> Option<&mut dyn Target>;

    /// Periodic housekeeping, run once per controller poll.
    fn maintain(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_constructors() {
        assert_eq!(Reply::ok(), Reply::Text("ok".into()));
        assert_eq!(
            Reply::error("invalid number of parameters"),
            Reply::Text("error: invalid number of parameters".into())
        );
        assert_ne!(Reply::text(""), Reply::Silent);
    }
}
