//! Command controller: the request/reply half of the control plane.
//!
//! ## Dispatch
//!
//! ```text
//! poll        → wait up to `timeout` for a request (interrupts are swallowed)
//! parse       → verb, target, args                 (MessageError → error reply)
//! resolve     → target has an operation for verb?  (no → "error: message '<raw>'")
//! pre-ack     → shutdown verbs on the supervisor get "ok" *now*
//! invoke      → handler runs, panics contained
//! translate   → Text → verbatim, Silent → nothing, Os → "error: <msg>",
//!               anything else → "error: command '<raw>': <msg> [<detail>]"
//! ```
//!
//! No per-message failure escapes the loop. Only endpoint failures end it.

pub mod endpoint;
pub mod routing;

use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{HandlerError, MessageError, PollError};
use crate::protocol::{Identity, OK, error_reply, is_error};
use crate::target::{HandlerResult, Registry, Reply, Target};

pub use endpoint::{Inbound, RouterEndpoint};
pub use routing::{RoutingDecision, TargetHandle, parse_message};

/// Default bounded wait for one poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Routes commands from the endpoint to the registry and replies.
pub struct Controller<R: Registry> {
    endpoint: RouterEndpoint,
    registry: R,
    timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl<R: Registry> Controller<R> {
    pub fn new(endpoint: RouterEndpoint, registry: R, timeout: Duration, stop: Arc<AtomicBool>) -> Self {
        Self {
            endpoint,
            registry,
            timeout,
            stop,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    /// Tear down the endpoint and hand the registry back.
    pub fn into_registry(self) -> R {
        let Controller {
            endpoint, registry, ..
        } = self;
        drop(endpoint);
        registry
    }

    /// Run until the stop flag is raised or the endpoint fails.
    pub fn run(&mut self) -> Result<(), PollError> {
        info!(endpoint = %self.local_addr(), "controller loop starting");
        while !self.stop.load(Ordering::Acquire) {
            self.registry.maintain();
            if let Err(e) = self.poll() {
                error!(error = %e, "controller poll failed; leaving loop");
                return Err(e);
            }
        }
        info!("controller loop stopped");
        Ok(())
    }

    /// Wait up to the configured timeout for a request, then handle it and
    /// anything else already queued. Returns how many requests were handled.
    pub fn poll(&mut self) -> Result<usize, PollError> {
        let mut wait = self.timeout;
        let mut handled = 0;
        loop {
            let inbound = match self.endpoint.poll(wait) {
                Ok(Some(inbound)) => inbound,
                Ok(None) => return Ok(handled),
                Err(e) if e.is_interrupt() => {
                    debug!(error = %e, "poll interrupted; resuming");
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.handle(inbound);
            handled += 1;
            if self.stop.load(Ordering::Acquire) {
                return Ok(handled);
            }
            wait = Duration::ZERO;
        }
    }

    fn handle(&mut self, inbound: Inbound) {
        let Inbound { identity, payload } = inbound;
        let raw = payload.trim();
        if raw.is_empty() {
            deliver(&self.endpoint, &identity, raw, &error_reply(MessageError::Empty));
            return;
        }

        if let Some(reply) = self.dispatch(&identity, raw) {
            deliver(&self.endpoint, &identity, raw, &reply);
        }
    }

    /// Route, resolve, optionally pre-acknowledge, invoke, translate.
    ///
    /// Returns the reply still owed to the caller, if any.
    fn dispatch(&mut self, identity: &Identity, raw: &str) -> Option<String> {
        let decision = match parse_message(raw, &self.registry) {
            Ok(decision) => decision,
            Err(e) => {
                debug!(command = raw, kind = e.as_label(), error = %e, "rejected command");
                return Some(error_reply(e));
            }
        };

        let early_ack = decision.requires_early_ack();
        let RoutingDecision { verb, target, args } = decision;

        let target: &mut dyn Target = match &target {
            TargetHandle::Supervisor => &mut self.registry,
            TargetHandle::Show(name) => match self.registry.resolve(name) {
                Some(show) => show,
                None => return Some(error_reply(MessageError::TargetNotFound(name.clone()))),
            },
        };

        if !target.has_operation(&verb) {
            let e = MessageError::UnknownOperation(raw.to_string());
            debug!(command = raw, kind = e.as_label(), "no such operation");
            return Some(error_reply(e));
        }

        if early_ack {
            deliver(&self.endpoint, identity, raw, OK);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| target.invoke(&verb, &args)));
        let reply = translate(raw, outcome);

        if early_ack {
            if let Some(reply) = reply.filter(|r| is_error(r)) {
                warn!(command = raw, reply = %reply, "acknowledged command failed");
            }
            return None;
        }
        reply
    }
}

fn translate(raw: &str, outcome: std::thread::Result<HandlerResult>) -> Option<String> {
    match outcome {
        Ok(Ok(Reply::Text(text))) => Some(text),
        Ok(Ok(Reply::Silent)) => None,
        Ok(Err(HandlerError::Os(e))) => {
            warn!(command = raw, error = %e, "operation failed");
            Some(error_reply(e))
        }
        Ok(Err(HandlerError::Failed(e))) => {
            error!(command = raw, error = ?e, "command raised an error");
            Some(error_reply(format!("command '{raw}': {e} [{e:?}]")))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(command = raw, panic = message, "command handler panicked");
            Some(error_reply(format!("command '{raw}': {message} [handler panicked]")))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Send one reply. Failures are logged and dropped.
fn deliver(endpoint: &RouterEndpoint, identity: &Identity, raw: &str, reply: &str) {
    match endpoint.send(identity, reply) {
        Ok(()) => debug!(%identity, command = raw, "reply sent"),
        Err(e) if e.is_disconnect() => {
            debug!(%identity, command = raw, error = %e, "caller left before its reply was ready");
        }
        Err(e) => error!(%identity, command = raw, reply, error = %e, "could not send reply"),
    }
}
