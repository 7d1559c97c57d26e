//! Error taxonomy for the control plane.
//!
//! - [`MessageError`]: malformed or unroutable operator input. Answered with an
//!   `error:` reply, never fatal.
//! - [`HandlerError`]: a handler failed. [`HandlerError::Os`] is reported with
//!   its message only, [`HandlerError::Failed`] with diagnostic detail.
//! - [`TransportError`]: a reply could not be delivered. Logged and dropped.
//! - [`PollError`]: the endpoint itself failed. Only interrupts are survivable.
//! - [`FrameError`], [`ClientError`]: codec and client-side failures.

use std::io;

use thiserror::Error;

use crate::protocol::Identity;

/// Operator-input errors detected before any handler runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The message was empty after trimming.
    #[error("empty command")]
    Empty,

    /// The verb needs more tokens than were given.
    #[error("invalid number of parameters")]
    InvalidParameters,

    /// A show name did not resolve.
    #[error("program {0} not found")]
    TargetNotFound(String),

    /// The resolved target has no operation for the verb. Carries the raw message.
    #[error("message '{0}'")]
    UnknownOperation(String),
}

impl MessageError {
    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            MessageError::Empty => "protocol_empty",
            MessageError::InvalidParameters => "protocol_parameters",
            MessageError::TargetNotFound(_) => "routing_target",
            MessageError::UnknownOperation(_) => "routing_operation",
        }
    }
}

/// Failure raised by a target's operation.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Resource or OS-level failure (spawn, signal, filesystem).
    #[error(transparent)]
    Os(#[from] io::Error),

    /// Anything else. The controller attaches the `{:?}` rendering as detail.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Frame codec failure.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("frame is not valid UTF-8 text")]
    NotText(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A reply could not be delivered to its caller.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The caller disconnected before its reply was ready.
    #[error("no connected caller with identity {0}")]
    UnknownPeer(Identity),

    #[error("send to {identity} failed: {source}")]
    Send {
        identity: Identity,
        #[source]
        source: FrameError,
    },
}

impl TransportError {
    /// The caller is gone. Expected for one-way senders, so not worth an error log.
    pub fn is_disconnect(&self) -> bool {
        match self {
            TransportError::UnknownPeer(_) => true,
            TransportError::Send {
                source: FrameError::Io(e),
                ..
            } => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            TransportError::Send { .. } => false,
        }
    }
}

/// The endpoint could not be polled.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("endpoint listener failed: {0}")]
    Listener(#[from] io::Error),

    #[error("endpoint closed")]
    Closed,
}

impl PollError {
    /// Transient wake-ups that must not end the poll loop.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, PollError::Listener(e) if e.kind() == io::ErrorKind::Interrupted)
    }
}

/// Client-side failure talking to the controller.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("controller closed the connection")]
    Closed,
}

/// An `options` reply that could not be turned into flapping thresholds.
///
/// Parsing is all-or-nothing, so any of these discards the whole reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigParseError {
    #[error("controller answered with an error: {0}")]
    ErrorReply(String),

    #[error("line {0:?} is not a `key: value` pair")]
    MissingSeparator(String),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}
