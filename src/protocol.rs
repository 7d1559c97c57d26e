//! Wire plumbing shared by the controller, its clients and the event feed.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 text. Requests and replies are one frame each, so multi-line replies
//! (`options`, `info`) travel intact. Publications are two frames: the topic,
//! then the payload.
//!
//! Replies carry no structured status: a reply starting with `error:` is a
//! failure, anything else is a success.

use std::fmt;
use std::io::{self, Read, Write};

use uuid::Uuid;

use crate::error::FrameError;

/// Prefix that marks a reply as a failure.
pub const ERROR_PREFIX: &str = "error:";

/// Acknowledgement sent by handlers that have nothing else to say.
pub const OK: &str = "ok";

/// Largest frame either side will accept.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Opaque per-caller correlation token.
///
/// The endpoint assigns one to every accepted connection; a reply is routed
/// back by handing the same token to [`RouterEndpoint::send`].
///
/// [`RouterEndpoint::send`]: crate::controller::RouterEndpoint::send
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// A fresh random token (uuid v4, simple form).
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a reply signals a failure.
pub fn is_error(reply: &str) -> bool {
    reply.starts_with(ERROR_PREFIX)
}

/// Render a failure reply: `error: <detail>`.
pub fn error_reply(detail: impl fmt::Display) -> String {
    format!("{ERROR_PREFIX} {detail}")
}

/// Write one text frame and flush.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &str) -> Result<(), FrameError> {
    let len = payload.len();
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    writer.write_all(&(len as u32).to_be_bytes())?;
    writer.write_all(payload.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one text frame.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<String>, FrameError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(String::from_utf8(body)?))
}
