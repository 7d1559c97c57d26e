//! Client side of the control protocol.
//!
//! [`ControlClient::call`] is a synchronous round trip over one long-lived
//! connection. The connection is not demultiplexed, so a mutex keeps at most
//! one call in flight no matter how many threads share the client.
//! [`ControlClient::send_one_way`] opens its own short-lived connection, so an
//! unread reply can never be mistaken for the answer to a later call.

use std::net::{Shutdown, TcpStream};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::ClientError;
use crate::protocol::{read_frame, write_frame};

/// The two ways of talking to the controller.
pub trait Commander: Send + Sync {
    /// Send one command and block until its reply arrives.
    fn call(&self, command: &str) -> Result<String, ClientError>;

    /// Send one command without waiting for, or reading, a reply.
    fn send_one_way(&self, command: &str) -> Result<(), ClientError>;
}

/// Connection to a controller endpoint.
pub struct ControlClient {
    endpoint: String,
    timeout: Option<Duration>,
    conn: Mutex<Option<TcpStream>>,
}

impl ControlClient {
    /// Client for `endpoint` (`host:port`). Connects lazily on the first call.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: None,
            conn: Mutex::new(None),
        }
    }

    /// Bound every read and write. A timed-out call drops the connection.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&self) -> Result<TcpStream, ClientError> {
        let connect_err = |source| ClientError::Connect {
            endpoint: self.endpoint.clone(),
            source,
        };
        let stream = TcpStream::connect(&self.endpoint).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        stream.set_read_timeout(self.timeout).map_err(connect_err)?;
        stream.set_write_timeout(self.timeout).map_err(connect_err)?;
        Ok(stream)
    }

    fn round_trip(stream: &mut TcpStream, command: &str) -> Result<String, ClientError> {
        write_frame(stream, command)?;
        read_frame(stream)?.ok_or(ClientError::Closed)
    }
}

impl Commander for ControlClient {
    fn call(&self, command: &str) -> Result<String, ClientError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if conn.is_none() {
            *conn = Some(self.connect()?);
        }
        let outcome = match conn.as_mut() {
            Some(stream) => Self::round_trip(stream, command),
            None => Err(ClientError::Closed),
        };

        match outcome {
            Ok(reply) => {
                trace!(command, reply = %reply, "call answered");
                Ok(reply)
            }
            Err(e) => {
                // A half-finished exchange leaves the stream out of step.
                if let Some(stream) = conn.take() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                debug!(command, error = %e, "call failed; connection dropped");
                Err(e)
            }
        }
    }

    fn send_one_way(&self, command: &str) -> Result<(), ClientError> {
        let mut stream = self.connect()?;
        write_frame(&mut stream, command)?;
        let _ = stream.shutdown(Shutdown::Write);
        trace!(command, "one-way command sent");
        Ok(())
    }
}
