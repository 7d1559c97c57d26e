//! Multiplexed request/reply endpoint.
//!
//! One bound TCP listener serves any number of callers. Every accepted
//! connection gets a random [`Identity`] and a reader thread that forwards its
//! frames into a single inbox, so the controller sees one ordered stream of
//! `(identity, payload)` pairs. Replies go back through [`RouterEndpoint::send`],
//! where the identity selects the connection and the payload becomes the frame.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{PollError, TransportError};
use crate::protocol::{Identity, read_frame, write_frame};

/// How long the acceptor sleeps when no connection is pending.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

/// Longest a reply write may block on a caller that stopped reading.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// A request as it arrived, tagged with its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub identity: Identity,
    pub payload: String,
}

enum EndpointEvent {
    Message(Inbound),
    Fault(io::Error),
}

#[derive(Default)]
struct PeerTable(Mutex<HashMap<Identity, TcpStream>>);

impl PeerTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Identity, TcpStream>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bound endpoint multiplexing many callers.
pub struct RouterEndpoint {
    local_addr: SocketAddr,
    inbox: Receiver<EndpointEvent>,
    peers: Arc<PeerTable>,
    closed: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
    #[cfg(test)]
    faults: Sender<EndpointEvent>,
}

impl RouterEndpoint {
    /// Bind the endpoint and start accepting callers.
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (tx, inbox) = mpsc::channel();
        let peers = Arc::new(PeerTable::default());
        let closed = Arc::new(AtomicBool::new(false));

        #[cfg(test)]
        let faults = tx.clone();
        let acceptor = {
            let peers = Arc::clone(&peers);
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("ringmaster-accept".to_string())
                .spawn(move || accept_loop(listener, tx, peers, closed))?
        };

        debug!(endpoint = %local_addr, "controller endpoint bound");
        Ok(Self {
            local_addr,
            inbox,
            peers,
            closed,
            acceptor: Some(acceptor),
            #[cfg(test)]
            faults,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently connected callers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Wait up to `timeout` for the next request.
    ///
    /// `Ok(None)` means the timeout elapsed with no traffic.
    pub fn poll(&self, timeout: Duration) -> Result<Option<Inbound>, PollError> {
        match self.inbox.recv_timeout(timeout) {
            Ok(EndpointEvent::Message(inbound)) => Ok(Some(inbound)),
            Ok(EndpointEvent::Fault(e)) => Err(PollError::Listener(e)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PollError::Closed),
        }
    }

    /// Queue a listener fault as if the acceptor had hit it.
    #[cfg(test)]
    pub(crate) fn inject_fault(&self, error: io::Error) {
        let _ = self.faults.send(EndpointEvent::Fault(error));
    }

    /// Send `payload` to the caller identified by `identity`.
    ///
    /// A caller that stops reading gets dropped once a write has been
    /// blocked for [`SEND_TIMEOUT`].
    pub fn send(&self, identity: &Identity, payload: &str) -> Result<(), TransportError> {
        let mut peers = self.peers.lock();
        let Some(stream) = peers.get_mut(identity) else {
            return Err(TransportError::UnknownPeer(identity.clone()));
        };

        if let Err(source) = write_frame(stream, payload) {
            if let Some(stream) = peers.remove(identity) {
                let _ = stream.shutdown(Shutdown::Both);
            }
            return Err(TransportError::Send {
                identity: identity.clone(),
                source,
            });
        }
        Ok(())
    }

    /// Stop accepting and disconnect every caller.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        for (_, stream) in self.peers.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

impl Drop for RouterEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(
    listener: TcpListener,
    tx: Sender<EndpointEvent>,
    peers: Arc<PeerTable>,
    closed: Arc<AtomicBool>,
) {
    while !closed.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = register_peer(stream, addr, &tx, &peers) {
                    warn!(peer = %addr, error = %e, "failed to register caller");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_BACKOFF),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!(error = %e, "caller went away during accept");
            }
            Err(e) => {
                let fatal = e.kind() != io::ErrorKind::Interrupted;
                if tx.send(EndpointEvent::Fault(e)).is_err() || fatal {
                    return;
                }
            }
        }
    }
}

fn register_peer(
    stream: TcpStream,
    addr: SocketAddr,
    tx: &Sender<EndpointEvent>,
    peers: &Arc<PeerTable>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(SEND_TIMEOUT))?;
    let reader = stream.try_clone()?;
    let identity = Identity::random();

    peers.lock().insert(identity.clone(), stream);
    debug!(%identity, peer = %addr, "caller connected");

    let spawned = {
        let identity = identity.clone();
        let tx = tx.clone();
        let peers = Arc::clone(peers);
        thread::Builder::new()
            .name(format!("ringmaster-peer-{addr}"))
            .spawn(move || read_loop(identity, reader, tx, peers))
    };

    if let Err(e) = spawned {
        peers.lock().remove(&identity);
        return Err(e);
    }
    Ok(())
}

fn read_loop(
    identity: Identity,
    stream: TcpStream,
    tx: Sender<EndpointEvent>,
    peers: Arc<PeerTable>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(payload)) => {
                let inbound = Inbound {
                    identity: identity.clone(),
                    payload,
                };
                if tx.send(EndpointEvent::Message(inbound)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%identity, error = %e, "dropping caller after unreadable frame");
                break;
            }
        }
    }

    if let Some(stream) = peers.lock().remove(&identity) {
        let _ = stream.shutdown(Shutdown::Both);
    }
    debug!(%identity, "caller disconnected");
}
