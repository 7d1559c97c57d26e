//! Lifecycle event feed.
//!
//! Shows publish on `show.<name>.<kind>`. A subscriber connects, sends its
//! prefix filter as the first frame, then receives every matching event as two
//! frames: topic, then a JSON payload. Delivery is best-effort. Events
//! published before a subscriber is registered are not replayed, and a
//! subscriber that cannot keep up is dropped.

use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::FrameError;
use crate::protocol::{read_frame, write_frame};

/// Namespace every show event is published under.
pub const SHOW_NAMESPACE: &str = "show";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Topic for a show event.
pub fn show_topic(show: &str, kind: &str) -> String {
    format!("{SHOW_NAMESPACE}.{show}.{kind}")
}

/// Anything lifecycle events can be published to.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, payload: &str);
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _topic: &str, _payload: &str) {}
}

/// The part of a topic the detector cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A process of the show died and was reaped.
    Reap,
    /// An option of the show changed.
    Updated,
    Other(String),
}

impl From<&str> for EventKind {
    fn from(kind: &str) -> Self {
        match kind {
            "reap" => EventKind::Reap,
            "updated" => EventKind::Updated,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// A parsed `show.<name>.<kind>` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub show: String,
    pub kind: EventKind,
}

impl Topic {
    /// `None` for topics outside the show namespace or missing a part.
    pub fn parse(topic: &str) -> Option<Topic> {
        let rest = topic.strip_prefix(SHOW_NAMESPACE)?.strip_prefix('.')?;
        let (show, kind) = rest.rsplit_once('.')?;
        if show.is_empty() || kind.is_empty() {
            return None;
        }
        Some(Topic {
            show: show.to_string(),
            kind: EventKind::from(kind),
        })
    }
}

/// One event as received by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
}

struct Subscription {
    prefix: String,
    stream: TcpStream,
    peer: SocketAddr,
}

#[derive(Default)]
struct Subscriptions(Mutex<Vec<Subscription>>);

impl Subscriptions {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bound fan-out endpoint.
pub struct Publisher {
    local_addr: SocketAddr,
    subscriptions: Arc<Subscriptions>,
    closed: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let subscriptions = Arc::new(Subscriptions::default());
        let closed = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let subscriptions = Arc::clone(&subscriptions);
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("ringmaster-pubsub".to_string())
                .spawn(move || accept_loop(listener, subscriptions, closed))?
        };

        debug!(endpoint = %local_addr, "event publisher bound");
        Ok(Self {
            local_addr,
            subscriptions,
            closed,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Stop accepting and disconnect every subscriber. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for subscription in self.subscriptions.lock().drain(..) {
            let _ = subscription.stream.shutdown(Shutdown::Both);
        }
        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(acceptor) = acceptor {
            let _ = acceptor.join();
        }
    }
}

impl EventSink for Publisher {
    fn publish(&self, topic: &str, payload: &str) {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain_mut(|sub| {
            if !topic.starts_with(&sub.prefix) {
                return true;
            }
            let sent = write_frame(&mut sub.stream, topic)
                .and_then(|()| write_frame(&mut sub.stream, payload));
            match sent {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer = %sub.peer, topic, error = %e, "dropping subscriber");
                    let _ = sub.stream.shutdown(Shutdown::Both);
                    false
                }
            }
        });
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: TcpListener, subscriptions: Arc<Subscriptions>, closed: Arc<AtomicBool>) {
    while !closed.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => match handshake(stream, peer) {
                Ok(subscription) => {
                    debug!(%peer, prefix = %subscription.prefix, "subscriber registered");
                    subscriptions.lock().push(subscription);
                }
                Err(e) => warn!(%peer, error = %e, "subscriber handshake failed"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_BACKOFF),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "event publisher stopped accepting");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
}

fn handshake(mut stream: TcpStream, peer: SocketAddr) -> Result<Subscription, FrameError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let prefix = read_frame(&mut stream)?.ok_or_else(|| {
        FrameError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "subscriber left before sending its filter",
        ))
    })?;
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(Some(SEND_TIMEOUT))?;
    stream.set_nodelay(true)?;
    Ok(Subscription {
        prefix,
        stream,
        peer,
    })
}

/// Receiving end of the feed.
pub struct Subscriber {
    reader: BufReader<TcpStream>,
}

impl Subscriber {
    /// Connect and subscribe to every topic starting with `prefix`.
    pub fn connect(addr: impl ToSocketAddrs, prefix: &str) -> Result<Self, FrameError> {
        let mut stream = TcpStream::connect(addr)?;
        write_frame(&mut stream, prefix)?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    /// Block until the next event. `Ok(None)` once the publisher is gone or
    /// [`FeedCloser::close`] was called.
    pub fn recv(&mut self) -> Result<Option<Publication>, FrameError> {
        let Some(topic) = read_frame(&mut self.reader)? else {
            return Ok(None);
        };
        let payload = read_frame(&mut self.reader)?.ok_or_else(|| {
            FrameError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "event payload missing",
            ))
        })?;
        Ok(Some(Publication { topic, payload }))
    }

    /// Handle that unblocks [`Subscriber::recv`] from another thread.
    pub fn closer(&self) -> io::Result<FeedCloser> {
        Ok(FeedCloser(self.reader.get_ref().try_clone()?))
    }
}

pub struct FeedCloser(TcpStream);

impl FeedCloser {
    pub fn close(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}
