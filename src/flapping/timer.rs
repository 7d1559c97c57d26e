//! One-shot, cancellable deferred action.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Runs an action once after a delay unless cancelled first.
///
/// The action runs on the timer's own thread, so it should do nothing more
/// than post a message back to whoever owns the state.
#[derive(Debug)]
pub struct RetryTimer {
    generation: u64,
    delay: Duration,
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RetryTimer {
    pub fn arm<F>(delay: Duration, generation: u64, on_fire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name(format!("ringmaster-retry-{generation}"))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(delay) {
                    on_fire();
                }
            })?;

        Ok(Self {
            generation,
            delay,
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancel and wait for the timer thread. A timer that already fired is
    /// simply reaped.
    pub fn cancel(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn fires_once_after_the_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();

        let timer = {
            let fired = Arc::clone(&fired);
            RetryTimer::arm(Duration::from_millis(30), 7, move || {
                fired.fetch_add(1, Ordering::SeqCst);
                tx.send(Instant::now()).unwrap();
            })
            .unwrap()
        };
        assert_eq!(timer.generation(), 7);
        assert_eq!(timer.delay(), Duration::from_millis(30));

        let at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(at.duration_since(started) >= Duration::from_millis(30));
        timer.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = {
            let fired = Arc::clone(&fired);
            RetryTimer::arm(Duration::from_secs(30), 1, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        let started = Instant::now();
        timer.cancel();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            let _timer = RetryTimer::arm(Duration::from_millis(50), 2, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
