//! Lifecycle of the background threads.
//!
//! A [`Closer`] owns the sending half of a channel nobody ever sends on.
//! Dropping it disconnects the channel, which every task observes through
//! its [`TaskHandle`]. Each handle also owns a `WaitGroup` clone; the handle
//! is dropped when its thread exits, so `close` returns once every task is
//! gone, whatever path it took out.

use std::io;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use crossbeam::sync::WaitGroup;

pub(crate) struct Closer {
    signal: Option<Sender<()>>,
    closed: Receiver<()>,
    wait_group: Option<WaitGroup>,
    threads: Vec<thread::JoinHandle<()>>,
}

/// A task's view of the closer.
pub(crate) struct TaskHandle {
    closed: Receiver<()>,
    _done: WaitGroup,
}

impl Closer {
    pub fn new() -> Self {
        let (signal, closed) = channel::bounded(0);
        Self {
            signal: Some(signal),
            closed,
            wait_group: Some(WaitGroup::new()),
            threads: Vec::new(),
        }
    }

    /// Starts `task` on a named thread.
    pub fn spawn<F>(&mut self, name: &str, task: F) -> io::Result<()>
    where
        F: FnOnce(TaskHandle) + Send + 'static,
    {
        let wait_group = match &self.wait_group {
            Some(wg) => wg.clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "closer already closed",
                ))
            }
        };
        let handle = TaskHandle {
            closed: self.closed.clone(),
            _done: wait_group,
        };
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || task(handle))?;
        self.threads.push(join);
        Ok(())
    }

    /// Signals every task and blocks until all of them have exited.
    /// Calling it again does nothing.
    pub fn close(&mut self) {
        self.signal.take();
        if let Some(wg) = self.wait_group.take() {
            wg.wait();
        }
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                tracing::warn!("background task panicked");
            }
        }
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        self.close();
    }
}

impl TaskHandle {
    /// Disconnects when the closer is closed.
    pub fn closed(&self) -> &Receiver<()> {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps up to `timeout`. Returns true if the closer was closed.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.closed.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}
