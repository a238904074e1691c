//! FIFO concurrency limiter for compression jobs
//!
//! Jobs are registered synchronously with [`Limiter::add`], which fixes their
//! position in the queue at call time. Awaiting the returned [`Slot`] yields a
//! [`Permit`] once fewer than `concurrency` jobs hold one; dropping the permit
//! hands the slot to the next job in line.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug)]
struct State {
    concurrency: usize,
    pending: usize,
    jobs: VecDeque<oneshot::Sender<()>>,
    closed: bool,
}

impl State {
    fn run(&mut self) {
        while self.pending < self.concurrency {
            let Some(job) = self.jobs.pop_front() else {
                break;
            };
            // a job whose slot was dropped before its turn is skipped
            if job.send(()).is_ok() {
                self.pending += 1;
            }
        }
    }
}

/// Bounds the number of jobs running at once
#[derive(Debug, Clone)]
pub struct Limiter {
    state: Arc<Mutex<State>>,
}

/// The limiter was closed before the job's turn came
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterClosed;

impl Limiter {
    /// Create a limiter; a concurrency of 0 means unbounded
    pub fn new(concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            usize::MAX
        } else {
            concurrency
        };
        Self {
            state: Arc::new(Mutex::new(State {
                concurrency,
                pending: 0,
                jobs: VecDeque::new(),
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }

    /// Queue a job. Its place in line is fixed now, not when the slot is
    /// first polled.
    pub fn add(&self) -> Slot {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if !state.closed {
            state.jobs.push_back(tx);
            state.run();
        }
        Slot {
            rx: Some(rx),
            state: Arc::clone(&self.state),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.lock().concurrency
    }

    /// Jobs currently holding a permit
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Jobs waiting for a permit
    pub fn queued(&self) -> usize {
        self.lock().jobs.len()
    }

    /// Reject every waiting job and all future ones
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.jobs.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn release(state: &Mutex<State>) {
    let mut state = state.lock();
    state.pending -= 1;
    state.run();
}

/// A queued job waiting for its turn
#[derive(Debug)]
pub struct Slot {
    rx: Option<oneshot::Receiver<()>>,
    state: Arc<Mutex<State>>,
}

impl Future for Slot {
    type Output = Result<Permit, LimiterClosed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(Err(LimiterClosed));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                self.rx = None;
                Poll::Ready(match result {
                    Ok(()) => Ok(Permit {
                        state: Arc::clone(&self.state),
                    }),
                    Err(_) => Err(LimiterClosed),
                })
            }
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            // granted but never collected
            if rx.try_recv().is_ok() {
                release(&self.state);
            }
        }
    }
}

/// Held while a job runs
#[derive(Debug)]
pub struct Permit {
    state: Arc<Mutex<State>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        release(&self.state);
    }
}
