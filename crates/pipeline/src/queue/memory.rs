//! In-process queue backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{Queue, validate_queue_name};
use crate::error::QueueError;

const BACKEND: &str = "memory";

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Bytes>,
    in_flight: Option<Bytes>,
    /// The in-flight payload was handed out and not released since.
    delivered: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Operations left to fail with a connection error.
    failures: u32,
    reconnects: u32,
}

/// Shared in-process queues.
///
/// Wrap in an `Arc` to share one broker between the pipelines of several
/// bots (or test threads). Blocking pops wait on a condition variable.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    changed: Condvar,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.lock().failures = count;
    }

    /// Number of [`Queue::reconnect`] calls so far.
    pub fn reconnects(&self) -> u32 {
        self.lock().reconnects
    }

    /// Forgets which in-flight payloads were handed out, as after a crash
    /// of every consumer. The next pop on each queue redelivers.
    pub fn simulate_restart(&self) {
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            queue.delivered = false;
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Pending payloads of `queue`, oldest first.
    pub fn snapshot(&self, queue: &str) -> Vec<Bytes> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Locks the state and consumes one injected failure, if any.
    fn begin(&self, queue: &str) -> Result<MutexGuard<'_, BrokerState>, QueueError> {
        validate_queue_name(queue)?;
        let mut state = self.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(QueueError::Connection {
                backend: BACKEND.to_owned(),
                reason: "injected failure".to_owned(),
            });
        }
        Ok(state)
    }

    /// Hands out the next payload, or `None` if the caller has to wait.
    fn try_take(state: &mut BrokerState, queue: &str) -> Option<Bytes> {
        let q = state.queues.entry(queue.to_owned()).or_default();
        match &q.in_flight {
            Some(payload) if !q.delivered => {
                q.delivered = true;
                Some(payload.clone())
            }
            Some(_) => None,
            None => {
                let payload = q.pending.pop_front()?;
                q.in_flight = Some(payload.clone());
                q.delivered = true;
                Some(payload)
            }
        }
    }
}

impl Queue for MemoryBroker {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn push(&self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let mut state = self.begin(queue)?;
        state
            .queues
            .entry(queue.to_owned())
            .or_default()
            .pending
            .push_back(Bytes::copy_from_slice(payload));
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn pop_blocking(&self, queue: &str) -> Result<Bytes, QueueError> {
        let mut state = self.begin(queue)?;
        loop {
            if let Some(payload) = Self::try_take(&mut state, queue) {
                return Ok(payload);
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn pop_timeout(&self, queue: &str, timeout: Duration) -> Result<Option<Bytes>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.begin(queue)?;
        loop {
            if let Some(payload) = Self::try_take(&mut state, queue) {
                return Ok(Some(payload));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    fn acknowledge(&self, queue: &str) -> Result<(), QueueError> {
        let mut state = self.begin(queue)?;
        let q = state.queues.entry(queue.to_owned()).or_default();
        if q.in_flight.take().is_none() {
            return Err(QueueError::NothingInFlight(queue.to_owned()));
        }
        q.delivered = false;
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn release(&self, queue: &str) -> Result<(), QueueError> {
        let mut state = self.begin(queue)?;
        if let Some(q) = state.queues.get_mut(queue) {
            q.delivered = false;
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn in_flight(&self, queue: &str) -> Result<Option<Bytes>, QueueError> {
        let state = self.begin(queue)?;
        Ok(state.queues.get(queue).and_then(|q| q.in_flight.clone()))
    }

    fn length(&self, queue: &str) -> Result<usize, QueueError> {
        let state = self.begin(queue)?;
        Ok(state.queues.get(queue).map_or(0, |q| q.pending.len()))
    }

    fn clear(&self, queue: &str) -> Result<(), QueueError> {
        let mut state = self.begin(queue)?;
        state.queues.remove(queue);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn reconnect(&self) -> Result<(), QueueError> {
        self.lock().reconnects += 1;
        Ok(())
    }
}
