// ABOUTME: FIFO admission queue between caller threads and the write pump
// ABOUTME: Unbounded by default; backpressure is the stream-id pool's job, the queue absorbs bursts

use crate::connection::RequestDescriptor;
use crate::error::TransportError;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

struct QueueState {
    items: VecDeque<RequestDescriptor>,
    closed: bool,
}

/// FIFO of accepted-but-not-yet-written requests.
///
/// Admission is never throttled here unless a bound is configured: true
/// in-flight work is capped at 128 by the stream-id pool, the queue only
/// absorbs bursts. There is exactly one consumer, the write pump.
pub(crate) struct RequestQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    limit: Option<usize>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::with_limit(None)
    }

    /// Bounded variant: enqueue rejects with `Overloaded` once `limit`
    /// requests are waiting.
    pub fn bounded(limit: usize) -> Self {
        Self::with_limit(Some(limit))
    }

    fn with_limit(limit: Option<usize>) -> Self {
        RequestQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Notify::new(),
            limit,
        }
    }

    /// Accept a request. Only ever takes the queue mutex; never waits for
    /// an id or the socket.
    pub fn enqueue(
        &self,
        desc: RequestDescriptor,
    ) -> Result<(), (RequestDescriptor, TransportError)> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err((desc, TransportError::Cancelled));
        }
        if let Some(limit) = self.limit {
            if state.items.len() >= limit {
                return Err((desc, TransportError::Overloaded));
            }
        }
        state.items.push_back(desc);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Single-consumer dequeue: parks while empty, `Cancelled` once closed.
    pub async fn dequeue(&self) -> Result<RequestDescriptor, TransportError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(desc) = state.items.pop_front() {
                    return Ok(desc);
                }
                if state.closed {
                    return Err(TransportError::Cancelled);
                }
            }
            // notify_one stores a permit when nobody is parked yet, so a
            // wakeup between the check above and this await is not lost.
            self.ready.notified().await;
        }
    }

    /// Close and surrender everything still queued, so the closing path can
    /// cancel those sinks.
    pub fn close(&self) -> Vec<RequestDescriptor> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        let drained = state.items.drain(..).collect();
        drop(state);
        self.ready.notify_one();
        drained
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }
}
