// ABOUTME: Stream-id pool and pending-request table backing the multiplexer
// ABOUTME: Ids are conserved: each one is either free in the pool or its table slot is occupied

use crate::error::TransportError;
use crate::instrument::RequestToken;
use crate::sink::ResponseHandler;
use std::sync::Mutex;
use tokio::sync::Semaphore;

/// Number of usable stream ids: the non-negative half of the signed byte.
/// Negative ids are reserved for server-initiated events.
pub const STREAM_IDS: usize = 128;

/// One request pinned between its socket write and response delivery.
pub(crate) struct InFlight {
    pub handler: Box<dyn ResponseHandler>,
    pub token: RequestToken,
}

/// Bounded pool of the 128 stream ids.
///
/// `acquire` parks until an id frees up; `close` permanently unparks every
/// waiter with a cancellation. Hand-out order is LIFO; callers must not
/// rely on any ordering, ids are interchangeable.
pub(crate) struct StreamIdPool {
    permits: Semaphore,
    free: Mutex<Vec<i8>>,
}

impl StreamIdPool {
    pub fn new() -> Self {
        StreamIdPool {
            permits: Semaphore::new(STREAM_IDS),
            free: Mutex::new((0..STREAM_IDS).rev().map(|id| id as i8).collect()),
        }
    }

    /// Take an id, waiting when all 128 are out.
    pub async fn acquire(&self) -> Result<i8, TransportError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransportError::Cancelled)?;
        permit.forget();
        let id = self
            .free
            .lock()
            .unwrap()
            .pop()
            .expect("a held permit guarantees a free id");
        Ok(id)
    }

    /// Return an id and wake one waiter. Never blocks.
    pub fn release(&self, id: i8) {
        let mut free = self.free.lock().unwrap();
        debug_assert!(id >= 0, "stream id {id} is reserved for server events");
        debug_assert!(!free.contains(&id), "stream id {id} released twice");
        free.push(id);
        drop(free);
        self.permits.add_permits(1);
    }

    /// Permanently resolve every current and future `acquire` to
    /// `Cancelled`.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Free-id count; the conservation invariant is checked against this.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

struct TableState {
    slots: Vec<Option<InFlight>>,
    closed: bool,
}

/// Fixed 128-slot map from stream id to its in-flight request.
///
/// Slots are written by the write pump and cleared by the read pump or the
/// closing path; the handoff between the pumps is published by the socket
/// itself (a response can only arrive after its request was written).
pub(crate) struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            state: Mutex::new(TableState {
                slots: (0..STREAM_IDS).map(|_| None).collect(),
                closed: false,
            }),
        }
    }

    /// Pin an in-flight request under its id. Must precede the socket write
    /// so the response can never beat the entry. Once the table has been
    /// drained the entry is handed back so the caller can cancel its sink
    /// instead of leaking it.
    pub fn put(&self, id: i8, entry: InFlight) -> Result<(), InFlight> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(entry);
        }
        let slot = &mut state.slots[id as usize];
        debug_assert!(slot.is_none(), "stream id {id} already pinned");
        *slot = Some(entry);
        Ok(())
    }

    /// Clear and return the entry awaiting this response.
    pub fn take(&self, id: i8) -> Option<InFlight> {
        self.state.lock().unwrap().slots[id as usize].take()
    }

    /// Closing path: empty every slot exactly once and refuse future puts.
    pub fn drain(&self) -> Vec<InFlight> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.slots.iter_mut().filter_map(Option::take).collect()
    }

    pub fn occupied(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }
}
