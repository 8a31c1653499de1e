//! Correlates outbound stanza ids with in-flight awaiters and bounds
//! concurrency via a counting semaphore (C2).
//!
//! Adapted from `ClientSessions`'s hash-table-plus-bound-config shape
//! (`kimberlite-vsr/src/client_sessions.rs`), but `ClientSessions` tracks
//! committed/uncommitted session state for idempotent retry; this table
//! tracks condvar-backed completion signals for blocking callers instead.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{ClientError, ClientResult};
use crate::model::Response;

/// How a request was registered: matched by exact id, by the first
/// element satisfying a predicate (unused by the decoder catalogue today
/// but part of the public contract in spec §3), or on a recurring timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    ById,
    ByMatch,
    Timed,
}

#[derive(Debug)]
struct Completion {
    lock: Mutex<bool>,
    cond: Condvar,
    result: Mutex<Option<Response>>,
}

impl Completion {
    fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cond: Condvar::new(),
            result: Mutex::new(None),
        }
    }

    fn signal(&self, response: Response) {
        *self.result.lock().unwrap() = Some(response);
        let mut done = self.lock.lock().unwrap();
        *done = true;
        self.cond.notify_all();
    }

    /// Waits for completion, re-checking the predicate on every wake so a
    /// signal delivered before the wait began is never lost.
    fn wait(&self, timeout: Duration) -> Option<Response> {
        let mut done = self.lock.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while !*done {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = self.cond.wait_timeout(done, remaining).unwrap();
            done = guard;
            if result.timed_out() && !*done {
                return None;
            }
        }
        self.result.lock().unwrap().take()
    }
}

/// An in-flight correlated request (spec §3, "Request").
#[derive(Debug)]
pub struct RequestEntry {
    pub id: String,
    pub kind: RequestKind,
    completion: Completion,
}

/// A bounded, counting semaphore with a blocking `acquire` and a
/// non-blocking `try_acquire`. `std::sync::Semaphore` does not exist in
/// stable `std`, so this is built directly on `Mutex`+`Condvar`, matching
/// the rest of the table's primitives rather than pulling in a crate the
/// teacher never reaches for.
struct Semaphore {
    state: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.state.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    fn try_acquire(&self) -> bool {
        let mut permits = self.state.lock().unwrap();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    fn release(&self) {
        let mut permits = self.state.lock().unwrap();
        *permits += 1;
        self.cond.notify_one();
    }

    fn available(&self) -> usize {
        *self.state.lock().unwrap()
    }
}

/// Correlates outbound stanza ids with awaiters; bounds open requests to
/// `max_open` (I2: `available_permits == max_open - |table|`, always >= 0).
pub struct RequestTable {
    entries: RwLock<HashMap<String, Arc<RequestEntry>>>,
    semaphore: Semaphore,
    max_open: usize,
}

impl RequestTable {
    pub fn new(max_open: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            semaphore: Semaphore::new(max_open),
            max_open,
        }
    }

    /// Reserves a permit (blocking until one is free, per the boundary
    /// behaviour in spec §8: "blocks its initiator until a permit is
    /// released; never drops the request silently") and inserts a fresh
    /// entry. If `id` already exists the insertion is a no-op and the
    /// existing request is preserved, per spec §4.2.
    pub fn add(&self, id: impl Into<String>, kind: RequestKind) -> Arc<RequestEntry> {
        let id = id.into();
        {
            let entries = self.entries.read().unwrap();
            if let Some(existing) = entries.get(&id) {
                return existing.clone();
            }
        }
        self.semaphore.acquire();
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(&id) {
            self.semaphore.release();
            return existing.clone();
        }
        let entry = Arc::new(RequestEntry {
            id: id.clone(),
            kind,
            completion: Completion::new(),
        });
        entries.insert(id, entry.clone());
        entry
    }

    /// Non-blocking counterpart used where a caller would rather fail
    /// fast than suspend (e.g. probing from inside the event loop, which
    /// must never block per spec §4.4's "handlers must not block").
    pub fn try_add(&self, id: impl Into<String>, kind: RequestKind) -> ClientResult<Arc<RequestEntry>> {
        let id = id.into();
        let mut entries = self.entries.write().unwrap();
        if let Some(existing) = entries.get(&id) {
            return Ok(existing.clone());
        }
        if !self.semaphore.try_acquire() {
            return Err(ClientError::TooManyOpenRequests(self.max_open));
        }
        let entry = Arc::new(RequestEntry {
            id: id.clone(),
            kind,
            completion: Completion::new(),
        });
        entries.insert(id, entry.clone());
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<RequestEntry>> {
        self.entries.read().unwrap().get(id).cloned()
    }

    /// Removes the entry and releases its semaphore permit. A no-op
    /// (`Ok(())`, matching spec's "writer-lock remove") if already gone —
    /// removal after a timeout races naturally with a late `signal`.
    pub fn remove(&self, id: &str) {
        let removed = self.entries.write().unwrap().remove(id);
        if removed.is_some() {
            self.semaphore.release();
        }
    }

    /// Delivers a response to the waiter and wakes it. Lost-wakeup safe:
    /// the waiter re-checks its predicate on every wake (spec §4.2).
    pub fn signal(&self, id: &str, response: Response) {
        if let Some(entry) = self.get(id) {
            entry.completion.signal(response);
        }
    }

    /// Blocks the caller up to `timeout`, returning the delivered
    /// response or `None` on timeout.
    pub fn wait(&self, entry: &RequestEntry, timeout: Duration) -> Option<Response> {
        entry.completion.wait(timeout)
    }

    /// I2's invariant restated as a query: `max_open - live_entries`.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PacketVariant;
    use std::sync::Barrier;
    use std::thread;

    fn ok_response(id: &str) -> Response {
        Response {
            id: id.to_string(),
            namespace: None,
            element_name: None,
            type_attr: None,
            payload: PacketVariant::Ok,
            stanza: None,
        }
    }

    #[test]
    fn add_remove_preserves_semaphore_invariant() {
        let table = RequestTable::new(3);
        assert_eq!(table.available_permits(), 3);

        let a = table.add("a", RequestKind::ById);
        let b = table.add("b", RequestKind::ById);
        assert_eq!(table.available_permits(), 1);
        assert_eq!(table.len(), 2);

        table.remove(&a.id);
        assert_eq!(table.available_permits(), 2);
        table.remove(&b.id);
        assert_eq!(table.available_permits(), 3);
    }

    #[test]
    fn duplicate_id_preserves_existing_entry() {
        let table = RequestTable::new(3);
        let first = table.add("dup", RequestKind::ById);
        let second = table.add("dup", RequestKind::ById);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn try_add_fails_fast_when_exhausted() {
        let table = RequestTable::new(1);
        let _a = table.try_add("a", RequestKind::ById).unwrap();
        let err = table.try_add("b", RequestKind::ById).unwrap_err();
        assert!(matches!(err, ClientError::TooManyOpenRequests(1)));
    }

    #[test]
    fn signal_wakes_waiter_with_response() {
        let table = Arc::new(RequestTable::new(3));
        let entry = table.add("x", RequestKind::ById);

        let table2 = table.clone();
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = barrier.clone();
        let handle = thread::spawn(move || {
            barrier2.wait();
            table2.signal("x", ok_response("x"));
        });

        barrier.wait();
        let response = table.wait(&entry, Duration::from_secs(2));
        handle.join().unwrap();

        assert_eq!(response.unwrap().id, "x");
    }

    #[test]
    fn wait_times_out_when_never_signalled() {
        let table = RequestTable::new(3);
        let entry = table.add("never", RequestKind::ById);
        let response = table.wait(&entry, Duration::from_millis(20));
        assert!(response.is_none());
    }

    #[test]
    fn add_blocks_until_a_permit_is_released() {
        // Boundary behaviour (spec §8): exceeding max_open blocks the
        // initiator rather than dropping the request.
        let table = Arc::new(RequestTable::new(1));
        let _held = table.add("holder", RequestKind::ById);

        let table2 = table.clone();
        let handle = thread::spawn(move || {
            table2.add("waiter", RequestKind::ById);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());

        table.remove("holder");
        handle.join().unwrap();
        assert_eq!(table.len(), 1);
    }
}
