//! Handler registry and dispatch (C1's callback half).
//!
//! `kimberlite-server/src/handler.rs` dispatches one big `match` over a
//! closed set of `RequestPayload` variants; this registry generalizes that
//! idea to an open set of independently registered, pattern-matched
//! callbacks, per spec §4.1. Handlers are invoked from the event loop and
//! must never block — callback-driven sends append to `pending_outbox`
//! instead of writing to the transport inline (spec §9's suggested
//! alternative to a recursive send-path lock).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::model::Stanza;

/// Whether a fired handler should remain registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Keep,
    Remove,
}

type ElementCallback = Box<dyn FnMut(&Stanza) -> HandlerOutcome + Send>;
type IdCallback = Box<dyn FnMut(&Stanza) -> HandlerOutcome + Send>;
type TimedCallback = Box<dyn FnMut() -> HandlerOutcome + Send>;

struct ElementHandler {
    namespace: Option<String>,
    name: Option<String>,
    type_attr: Option<String>,
    callback: ElementCallback,
}

impl ElementHandler {
    fn matches(&self, stanza: &Stanza) -> bool {
        let ns_ok = self
            .namespace
            .as_deref()
            .is_none_or(|ns| stanza.namespace.as_deref() == Some(ns));
        let name_ok = self.name.as_deref().is_none_or(|name| stanza.name == name);
        let type_ok = self
            .type_attr
            .as_deref()
            .is_none_or(|want| stanza.attr("type") == Some(want));
        ns_ok && name_ok && type_ok
    }
}

struct IdHandler {
    id: String,
    callback: IdCallback,
}

struct TimedHandler {
    period: Duration,
    last_fired: Instant,
    callback: TimedCallback,
}

/// Pending work moved across a reconnect without reaching into transport
/// internals, per spec §9's fifth re-architecture note.
#[derive(Default)]
pub struct SessionState {
    pub pending_outbox: Vec<String>,
}

/// Registry of element/id/timed handlers plus the outbox callbacks append
/// to instead of sending inline.
pub struct Session {
    element_handlers: Mutex<Vec<ElementHandler>>,
    id_handlers: Mutex<Vec<IdHandler>>,
    timed_handlers: Mutex<Vec<TimedHandler>>,
    pending_outbox: Mutex<Vec<String>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            element_handlers: Mutex::new(Vec::new()),
            id_handlers: Mutex::new(Vec::new()),
            timed_handlers: Mutex::new(Vec::new()),
            pending_outbox: Mutex::new(Vec::new()),
        }
    }

    /// At least one of `namespace`/`name`/`type_attr` must be specified
    /// per spec §4.1's "at least one discriminator must be non-empty".
    pub fn register_element_handler<F>(
        &self,
        namespace: Option<String>,
        name: Option<String>,
        type_attr: Option<String>,
        callback: F,
    ) where
        F: FnMut(&Stanza) -> HandlerOutcome + Send + 'static,
    {
        debug_assert!(
            namespace.is_some() || name.is_some() || type_attr.is_some(),
            "element handler needs at least one discriminator"
        );
        self.element_handlers.lock().unwrap().push(ElementHandler {
            namespace,
            name,
            type_attr,
            callback: Box::new(callback),
        });
    }

    pub fn register_id_handler<F>(&self, id: impl Into<String>, callback: F)
    where
        F: FnMut(&Stanza) -> HandlerOutcome + Send + 'static,
    {
        self.id_handlers.lock().unwrap().push(IdHandler {
            id: id.into(),
            callback: Box::new(callback),
        });
    }

    pub fn remove_id_handler(&self, id: &str) {
        self.id_handlers.lock().unwrap().retain(|h| h.id != id);
    }

    pub fn register_timed_handler<F>(&self, period_ms: u64, callback: F)
    where
        F: FnMut() -> HandlerOutcome + Send + 'static,
    {
        self.timed_handlers.lock().unwrap().push(TimedHandler {
            period: Duration::from_millis(period_ms),
            last_fired: Instant::now(),
            callback: Box::new(callback),
        });
    }

    /// Dispatches one inbound stanza to every matching element handler and,
    /// separately, to the id handler (if any) whose id equals the
    /// stanza's. `Remove` deletes the handler before any other handler
    /// sees the next element (spec §4.1).
    pub fn dispatch(&self, stanza: &Stanza) {
        {
            let mut handlers = self.element_handlers.lock().unwrap();
            handlers.retain_mut(|h| {
                if h.matches(stanza) {
                    trace!(element = %stanza.name, "element handler fired");
                    (h.callback)(stanza) == HandlerOutcome::Keep
                } else {
                    true
                }
            });
        }
        {
            let mut handlers = self.id_handlers.lock().unwrap();
            handlers.retain_mut(|h| {
                if h.id == stanza.id {
                    trace!(id = %stanza.id, "id handler fired");
                    (h.callback)(stanza) == HandlerOutcome::Keep
                } else {
                    true
                }
            });
        }
    }

    /// Fires every timed handler whose period has elapsed. Called once per
    /// event-loop tick.
    pub fn fire_due_timers(&self) {
        let mut handlers = self.timed_handlers.lock().unwrap();
        handlers.retain_mut(|h| {
            if h.last_fired.elapsed() >= h.period {
                h.last_fired = Instant::now();
                (h.callback)() == HandlerOutcome::Keep
            } else {
                true
            }
        });
    }

    pub fn has_id_handler(&self, id: &str) -> bool {
        self.id_handlers.lock().unwrap().iter().any(|h| h.id == id)
    }

    /// Queues outbound text without touching the transport directly,
    /// so handlers invoked mid-tick never re-enter the send path.
    pub fn queue_outbound(&self, text: String) {
        self.pending_outbox.lock().unwrap().push(text);
    }

    pub fn take_pending_outbox(&self) -> Vec<String> {
        std::mem::take(&mut self.pending_outbox.lock().unwrap())
    }

    /// Moves queued sends and handler registrations into a fresh
    /// [`SessionState`] so a reconnect can restore them onto the new
    /// transport without reaching into its internals (spec §9).
    pub fn take_state(&self) -> SessionState {
        SessionState {
            pending_outbox: self.take_pending_outbox(),
        }
    }

    pub fn restore_state(&self, state: SessionState) {
        self.pending_outbox.lock().unwrap().extend(state.pending_outbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn stanza(name: &str, id: &str) -> Stanza {
        Stanza {
            name: name.to_string(),
            namespace: None,
            id: id.to_string(),
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn element_handler_fires_on_match_and_keeps_by_default() {
        let session = Session::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        session.register_element_handler(None, Some("message".into()), None, move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Keep
        });

        session.dispatch(&stanza("message", "a"));
        session.dispatch(&stanza("message", "b"));
        session.dispatch(&stanza("iq", "c"));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn id_handler_is_removed_after_remove_outcome() {
        let session = Session::new();
        session.register_id_handler("req-1", |_| HandlerOutcome::Remove);
        assert!(session.has_id_handler("req-1"));

        session.dispatch(&stanza("iq", "req-1"));
        assert!(!session.has_id_handler("req-1"));
    }

    #[test]
    fn id_handler_keeps_registration_when_requested() {
        let session = Session::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        session.register_id_handler("notifications", move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Keep
        });

        session.dispatch(&stanza("message", "notifications"));
        session.dispatch(&stanza("message", "notifications"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(session.has_id_handler("notifications"));
    }

    #[test]
    fn queued_outbound_is_drained_exactly_once() {
        let session = Session::new();
        session.queue_outbound("a".into());
        session.queue_outbound("b".into());
        assert_eq!(session.take_pending_outbox(), vec!["a", "b"]);
        assert!(session.take_pending_outbox().is_empty());
    }
}
