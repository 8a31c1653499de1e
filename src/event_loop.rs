//! Connection state machine and dedicated worker thread (C4).
//!
//! Grounded on `kimberlite-server/src/core_runtime.rs`'s `CoreRuntime`
//! lifecycle (`new`/`start`/`worker_loop`/`shutdown`, named thread via
//! `thread::Builder`, `impl Drop` calling `shutdown`), narrowed from N
//! per-core workers routed by a hash to exactly one worker running the
//! state machine from spec §4.4. `CoreRouter`'s routing concept has no
//! counterpart here — there is only ever one connection, so nothing to
//! route between.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, trace, warn};

use crate::config::Config;
use crate::error::{ClientError, ClientResult};
use crate::model::{new_stanza_id, Response, Stanza};
use crate::notify_queue::{NotifyQueue, NOTIFICATIONS_WAITER_ID};
use crate::request_table::{RequestKind, RequestTable};
use crate::session::{HandlerOutcome, Session};
use crate::transport::Transport;

/// `Disconnected → Connecting → Authenticated → Draining → Reconnecting`,
/// exactly the transition table in spec §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Draining,
    Reconnecting,
}

/// Builds a fresh transport for the initial connect and every reconnect
/// attempt. Boxed so the loop is agnostic to `RustlsTransport` vs
/// `LoopbackTransport`.
pub type Connector = Box<dyn Fn() -> ClientResult<Box<dyn Transport>> + Send + Sync>;

struct Shared {
    connector: Connector,
    session: Arc<Session>,
    requests: Arc<RequestTable>,
    notifications: Arc<NotifyQueue>,
    config: Config,

    state: Mutex<ConnectionState>,
    conn_cond: Condvar,

    outbound: Mutex<VecDeque<String>>,
    send_cond: Condvar,

    running: AtomicBool,
    has_connected: AtomicBool,
    was_listening: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
        self.conn_cond.notify_all();
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn wait_for_state_change(&self, timeout: Duration) {
        let guard = self.state.lock().unwrap();
        let _ = self.conn_cond.wait_timeout(guard, timeout).unwrap();
    }

    /// Suspension point (b) from spec §5: park until a `send_nonblocking`
    /// caller pushes outbound work or `send_request_timeout_us` elapses,
    /// whichever comes first.
    fn wait_for_outbound(&self, timeout: Duration) {
        let guard = self.outbound.lock().unwrap();
        let _ = self.send_cond.wait_timeout(guard, timeout).unwrap();
    }
}

/// Drives C1 cooperatively on a dedicated worker thread; owns the
/// connection state machine and the request/notification wiring the rest
/// of the crate's operations ride on top of.
pub struct EventLoop {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new(
        config: Config,
        session: Arc<Session>,
        requests: Arc<RequestTable>,
        notifications: Arc<NotifyQueue>,
        connector: Connector,
    ) -> Self {
        let shared = Arc::new(Shared {
            connector,
            session,
            requests,
            notifications,
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            conn_cond: Condvar::new(),
            outbound: Mutex::new(VecDeque::new()),
            send_cond: Condvar::new(),
            running: AtomicBool::new(false),
            has_connected: AtomicBool::new(false),
            was_listening: AtomicBool::new(false),
        });
        Self {
            shared,
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn mark_listening(&self, listening: bool) {
        self.shared.was_listening.store(listening, Ordering::SeqCst);
    }

    /// Spawns the worker thread and transitions `Disconnected -> Connecting`.
    ///
    /// # Panics
    ///
    /// Panics if called more than once without an intervening `shutdown()`.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        assert!(handle.is_none(), "event loop already started; call shutdown() first");

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);

        let shared = self.shared.clone();
        *handle = Some(
            thread::Builder::new()
                .name("xmpp-event-loop".into())
                .spawn(move || worker_loop(&shared))
                .expect("failed to spawn event loop thread"),
        );
    }

    /// Blocks up to `timeout` for the connection to leave `Connecting`
    /// (either `Authenticated` on success or `Disconnected` on failure).
    pub fn wait_until_settled(&self, timeout: Duration) -> ConnectionState {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let state = self.shared.state();
            if !matches!(state, ConnectionState::Connecting) {
                return state;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return state;
            }
            self.shared.wait_for_state_change(remaining);
        }
    }

    /// Non-blocking send (spec §4.4): serialises under no lock — the
    /// caller already has `text` — then appends to the outbound queue and
    /// nudges the loop.
    pub fn send_nonblocking(&self, text: String) -> ClientResult<()> {
        if matches!(self.shared.state(), ConnectionState::Disconnected) {
            return Err(ClientError::Disconnected);
        }
        {
            let mut outbound = self.shared.outbound.lock().unwrap();
            outbound.push_back(text);
            self.shared.send_cond.notify_all();
        }
        Ok(())
    }

    /// Blocking send (spec §4.4): reserve a request-table permit, install
    /// an id handler that signals the request table, retry
    /// `send_nonblocking` up to `send_retries`, then wait on the request
    /// condvar up to `request_timeout_s`.
    #[instrument(skip_all, fields(stanza = %stanza.name))]
    pub fn send_blocking(&self, mut stanza: Stanza) -> ClientResult<Response> {
        if stanza.id.is_empty() {
            stanza.id = new_stanza_id();
        }
        let id = stanza.id.clone();
        let entry = self.shared.requests.add(id.clone(), RequestKind::ById);

        let requests = self.shared.requests.clone();
        let id_for_handler = id.clone();
        self.shared.session.register_id_handler(id.clone(), move |response_stanza| {
            requests.signal(&id_for_handler, shell_to_response(response_stanza));
            HandlerOutcome::Remove
        });

        let text = render_stanza(&stanza);
        let mut sent = false;
        for attempt in 0..self.shared.config.send_retries.max(1) {
            match self.send_nonblocking(text.clone()) {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(e) if e.is_connection_fault() => {
                    trace!(attempt, "send_nonblocking hit a connection fault, waiting to reconnect");
                    self.shared.wait_for_state_change(Duration::from_secs(self.shared.config.reconnect_backoff_s));
                }
                Err(e) => return Err(e),
            }
        }
        if !sent {
            self.shared.requests.remove(&id);
            self.shared.session.remove_id_handler(&id);
            return Err(ClientError::Connection("unable to reach the event loop".into()));
        }

        let timeout = Duration::from_secs(self.shared.config.request_timeout_s);
        match self.shared.requests.wait(&entry, timeout) {
            Some(response) => {
                self.shared.requests.remove(&id);
                Ok(response)
            }
            None => {
                self.shared.session.remove_id_handler(&id);
                self.shared.requests.remove(&id);
                Err(ClientError::Timeout)
            }
        }
    }

    pub fn requests(&self) -> &Arc<RequestTable> {
        &self.shared.requests
    }

    pub fn notifications(&self) -> &Arc<NotifyQueue> {
        &self.shared.notifications
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    /// Stops the worker thread. Safe to call multiple times.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.send_cond.notify_all();
        self.shared.conn_cond.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn render_stanza(stanza: &Stanza) -> String {
    let mut out = format!("<{}", stanza.name);
    if let Some(ns) = &stanza.namespace {
        out.push_str(&format!(" xmlns=\"{ns}\""));
    }
    out.push_str(&format!(" id=\"{}\"", stanza.id));
    for (key, value) in &stanza.attrs {
        out.push_str(&format!(" {key}=\"{value}\""));
    }
    out.push('>');
    if let Some(text) = &stanza.text {
        out.push_str(text);
    }
    for child in &stanza.children {
        out.push_str(&render_stanza(child));
    }
    out.push_str(&format!("</{}>", stanza.name));
    out
}

/// Extracts just enough of an inbound fragment (name/namespace/id/type)
/// for handler dispatch, without fully decoding its payload — full
/// payload decoding is left to the shape-specific decoders in
/// `decoder.rs`, run against the same bytes once a handler recognises the
/// id.
fn parse_stanza_shell(xml: &str) -> Option<Stanza> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut stanza = Stanza::new(name);
                stanza.id.clear();
                // Stashes the raw fragment so a caller holding this shell
                // can re-run it through `decoder::decode` for the full,
                // shape-specific payload without a second round trip.
                stanza.text = Some(xml.to_string());
                for a in e.attributes().filter_map(Result::ok) {
                    let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
                    let value = a.unescape_value().unwrap_or_default().to_string();
                    match key.as_str() {
                        "xmlns" => stanza.namespace = Some(value),
                        "id" => stanza.id = value,
                        _ => stanza.attrs.push((key, value)),
                    }
                }
                return Some(stanza);
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn shell_to_response(stanza: &Stanza) -> Response {
    Response {
        id: stanza.id.clone(),
        namespace: stanza.namespace.clone(),
        element_name: Some(stanza.name.clone()),
        type_attr: stanza.attr("type").map(str::to_string),
        payload: crate::model::PacketVariant::Unknown,
        stanza: Some(stanza.clone()),
    }
}

fn worker_loop(shared: &Arc<Shared>) {
    let mut transport: Option<Box<dyn Transport>> = None;
    let mut retries: u32 = 0;

    while shared.running.load(Ordering::SeqCst) {
        match shared.state() {
            ConnectionState::Connecting => match (shared.connector)() {
                Ok(t) => {
                    transport = Some(t);
                    retries = 0;
                    on_connected(shared);
                }
                Err(e) => {
                    warn!(error = %e, "connect attempt failed");
                    transport = None;
                    shared.set_state(ConnectionState::Disconnected);
                }
            },
            ConnectionState::Authenticated => {
                let Some(t) = transport.as_mut() else {
                    shared.set_state(ConnectionState::Reconnecting);
                    continue;
                };
                run_once(shared, t.as_mut());
                if t.is_closed() {
                    shared.set_state(ConnectionState::Draining);
                } else {
                    shared.wait_for_outbound(Duration::from_micros(shared.config.send_request_timeout_us));
                }
            }
            ConnectionState::Draining => {
                transport = None;
                shared.set_state(ConnectionState::Reconnecting);
            }
            ConnectionState::Reconnecting => {
                let cap = shared.config.reconnect_max;
                if cap.is_some_and(|max| retries >= max) {
                    debug!(retries, "reconnect cap reached");
                    shared.set_state(ConnectionState::Disconnected);
                    continue;
                }
                thread::sleep(Duration::from_secs(shared.config.reconnect_backoff_s));
                retries += 1;
                shared.set_state(ConnectionState::Connecting);
            }
            ConnectionState::Disconnected => {
                shared.wait_for_state_change(Duration::from_millis(shared.config.event_loop_timeout_ms.max(50)));
            }
        }
    }
}

/// `Connecting -> Authenticated` actions from spec §4.4's transition
/// table: broadcast, mark `has_connected`, re-arm presence if the caller
/// was listening before the drop, flush any notifications that piled up,
/// and wake every pending request so it can re-issue against the fresh
/// transport.
fn on_connected(shared: &Arc<Shared>) {
    shared.has_connected.store(true, Ordering::SeqCst);
    shared.set_state(ConnectionState::Authenticated);

    if shared.was_listening.load(Ordering::SeqCst) {
        shared.session.queue_outbound("<presence/>".to_string());
    }

    if !shared.notifications.is_empty() {
        shared.requests.signal(
            NOTIFICATIONS_WAITER_ID,
            Response {
                id: NOTIFICATIONS_WAITER_ID.to_string(),
                namespace: None,
                element_name: None,
                type_attr: None,
                payload: crate::model::PacketVariant::Ok,
                stanza: None,
            },
        );
    }
}

/// One tick of the cooperative loop (spec §4.4): acquire the send-path
/// lock, flush queued sends and the handler outbox, service reads, fire
/// due timers, release.
#[instrument(skip_all)]
fn run_once(shared: &Arc<Shared>, transport: &mut dyn Transport) {
    let pending: Vec<String> = {
        let mut outbound = shared.outbound.lock().unwrap();
        outbound.drain(..).chain(shared.session.take_pending_outbox()).collect()
    };
    for text in pending {
        if let Err(e) = transport.write_pending(text.as_bytes()) {
            warn!(error = %e, "write_pending failed");
            break;
        }
    }

    match transport.read_available() {
        Ok(bytes) if !bytes.is_empty() => {
            if let Ok(text) = String::from_utf8(bytes) {
                for fragment in text.split('\n').filter(|f| !f.trim().is_empty()) {
                    if let Some(stanza) = parse_stanza_shell(fragment) {
                        shared.session.dispatch(&stanza);
                    }
                }
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "read_available failed"),
    }

    shared.session.fire_due_timers();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::Mutex as StdMutex;

    fn test_loop(connector_transport: LoopbackTransport) -> EventLoop {
        let transport = StdMutex::new(Some(connector_transport));
        let connector: Connector = Box::new(move || {
            let t = transport.lock().unwrap().take();
            t.map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or_else(|| ClientError::Connection("already connected once".into()))
        });
        EventLoop::new(
            Config::testing(),
            Arc::new(Session::new()),
            Arc::new(RequestTable::new(4)),
            Arc::new(NotifyQueue::new(3)),
            connector,
        )
    }

    #[test]
    fn start_transitions_to_authenticated_on_successful_connect() {
        let (client, _server) = LoopbackTransport::pair();
        let event_loop = test_loop(client);
        event_loop.start();
        let state = event_loop.wait_until_settled(Duration::from_secs(2));
        assert_eq!(state, ConnectionState::Authenticated);
        event_loop.shutdown();
    }

    #[test]
    fn connect_failure_settles_on_disconnected() {
        let event_loop = EventLoop::new(
            Config::testing(),
            Arc::new(Session::new()),
            Arc::new(RequestTable::new(4)),
            Arc::new(NotifyQueue::new(3)),
            Box::new(|| Err(ClientError::Connection("refused".into()))),
        );
        event_loop.start();
        let state = event_loop.wait_until_settled(Duration::from_secs(2));
        assert_eq!(state, ConnectionState::Disconnected);
        event_loop.shutdown();
    }

    #[test]
    fn send_blocking_round_trips_through_the_loopback_peer() {
        let (client, mut server) = LoopbackTransport::pair();
        let event_loop = test_loop(client);
        event_loop.start();
        event_loop.wait_until_settled(Duration::from_secs(2));

        let responder = thread::spawn(move || {
            for _ in 0..200 {
                let bytes = server.read_available().unwrap();
                if !bytes.is_empty() {
                    let text = String::from_utf8(bytes).unwrap();
                    let id = text.split("id=\"").nth(1).unwrap().split('"').next().unwrap();
                    let reply = format!("<iq type=\"result\" id=\"{id}\"/>\n");
                    server.write_pending(reply.as_bytes()).unwrap();
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
            panic!("server never observed a request");
        });

        let stanza = Stanza::new("iq").with_attr("type", "get");
        let response = event_loop.send_blocking(stanza).unwrap();
        assert_eq!(response.type_attr.as_deref(), Some("result"));

        responder.join().unwrap();
        event_loop.shutdown();
    }

    #[test]
    fn send_blocking_times_out_without_a_responder() {
        let (client, _server) = LoopbackTransport::pair();
        let event_loop = test_loop(client);
        event_loop.start();
        event_loop.wait_until_settled(Duration::from_secs(2));

        let stanza = Stanza::new("iq").with_attr("type", "get");
        let err = event_loop.send_blocking(stanza).unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        event_loop.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (client, _server) = LoopbackTransport::pair();
        let event_loop = test_loop(client);
        event_loop.start();
        event_loop.wait_until_settled(Duration::from_secs(2));
        event_loop.shutdown();
        event_loop.shutdown();
    }
}
