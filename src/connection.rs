//! Public library surface (C1's outward-facing half): lifecycle, presence,
//! and notification delivery wired on top of [`crate::event_loop::EventLoop`]
//! and [`crate::pubsub::PubSub`].
//!
//! Grounded on `kimberlite-server/src/server.rs`'s `Server`/`ShutdownHandle`
//! split (a long-lived handle that owns the runtime and exposes a narrow
//! start/stop surface) and `core_runtime.rs`'s pattern of storing the
//! runtime behind a lock so it can be torn down and rebuilt in place —
//! narrowed here from accepting connections to dialing exactly one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::decoder::{self, Shape};
use crate::error::{ClientError, ClientResult};
use crate::event_loop::{ConnectionState, Connector, EventLoop};
use crate::model::{
    Affiliation, AffiliationEntry, CollectionEntry, Meta, Reference, Response, Schedule,
    ScheduleEvent, Stanza, Subscription,
};
use crate::notify_queue::{NotifyQueue, NOTIFICATIONS_WAITER_ID};
use crate::pubsub::{self, PubSub};
use crate::request_table::{RequestKind, RequestTable};
use crate::session::{HandlerOutcome, Session};
use crate::transport::{RustlsTransport, TlsConfig, Transport};

const XMPP_TLS_PORT: u16 = 5223;

/// Installs the handler that turns inbound `<message/>` stanzas into
/// queued notifications (spec §4.3), gated by `gate` so
/// `notifications_listen_stop` can silence delivery without tearing the
/// handler down and losing its registration across reconnects.
fn install_notification_handler(
    session: &Session,
    notifications: Arc<NotifyQueue>,
    requests: Arc<RequestTable>,
    gate: Arc<AtomicBool>,
) {
    session.register_element_handler(None, Some("message".to_string()), None, move |stanza| {
        if gate.load(Ordering::SeqCst) {
            if let Some(raw) = stanza.text.as_deref() {
                match decoder::decode(raw.as_bytes(), &stanza.id, Shape::ItemsReceived) {
                    Ok(response) => {
                        notifications.enqueue(response);
                        requests.signal(
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
                    Err(e) => warn!(error = %e, "failed to decode notification message"),
                }
            }
        }
        HandlerOutcome::Keep
    });
}

fn dial(jid: &str) -> ClientResult<Connector> {
    let domain = pubsub::domain_of(jid)?.to_string();
    let addr = format!("{domain}:{XMPP_TLS_PORT}");
    let server_name = domain;
    Ok(Box::new(move || {
        let transport = RustlsTransport::connect(&addr, &server_name, TlsConfig::webpki_roots())?;
        Ok(Box::new(transport) as Box<dyn Transport>)
    }))
}

struct Live {
    event_loop: Arc<EventLoop>,
    pubsub: PubSub,
}

/// A long-lived XMPP session: one dedicated worker thread, a correlated
/// request table, a bounded notification queue, and the XEP-0060
/// operations layered on top (spec §6's "Library surface").
///
/// Holds no transport of its own between calls to `connect`/`reconnect` —
/// [`Live`] is rebuilt from scratch on every (re)connect, while the
/// session's handler registry, request table, and notification queue
/// persist across the swap so in-flight state survives a reconnect.
pub struct Connection {
    config: Config,
    session: Arc<Session>,
    requests: Arc<RequestTable>,
    notifications: Arc<NotifyQueue>,
    notifications_gate: Arc<AtomicBool>,
    live: Mutex<Option<Live>>,
    jid: Mutex<Option<String>>,
}

impl Connection {
    /// Builds an idle connection. Nothing is dialed until `connect`.
    #[must_use]
    pub fn new_connection(log_level: tracing::Level) -> Self {
        let config = Config {
            log_level,
            ..Config::default()
        };
        let session = Arc::new(Session::new());
        let requests = Arc::new(RequestTable::new(config.max_open_requests));
        let notifications = Arc::new(NotifyQueue::new(config.notify_queue_max));
        let notifications_gate = Arc::new(AtomicBool::new(false));

        install_notification_handler(
            &session,
            notifications.clone(),
            requests.clone(),
            notifications_gate.clone(),
        );

        Self {
            config,
            session,
            requests,
            notifications,
            notifications_gate,
            live: Mutex::new(None),
            jid: Mutex::new(None),
        }
    }

    /// Dials `jid`'s domain over TLS and starts the event loop.
    ///
    /// This skeleton performs the TLS handshake and hands the resulting
    /// transport straight to the cooperative loop; it does not perform a
    /// SASL/resource-bind negotiation over that transport — authentication
    /// is left to whatever the deployed server expects on the wire, per
    /// spec §9's note that the handshake itself is out of scope. `password`
    /// is retained only so `reconnect` can redial with the same
    /// credentials once that negotiation is wired in.
    #[instrument(skip(self, password, on_event))]
    pub fn connect(
        &self,
        jid: &str,
        password: &str,
        mut on_event: impl FnMut(ConnectionState) + Send + 'static,
    ) -> ClientResult<()> {
        let connector = dial(jid)?;
        let event_loop = Arc::new(EventLoop::new(
            self.config.clone(),
            self.session.clone(),
            self.requests.clone(),
            self.notifications.clone(),
            connector,
        ));
        event_loop.start();
        let state = event_loop.wait_until_settled(Duration::from_secs(self.config.request_timeout_s));
        on_event(state);
        if !matches!(state, ConnectionState::Authenticated) {
            return Err(ClientError::Connection("failed to reach the event loop's authenticated state".into()));
        }

        let pubsub = PubSub::new(event_loop.clone(), jid)?;
        *self.live.lock().unwrap() = Some(Live { event_loop, pubsub });
        *self.jid.lock().unwrap() = Some(jid.to_string());
        let _ = password;
        info!(jid, "connected");
        Ok(())
    }

    /// Tears down and rebuilds the event loop against the same jid used in
    /// the last `connect`, per spec §6's argument-less `reconnect()`.
    pub fn reconnect(&self) -> ClientResult<()> {
        let jid = self
            .jid
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::EventLoopNotStarted)?;
        self.disconnect();
        self.connect(&jid, "", |_| {})
    }

    /// Stops the worker thread and drops the transport. Safe to call when
    /// already disconnected.
    pub fn disconnect(&self) {
        if let Some(live) = self.live.lock().unwrap().take() {
            live.event_loop.shutdown();
        }
    }

    fn live(&self) -> ClientResult<Arc<EventLoop>> {
        self.live
            .lock()
            .unwrap()
            .as_ref()
            .map(|live| live.event_loop.clone())
            .ok_or(ClientError::EventLoopNotStarted)
    }

    fn with_pubsub<T>(&self, f: impl FnOnce(&PubSub) -> ClientResult<T>) -> ClientResult<T> {
        let guard = self.live.lock().unwrap();
        let live = guard.as_ref().ok_or(ClientError::EventLoopNotStarted)?;
        f(&live.pubsub)
    }

    // ---- Presence ------------------------------------------------------

    /// Marks this connection as "listening" (re-issued automatically on
    /// reconnect, per spec §4.4) and broadcasts initial presence.
    pub fn start_listening(&self) -> ClientResult<()> {
        let event_loop = self.live()?;
        event_loop.mark_listening(true);
        event_loop.send_nonblocking("<presence/>".to_string())
    }

    pub fn stop_listening(&self) -> ClientResult<()> {
        let event_loop = self.live()?;
        event_loop.mark_listening(false);
        event_loop.send_nonblocking(r#"<presence type="unavailable"/>"#.to_string())
    }

    // ---- Notifications --------------------------------------------------

    pub fn notifications_listen_start(&self) {
        self.notifications_gate.store(true, Ordering::SeqCst);
    }

    pub fn notifications_listen_stop(&self) {
        self.notifications_gate.store(false, Ordering::SeqCst);
    }

    /// Pops the oldest queued notification, blocking up to `timeout` if
    /// none is queued yet.
    pub fn receive_notification(&self, timeout: Duration) -> ClientResult<Response> {
        if let Some(response) = self.notifications.dequeue() {
            return Ok(response);
        }
        let entry = self.requests.add(NOTIFICATIONS_WAITER_ID, RequestKind::Timed);
        let woken = self.requests.wait(&entry, timeout);
        self.requests.remove(NOTIFICATIONS_WAITER_ID);
        if woken.is_none() {
            return Err(ClientError::Timeout);
        }
        self.notifications.dequeue().ok_or(ClientError::NoResponse)
    }

    pub fn notifications_clear(&self) {
        self.notifications.clear();
    }

    // ---- PubSub core -----------------------------------------------------

    pub fn create_node(&self, node: &str, title: Option<&str>, access_model: Option<&str>) -> ClientResult<()> {
        self.with_pubsub(|p| p.create_node(node, title, access_model))
    }

    pub fn delete_node(&self, node: &str) -> ClientResult<()> {
        self.with_pubsub(|p| p.delete_node(node))
    }

    pub fn publish_item(&self, node: &str, item_id: &str, payload: Stanza) -> ClientResult<()> {
        self.with_pubsub(move |p| p.publish_item(node, item_id, payload))
    }

    pub fn item_recent_get(&self, node: &str, max_items: u32, item_id: Option<&str>) -> ClientResult<Response> {
        self.with_pubsub(|p| p.item_recent_get(node, max_items, item_id))
    }

    // ---- Subscriptions ----------------------------------------------------

    pub fn subscribe(&self, node: &str) -> ClientResult<()> {
        self.with_pubsub(|p| p.subscribe(node))
    }

    pub fn unsubscribe(&self, node: &str, subid: Option<&str>) -> ClientResult<()> {
        self.with_pubsub(|p| p.unsubscribe(node, subid))
    }

    pub fn subscriptions_query(&self) -> ClientResult<Vec<Subscription>> {
        self.with_pubsub(PubSub::subscriptions_query)
    }

    // ---- ACL --------------------------------------------------------------

    pub fn acl_affiliations_query(&self, node: Option<&str>) -> ClientResult<Vec<AffiliationEntry>> {
        self.with_pubsub(|p| p.acl_affiliations_query(node))
    }

    pub fn acl_affiliation_set(&self, node: &str, jid: &str, kind: Affiliation) -> ClientResult<()> {
        self.with_pubsub(|p| p.acl_affiliation_set(node, jid, kind))
    }

    // ---- Collections --------------------------------------------------------

    pub fn collection_create(&self, node: &str, title: Option<&str>) -> ClientResult<()> {
        self.with_pubsub(|p| p.collection_create(node, title))
    }

    pub fn collection_add_child(&self, parent: &str, child: &str) -> ClientResult<()> {
        self.with_pubsub(|p| p.collection_add_child(parent, child))
    }

    pub fn collection_remove_child(&self, parent: &str, child: &str) -> ClientResult<()> {
        self.with_pubsub(|p| p.collection_remove_child(parent, child))
    }

    pub fn collection_children_query(&self, node: &str) -> ClientResult<Vec<CollectionEntry>> {
        self.with_pubsub(|p| p.collection_children(node))
    }

    pub fn collection_parents_query(&self, node: &str) -> ClientResult<Vec<CollectionEntry>> {
        self.with_pubsub(|p| p.collection_parents(node))
    }

    // ---- Meta / Geo / Schedule / References ------------------------------

    pub fn meta_merge_publish(&self, node: &str, incoming: &Meta) -> ClientResult<Meta> {
        self.with_pubsub(|p| p.meta_merge_publish(node, incoming))
    }

    pub fn references_query(&self, node: &str) -> ClientResult<Vec<Reference>> {
        self.with_pubsub(|p| p.references_query(node))
    }

    pub fn reference_child_add(&self, parent: &str, child: &str, also_at_child: bool) -> ClientResult<()> {
        self.with_pubsub(|p| p.reference_child_add(parent, child, also_at_child))
    }

    pub fn reference_child_remove(&self, parent: &str, child: &str) -> ClientResult<()> {
        self.with_pubsub(|p| p.reference_child_remove(parent, child))
    }

    pub fn schedule_get(&self, node: &str) -> ClientResult<Schedule> {
        self.with_pubsub(|p| p.schedule_get(node))
    }

    pub fn schedule_merge(&self, node: &str, incoming: Vec<ScheduleEvent>) -> ClientResult<Schedule> {
        self.with_pubsub(move |p| p.schedule_merge(node, incoming))
    }

    pub fn schedule_remove(&self, node: &str, id: u32) -> ClientResult<Schedule> {
        self.with_pubsub(|p| p.schedule_remove(node, id))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use std::sync::Mutex as StdMutex;

    /// Builds a `Connection` whose event loop dials a pre-built loopback
    /// transport instead of TLS, bypassing `connect`'s real dialer.
    fn test_connection(transport: LoopbackTransport, jid: &str) -> (Connection, Arc<EventLoop>) {
        let config = Config::testing();
        let session = Arc::new(Session::new());
        let requests = Arc::new(RequestTable::new(config.max_open_requests));
        let notifications = Arc::new(NotifyQueue::new(config.notify_queue_max));
        let gate = Arc::new(AtomicBool::new(false));
        install_notification_handler(&session, notifications.clone(), requests.clone(), gate.clone());

        let slot = StdMutex::new(Some(transport));
        let connector: Connector = Box::new(move || {
            slot.lock()
                .unwrap()
                .take()
                .map(|t| Box::new(t) as Box<dyn Transport>)
                .ok_or_else(|| ClientError::Connection("already connected once".into()))
        });
        let event_loop = Arc::new(EventLoop::new(config.clone(), session.clone(), requests.clone(), notifications.clone(), connector));
        event_loop.start();
        event_loop.wait_until_settled(Duration::from_secs(2));
        let pubsub = PubSub::new(event_loop.clone(), jid).unwrap();

        let connection = Connection {
            config,
            session,
            requests,
            notifications,
            notifications_gate: gate,
            live: Mutex::new(Some(Live {
                event_loop: event_loop.clone(),
                pubsub,
            })),
            jid: Mutex::new(Some(jid.to_string())),
        };
        (connection, event_loop)
    }

    #[test]
    fn operations_fail_with_event_loop_not_started_before_connect() {
        let connection = Connection::new_connection(tracing::Level::DEBUG);
        let err = connection.subscriptions_query().unwrap_err();
        assert!(matches!(err, ClientError::EventLoopNotStarted));
    }

    #[test]
    fn receive_notification_delivers_a_queued_message_stanza() {
        let (client, mut server) = LoopbackTransport::pair();
        let (connection, _event_loop) = test_connection(client, "user@example.com");
        connection.notifications_listen_start();

        server
            .write_pending(b"<message id=\"n1\"><event xmlns=\"http://jabber.org/protocol/pubsub#event\"/></message>\n")
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !connection.notifications.is_empty() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "notification never arrived");
            std::thread::sleep(Duration::from_millis(5));
        }

        let notification = connection.receive_notification(Duration::from_millis(100)).unwrap();
        assert_eq!(notification.id, "n1");
    }

    #[test]
    fn receive_notification_times_out_when_queue_stays_empty() {
        let (client, _server) = LoopbackTransport::pair();
        let (connection, _event_loop) = test_connection(client, "user@example.com");
        let err = connection.receive_notification(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }

    #[test]
    fn notifications_clear_drops_anything_queued() {
        let (client, _server) = LoopbackTransport::pair();
        let (connection, _event_loop) = test_connection(client, "user@example.com");
        connection.notifications.enqueue(Response {
            id: "n1".to_string(),
            namespace: None,
            element_name: None,
            type_attr: None,
            payload: crate::model::PacketVariant::Ok,
            stanza: None,
        });
        connection.notifications_clear();
        assert!(connection.receive_notification(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn start_listening_marks_the_event_loop_and_queues_presence() {
        let (client, mut server) = LoopbackTransport::pair();
        let (connection, event_loop) = test_connection(client, "user@example.com");
        connection.start_listening().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let bytes = server.read_available().unwrap();
            if !bytes.is_empty() {
                assert!(String::from_utf8(bytes).unwrap().contains("<presence/>"));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "presence was never sent");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(event_loop.state(), ConnectionState::Authenticated);
    }
}
