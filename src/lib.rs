//! # xmpp-pubsub-client
//!
//! An async-from-the-caller's-perspective, synchronous-underneath client
//! for a long-lived XMPP connection built around XEP-0060 publish-subscribe:
//! node lifecycle, subscriptions, ACLs, node collections, and the
//! meta/geolocation/schedule/reference payloads carried as pubsub items.
//!
//! ## Architecture
//!
//! One dedicated worker thread drives the wire session cooperatively —
//! no async runtime, matching the project's preference for explicit
//! control flow over implicit task scheduling.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Connection                                │
//! │  ┌───────────┐  ┌──────────────┐  ┌───────────┐  ┌─────────────┐ │
//! │  │  Session   │  │ RequestTable │  │ NotifyQueue│  │   PubSub    │ │
//! │  │ (handlers) │  │ (correlation)│  │ (bounded)  │  │ (XEP-0060)  │ │
//! │  └─────┬─────┘  └──────┬───────┘  └─────┬──────┘  └──────┬──────┘ │
//! │        └───────────────┴────────────────┴────────────────┘       │
//! │                         EventLoop (worker thread)                  │
//! │                                 │                                  │
//! │                            Transport (TLS)                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use xmpp_pubsub_client::Connection;
//! use tracing::Level;
//!
//! let conn = Connection::new_connection(Level::INFO);
//! conn.connect("sensor-01@example.com", "secret", |_state| {})?;
//! conn.create_node("sensor-01/readings", Some("Readings"), None)?;
//! conn.publish_item("sensor-01/readings", "meta", payload)?;
//! # Ok::<(), xmpp_pubsub_client::ClientError>(())
//! ```

mod config;
mod connection;
mod decoder;
mod error;
mod event_loop;
mod model;
mod notify_queue;
mod pubsub;
mod request_table;
mod session;
mod transport;

pub use config::Config;
pub use connection::Connection;
pub use error::{ClientError, ClientResult};
pub use event_loop::ConnectionState;
pub use model::{
    Affiliation, AffiliationEntry, CollectionEntry, Geolocation, Meta, MetaKind, NodeType,
    PacketVariant, Property, Recurrence, Reference, ReferenceKind, Response, Schedule,
    ScheduleEvent, Stanza, Subscription, TransducerKind, TransducerMeta, TransducerReading,
};
pub use pubsub::PubSub;
pub use transport::{LoopbackTransport, RustlsTransport, TlsConfig, Transport};
