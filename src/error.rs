//! Client error types.

use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur during client operations.
///
/// Every public operation returns this error type; no panic or exception
/// crosses the library boundary. A server-reported `<error/>` is carried
/// verbatim in [`ClientError::Remote`] rather than collapsed into a generic
/// variant.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection is not currently authenticated.
    #[error("not connected")]
    Disconnected,

    /// A blocking call did not complete within its deadline.
    #[error("request timed out")]
    Timeout,

    /// The underlying transport failed and reconnection was exhausted.
    #[error("connection error: {0}")]
    Connection(String),

    /// `remove`/`get` referenced an id absent from the request table.
    #[error("request not found")]
    RequestNotFound,

    /// The open-request semaphore has no permits left.
    #[error("too many open requests (limit {0})")]
    TooManyOpenRequests(usize),

    /// `subscribe` was called against a node already subscribed (I6).
    #[error("already subscribed to node")]
    AlreadySubscribed,

    /// A reference remove targeted a pair that was not linked.
    #[error("not affiliated")]
    NotAffiliated,

    /// A reference or collection add targeted an existing link.
    #[error("duplicate entry")]
    DuplicateEntry,

    /// A reference add would have created parent/child cycle.
    #[error("reference loop detected")]
    ReferenceLoop,

    /// Decoded response was not the shape the caller expected.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// Decoded payload was not the variant the caller expected.
    #[error("unexpected payload")]
    UnexpectedPayload,

    /// `affiliation` attribute did not match a known enum string.
    #[error("unknown affiliation kind: {0}")]
    UnknownAffiliationKind(String),

    /// Item payload's root child element had no recognised decoder.
    #[error("unknown packet kind: {0}")]
    UnknownPacketKind(String),

    /// Response carried a `type` attribute outside `{get,set,result,error}`.
    #[error("unknown response kind")]
    UnknownResponseKind,

    /// `meta[type=...]` did not match a known `MetaKind`.
    #[error("unknown meta kind: {0}")]
    UnknownMetaKind(String),

    /// The decoder failed to allocate scratch state for a parse.
    #[error("parser allocation failed")]
    ParserAllocation,

    /// The SAX adapter reported a lexical/structural XML error.
    #[error("parser failure: {0}")]
    ParserFailure(String),

    /// A handler fired with no associated stanza to decode.
    #[error("null stanza")]
    NullStanza,

    /// A `local@domain/resource` address failed to parse.
    #[error("invalid jid: {0}")]
    InvalidJid(String),

    /// A blocking call was issued before `connect` started the event loop.
    #[error("event loop not started")]
    EventLoopNotStarted,

    /// The event loop exited without ever delivering a response.
    #[error("no response")]
    NoResponse,

    /// `register_*_handler` failed to install its callback.
    #[error("failed to add handler")]
    HandlerAddFailed,

    /// A transducer reading element lacked a `name` attribute.
    #[error("transducer has no name")]
    TransducerNullName,

    /// A transducer reading element lacked a `value` attribute.
    #[error("transducer has no value")]
    TransducerNullValue,

    /// A server-reported `<error/>`, surfaced verbatim (spec §7).
    #[error("remote error {code}: {description}")]
    Remote { code: i32, description: String },

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or certificate failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The SAX reader failed to tokenize the inbound stream.
    #[error("xml decode error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl ClientError {
    /// True for faults that the event loop should attempt to recover from
    /// by reconnecting, rather than surfacing directly to the caller.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Disconnected)
    }
}
