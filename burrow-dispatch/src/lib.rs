//! Query dispatchers.
//!
//! A dispatcher owns one socket and demultiplexes incoming responses to
//! registered response slots by (peer address, message id). Replies that
//! carry an unknown id, arrive from an unexpected peer, or do not have QR
//! set are dropped here and never reach the fetch engine.

use std::net::SocketAddr;

use thiserror::Error;

pub mod tcp;
pub mod udp;

pub use tcp::TcpDispatch;
pub use udp::UdpDispatch;

/// Dispatcher errors.
#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    /// No port in the configured range could be bound.
    #[error("no free port in {start}..{end}")]
    NoFreePort { start: u16, end: u16 },

    /// Socket-level failure, flattened to a message so events stay
    /// cloneable.
    #[error("socket error: {0}")]
    Io(String),

    /// All 65536 message ids toward this peer are in flight.
    #[error("no free message id for {0}")]
    NoFreeId(SocketAddr),

    /// The transport is not connected (TCP send before connect finished,
    /// or after the peer closed).
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),
}

impl From<std::io::Error> for DispatchError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Callback invoked with the wire bytes of each matched response.
pub type ResponseHandler = Box<dyn FnMut(Vec<u8>) + Send>;

/// Callback invoked once with the outcome of a send.
pub type SendDone = Box<dyn FnOnce(Result<(), DispatchError>) + Send>;

/// Callback invoked once when a TCP connect completes.
pub type ConnectDone = Box<dyn FnOnce(Result<(), DispatchError>) + Send>;

/// A registered response slot: the message id reserved for the query and
/// the key it is filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEntry {
    pub id: u16,
    pub peer: SocketAddr,
}

/// The dispatcher interface the fetch engine drives.
pub trait Dispatch: Send + Sync {
    /// Reserves a message id for a query to `peer` and registers `handler`
    /// for its response.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NoFreeId`] when no id can be reserved.
    fn add_response(
        &self,
        peer: SocketAddr,
        handler: ResponseHandler,
    ) -> Result<ResponseEntry, DispatchError>;

    /// Unregisters a response slot; any response arriving afterwards is
    /// dropped.
    fn remove_response(&self, entry: &ResponseEntry);

    /// Sends `wire` toward `peer`, reporting completion through `done`.
    fn send(&self, wire: Vec<u8>, peer: SocketAddr, done: SendDone);

    /// The local address of the underlying socket, when bound.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Pulls (id, QR) out of a wire message header, if it is long enough.
#[must_use]
pub(crate) fn peek_header(wire: &[u8]) -> Option<(u16, bool)> {
    if wire.len() < 3 {
        return None;
    }
    Some((u16::from_be_bytes([wire[0], wire[1]]), wire[2] & 0x80 != 0))
}
