/*! Access to a TCP/IP stack.

The session engine does not talk to a concrete network stack; it drives
the [`TcpStack`] trait. The callback web a typical embedded stack wants
(accept/recv/sent/err/poll callbacks per control block) is recast as a
pair of flows:

- **events** ([`Event`]) produced by the stack and pumped out through
  [`TcpStack::poll_events`] — an incoming connection, a completed
  connect, a received chain, a send acknowledgement, peer close, or an
  error;
- **commands** — the remaining trait methods the session calls in
  response: accept or refuse, connect, write/output, window
  acknowledgement, abort, close.

[`SysTcpStack`] implements the trait over the host's sockets; the test
suites script their own implementations.
*/

mod net;
pub mod sys;

pub use self::net::SysTcpStack;

use core::fmt;
use std::net::SocketAddrV4;

use crate::pkbuf::PacketBuffer;

/// An error surfaced by the TCP stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The peer refused the connection.
    Refused,
    /// The connection was reset by the peer or the network.
    Reset,
    /// The connection was aborted locally.
    Aborted,
    /// The connection attempt timed out.
    TimedOut,
    /// The local address is unavailable or in use.
    InUse,
    /// No connection exists for the requested operation.
    NotConnected,
    /// Any other OS-level error, by errno.
    Os(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Refused => write!(f, "connection refused"),
            Error::Reset => write!(f, "connection reset"),
            Error::Aborted => write!(f, "connection aborted"),
            Error::TimedOut => write!(f, "connection timed out"),
            Error::InUse => write!(f, "address in use"),
            Error::NotConnected => write!(f, "not connected"),
            Error::Os(errno) => write!(f, "os error {errno}"),
        }
    }
}

impl std::error::Error for Error {}

/// Something the TCP stack wants the session to know.
#[derive(Debug)]
pub enum Event {
    /// A connection is pending on the listener; the session decides
    /// between [`TcpStack::accept`] and [`TcpStack::refuse`].
    Incoming,
    /// A client-mode connect completed.
    ConnectOk,
    /// A payload chain arrived. The stack's receive window stays closed
    /// for these bytes until the session acknowledges them with
    /// [`TcpStack::recved`].
    Received(PacketBuffer),
    /// The peer acknowledged `len` bytes previously written.
    Sent(usize),
    /// The peer closed the connection cleanly.
    PeerClosed,
    /// The connection failed; the stack has already released it.
    Error(Error),
}

/// One port's window into the TCP/IP stack: at most one listener and one
/// connection at a time.
pub trait TcpStack {
    /// Bind and listen on `local_port`.
    fn listen(&mut self, local_port: u16) -> Result<(), Error>;

    /// Start a connection attempt to `remote`, dialing from
    /// `local_port` when it is non-zero. Completion is reported via
    /// [`Event::ConnectOk`] or [`Event::Error`].
    fn connect(&mut self, remote: SocketAddrV4, local_port: u16) -> Result<(), Error>;

    /// Take the pending incoming connection as the active one.
    fn accept(&mut self) -> Result<(), Error>;

    /// Drop the pending incoming connection, releasing its resources.
    fn refuse(&mut self);

    /// Stage data for transmission. Returns how many bytes the send
    /// buffer accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// Push staged data out.
    fn output(&mut self);

    /// Acknowledge `len` received bytes, reopening the receive window.
    fn recved(&mut self, len: usize);

    /// Free space in the send buffer.
    fn send_buffer(&self) -> usize;

    /// Whether the stack has hit its outstanding-segment limit and
    /// writes should pause.
    fn send_queue_full(&self) -> bool;

    /// Tear the active connection down immediately (the peer sees a
    /// reset).
    fn abort(&mut self);

    /// Close the active connection gracefully.
    fn close(&mut self);

    /// Stop listening.
    fn close_listener(&mut self);

    /// Drain pending stack activity into `events`.
    fn poll_events(&mut self, events: &mut Vec<Event>);
}
