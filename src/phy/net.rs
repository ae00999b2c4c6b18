#![allow(unsafe_code)]

use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use crate::phy::{Error, Event, TcpStack};
use crate::pkbuf::PacketBuffer;
use crate::session::PBUF_QUEUE_LEN;

/// Send-buffer capacity, sized like a small embedded stack's TCP send
/// buffer.
const SND_BUF_LEN: usize = 2048;

/// Number of staged-but-unflushed writes tolerated before the session's
/// queue-length guard kicks in.
const SND_QUEUE_LEN: usize = 16;

/// Read granularity; one received chain per read.
const RECV_CHUNK: usize = 256;

/// Receive-window credit. Sized to the session's inbound queue so this
/// backend never delivers more than the session can hold: bytes read
/// from a kernel socket are already TCP-acknowledged, so unlike a raw
/// stack there would be no retransmission to fall back on.
const WINDOW: usize = PBUF_QUEUE_LEN * RECV_CHUNK;

fn map_io(err: &std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::ConnectionRefused => Error::Refused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Error::Reset
        }
        ErrorKind::TimedOut => Error::TimedOut,
        ErrorKind::AddrInUse => Error::InUse,
        _ => Error::Os(err.raw_os_error().unwrap_or(0)),
    }
}

fn map_errno(errno: i32) -> Error {
    match errno {
        libc::ECONNREFUSED => Error::Refused,
        libc::ECONNRESET | libc::EPIPE => Error::Reset,
        libc::ETIMEDOUT => Error::TimedOut,
        libc::EADDRINUSE => Error::InUse,
        _ => Error::Os(errno),
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn sockaddr_v4(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            // The octets already are in network order.
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

/// [`TcpStack`] over the host's sockets.
///
/// Everything is nonblocking; [`SysTcpStack::poll_events`] advances all
/// in-flight work (listener accepts, connect completion, flushing,
/// reading) and reports it as events. `abort` arms zero-linger before
/// dropping the connection so the peer observes a reset, matching the
/// semantics the session engine expects from an embedded stack.
#[derive(Debug)]
pub struct SysTcpStack {
    listener: Option<TcpListener>,
    /// Accepted but not yet claimed by the session.
    pending: Option<TcpStream>,
    /// A nonblocking connect in flight.
    connecting: Option<RawFd>,
    conn: Option<TcpStream>,
    out: Vec<u8>,
    out_segments: usize,
    /// Bytes flushed to the kernel since the last `Sent` event.
    acked: usize,
    window: usize,
    peer_closed_seen: bool,
    pending_error: Option<Error>,
}

impl SysTcpStack {
    pub fn new() -> SysTcpStack {
        SysTcpStack {
            listener: None,
            pending: None,
            connecting: None,
            conn: None,
            out: Vec::with_capacity(SND_BUF_LEN),
            out_segments: 0,
            acked: 0,
            window: WINDOW,
            peer_closed_seen: false,
            pending_error: None,
        }
    }

    /// File descriptors a driver loop can block on for this port. The
    /// connection is excluded while the receive window is closed:
    /// readable-but-unreadable data would otherwise wake the loop
    /// without anything to do until the next tick drains the queue.
    pub fn pollable_fds(&self, fds: &mut Vec<RawFd>) {
        if let Some(listener) = &self.listener {
            fds.push(listener.as_raw_fd());
        }
        if let Some(conn) = &self.conn {
            if self.window >= RECV_CHUNK && !self.peer_closed_seen {
                fds.push(conn.as_raw_fd());
            }
        }
        if let Some(fd) = self.connecting {
            fds.push(fd);
        }
    }

    fn reset_conn_state(&mut self) {
        self.out.clear();
        self.out_segments = 0;
        self.acked = 0;
        self.window = WINDOW;
        self.peer_closed_seen = false;
        self.pending_error = None;
    }

    fn drop_connecting(&mut self) {
        if let Some(fd) = self.connecting.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn try_flush(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        while !self.out.is_empty() {
            match conn.write(&self.out) {
                Ok(0) => break,
                Ok(n) => {
                    self.acked += n;
                    self.out.drain(..n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.pending_error = Some(map_io(&err));
                    break;
                }
            }
        }
        if self.out.is_empty() {
            self.out_segments = 0;
        }
    }

    /// Check a nonblocking connect for completion without blocking.
    fn poll_connecting(&mut self, events: &mut Vec<Event>) {
        let Some(fd) = self.connecting else { return };
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        let res = unsafe { libc::poll(&mut pollfd, 1, 0) };
        if res <= 0 {
            return;
        }
        if pollfd.revents & (libc::POLLOUT | libc::POLLERR | libc::POLLHUP) == 0 {
            return;
        }
        self.connecting = None;

        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            err = last_errno();
        }
        if err == 0 {
            let stream = unsafe { TcpStream::from_raw_fd(fd) };
            let _ = stream.set_nodelay(true);
            self.conn = Some(stream);
            self.reset_conn_state();
            events.push(Event::ConnectOk);
        } else {
            unsafe {
                libc::close(fd);
            }
            events.push(Event::Error(map_errno(err)));
        }
    }

    fn poll_listener(&mut self, events: &mut Vec<Event>) {
        let Some(listener) = &self.listener else {
            return;
        };
        // Hold at most one undecided connection; the kernel queues the
        // rest behind the backlog.
        if self.pending.is_some() {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                net_trace!("phy: connection pending from {}", peer);
                let _ = stream.set_nonblocking(true);
                self.pending = Some(stream);
                events.push(Event::Incoming);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                net_debug!("phy: accept failed: {}", err);
            }
        }
    }

    fn poll_reads(&mut self, events: &mut Vec<Event>) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if self.peer_closed_seen {
            return;
        }
        let mut buf = [0u8; RECV_CHUNK];
        while self.window >= RECV_CHUNK {
            match conn.read(&mut buf) {
                Ok(0) => {
                    self.peer_closed_seen = true;
                    events.push(Event::PeerClosed);
                    break;
                }
                Ok(n) => {
                    self.window -= n;
                    events.push(Event::Received(PacketBuffer::from_slice(&buf[..n])));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.pending_error = Some(map_io(&err));
                    break;
                }
            }
        }
    }
}

impl Default for SysTcpStack {
    fn default() -> SysTcpStack {
        SysTcpStack::new()
    }
}

impl Drop for SysTcpStack {
    fn drop(&mut self) {
        self.drop_connecting();
    }
}

impl TcpStack for SysTcpStack {
    fn listen(&mut self, local_port: u16) -> Result<(), Error> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, local_port))
            .map_err(|err| map_io(&err))?;
        listener.set_nonblocking(true).map_err(|err| map_io(&err))?;
        self.listener = Some(listener);
        Ok(())
    }

    fn connect(&mut self, remote: SocketAddrV4, local_port: u16) -> Result<(), Error> {
        // A still-unanswered earlier attempt is abandoned.
        self.drop_connecting();

        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(map_errno(last_errno()));
        }

        unsafe {
            let one: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        if local_port != 0 {
            let local = sockaddr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port));
            let rc = unsafe {
                libc::bind(
                    fd,
                    &local as *const _ as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                let errno = last_errno();
                unsafe {
                    libc::close(fd);
                }
                return Err(map_errno(errno));
            }
        }

        let sa = sockaddr_v4(remote);
        let rc = unsafe {
            libc::connect(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            self.connecting = Some(fd);
            return Ok(());
        }
        let errno = last_errno();
        if errno == libc::EINPROGRESS {
            self.connecting = Some(fd);
            Ok(())
        } else {
            unsafe {
                libc::close(fd);
            }
            Err(map_errno(errno))
        }
    }

    fn accept(&mut self) -> Result<(), Error> {
        match self.pending.take() {
            Some(stream) => {
                let _ = stream.set_nodelay(true);
                self.conn = Some(stream);
                self.reset_conn_state();
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    fn refuse(&mut self) {
        self.pending = None;
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if self.conn.is_none() {
            return Err(Error::NotConnected);
        }
        let space = SND_BUF_LEN - self.out.len();
        let accepted = data.len().min(space);
        if accepted > 0 {
            self.out.extend_from_slice(&data[..accepted]);
            self.out_segments += 1;
        }
        Ok(accepted)
    }

    fn output(&mut self) {
        self.try_flush();
    }

    fn recved(&mut self, len: usize) {
        self.window = (self.window + len).min(WINDOW);
    }

    fn send_buffer(&self) -> usize {
        if self.conn.is_some() {
            SND_BUF_LEN - self.out.len()
        } else {
            0
        }
    }

    fn send_queue_full(&self) -> bool {
        self.out_segments >= SND_QUEUE_LEN
    }

    fn abort(&mut self) {
        self.drop_connecting();
        if let Some(conn) = self.conn.take() {
            // Zero linger turns the close into a reset.
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            unsafe {
                libc::setsockopt(
                    conn.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &linger as *const _ as *const libc::c_void,
                    mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
        }
        self.out.clear();
        self.out_segments = 0;
    }

    fn close(&mut self) {
        self.try_flush();
        self.conn = None;
        self.out.clear();
        self.out_segments = 0;
    }

    fn close_listener(&mut self) {
        self.listener = None;
        self.pending = None;
    }

    fn poll_events(&mut self, events: &mut Vec<Event>) {
        self.poll_listener(events);
        self.poll_connecting(events);
        if self.conn.is_some() {
            self.try_flush();
            if self.acked > 0 {
                events.push(Event::Sent(self.acked));
                self.acked = 0;
            }
            self.poll_reads(events);
        }
        if let Some(err) = self.pending_error.take() {
            self.conn = None;
            self.out.clear();
            self.out_segments = 0;
            events.push(Event::Error(err));
        }
    }
}
