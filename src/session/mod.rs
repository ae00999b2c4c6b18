/*! The per-port session engine.

A [`Session`] owns one port's TCP lifecycle and moves bytes between the
TCP stack and the serial controller. It is driven from exactly two
places: typed stack events ([`Event`](crate::phy::Event)) delivered
through [`Session::handle_event`], and the periodic tick delivered
through [`Session::poll`]. All policy lives here:

- the lifecycle state machine (`Idle → Listen → Connected` for servers,
  `Idle → Connecting → Connected` for clients, with error and close
  edges back);
- the accept rule: an established connection is defended against new
  arrivals unless the physical link was lost since it was made, in which
  case the stale connection is aborted and the new one takes its place;
- client reconnection on a 3-second cadence;
- the server-side idle timeout, counted in poll ticks and reset by send
  acknowledgements;
- both data paths, including the bounded inbound queue whose overflow
  deliberately leaves pbufs unacknowledged so the peer retransmits.
*/

use core::fmt;
use std::net::SocketAddrV4;

use heapless::Deque;

use crate::config::{PortConfig, Protocol, Role};
use crate::phy::{Error, Event, TcpStack};
use crate::pkbuf::{ChainCursor, PacketBuffer};
use crate::telnet::Parser;
use crate::uart::{SerialPort, UartDevice};
use crate::wire::comport;
use crate::wire::telnet::INIT_OFFER;

/// Nominal milliseconds between session polls.
pub const TICK_MS: u32 = 500;

/// Poll ticks between client connect attempts (3 seconds).
const CONNECT_RETRY_TICKS: u32 = 3000 / TICK_MS;

/// Capacity of the inbound pbuf-chain queue.
pub const PBUF_QUEUE_LEN: usize = 16;

/// Staging buffer for the UART-to-TCP drain, one write per chunk.
const STAGING_LEN: usize = 256;

/// The TCP lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    /// Neither listening nor connecting.
    #[default]
    Idle,
    /// Listening for an inbound connection (server mode).
    Listen,
    /// A connect attempt is in flight (client mode).
    Connecting,
    /// A connection is established.
    Connected,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpState::Idle => write!(f, "IDLE"),
            TcpState::Listen => write!(f, "LISTEN"),
            TcpState::Connecting => write!(f, "CONNECTING"),
            TcpState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// A diagnostic snapshot of one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionDiag {
    pub tcp_state: TcpState,
    pub connect_count: u32,
    pub reconnect_count: u32,
    pub error_count: u32,
    pub last_error: Option<Error>,
    pub link_lost: bool,
    pub last_send_tick: u64,
}

impl fmt::Display for SessionDiag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "state={} connects={} reconnects={} errors={} link-lost={}",
            self.tcp_state,
            self.connect_count,
            self.reconnect_count,
            self.error_count,
            if self.link_lost { "yes" } else { "no" },
        )?;
        if let Some(err) = self.last_error {
            write!(f, " last-error={err}")?;
        }
        Ok(())
    }
}

/// The session engine for one bridged port.
#[derive(Debug)]
pub struct Session {
    index: usize,
    cfg: PortConfig,
    tcp_state: TcpState,
    parser: Parser,
    queue: Deque<PacketBuffer, PBUF_QUEUE_LEN>,
    current: Option<(PacketBuffer, ChainCursor)>,
    /// Negotiation replies accumulated during a poll, written ahead of
    /// any drained payload.
    reply: Vec<u8>,
    ticks: u64,
    idle_ticks: u32,
    retry_ticks: u32,
    modem_state: u8,
    last_modem_state: u8,
    link_lost: bool,
    connect_count: u32,
    reconnect_count: u32,
    error_count: u32,
    last_error: Option<Error>,
    last_send_tick: u64,
}

impl Session {
    pub fn new(index: usize, cfg: PortConfig) -> Session {
        let server = cfg.role == Role::Server;
        Session {
            index,
            cfg,
            tcp_state: TcpState::Idle,
            parser: Parser::new(server),
            queue: Deque::new(),
            current: None,
            reply: Vec::new(),
            ticks: 0,
            idle_ticks: 0,
            retry_ticks: 0,
            modem_state: 0,
            last_modem_state: 0,
            link_lost: false,
            connect_count: 0,
            reconnect_count: 0,
            error_count: 0,
            last_error: None,
            last_send_tick: 0,
        }
    }

    pub fn config(&self) -> &PortConfig {
        &self.cfg
    }

    pub fn tcp_state(&self) -> TcpState {
        self.tcp_state
    }

    /// The listen port (server) or dialing source port (client).
    pub fn local_port(&self) -> u16 {
        self.cfg.local_port
    }

    /// The dialed port in client mode; 0 for a server.
    pub fn remote_port(&self) -> u16 {
        match self.cfg.role {
            Role::Server => 0,
            Role::Client => self.cfg.remote_port,
        }
    }

    pub fn diag(&self) -> SessionDiag {
        SessionDiag {
            tcp_state: self.tcp_state,
            connect_count: self.connect_count,
            reconnect_count: self.reconnect_count,
            error_count: self.error_count,
            last_error: self.last_error,
            link_lost: self.link_lost,
            last_send_tick: self.last_send_tick,
        }
    }

    fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.cfg.remote_addr, self.cfg.remote_port)
    }

    /// Reset all per-connection protocol state.
    fn init_protocol(&mut self) {
        self.parser.reset(self.cfg.role == Role::Server);
        self.free_pbufs();
        self.reply.clear();
        self.idle_ticks = 0;
        self.modem_state = 0;
        self.last_modem_state = 0;
        self.link_lost = false;
    }

    fn free_pbufs(&mut self) {
        self.current = None;
        while self.queue.pop_front().is_some() {}
    }

    /// Leave `Idle` according to the configured role. A client whose
    /// remote endpoint is not configured stays idle until reconfigured.
    pub fn start<S: TcpStack>(&mut self, stack: &mut S) -> Result<(), Error> {
        if self.cfg.validate().is_err() {
            net_debug!("port {}: invalid configuration, staying idle", self.index);
            return Ok(());
        }
        match self.cfg.role {
            Role::Server => {
                stack.listen(self.cfg.local_port)?;
                self.init_protocol();
                self.tcp_state = TcpState::Listen;
                net_trace!("port {}: listening on {}", self.index, self.cfg.local_port);
                Ok(())
            }
            Role::Client => {
                self.open(stack);
                Ok(())
            }
        }
    }

    /// Begin (or re-begin) a client connection attempt.
    fn open<S: TcpStack>(&mut self, stack: &mut S) {
        self.init_protocol();
        self.tcp_state = TcpState::Connecting;
        self.retry_ticks = 0;
        net_trace!("port {}: connecting to {}", self.index, self.remote());
        if let Err(err) = stack.connect(self.remote(), self.cfg.local_port) {
            self.last_error = Some(err);
        }
    }

    /// Return to rest after the connection went away: servers re-listen,
    /// clients redial.
    fn return_to_rest<S: TcpStack>(&mut self, stack: &mut S) {
        match self.cfg.role {
            Role::Server => {
                self.init_protocol();
                self.tcp_state = TcpState::Listen;
            }
            Role::Client => self.open(stack),
        }
    }

    /// The common setup once a connection exists: the UART returns to
    /// the persisted defaults, the idle clock restarts, and (under the
    /// telnet protocol) the initial option offer goes out.
    fn established<S: TcpStack, D: UartDevice>(
        &mut self,
        stack: &mut S,
        serial: &mut SerialPort<'_, D>,
    ) {
        self.tcp_state = TcpState::Connected;
        self.connect_count = self.connect_count.wrapping_add(1);
        self.link_lost = false;
        self.idle_ticks = 0;
        serial.set_defaults(&self.cfg);
        if self.cfg.protocol == Protocol::Telnet {
            if let Err(err) = stack.write(&INIT_OFFER) {
                self.last_error = Some(err);
            }
            stack.output();
        }
        net_trace!("port {}: connected", self.index);
    }

    /// React to a stack event.
    pub fn handle_event<S: TcpStack, D: UartDevice>(
        &mut self,
        event: Event,
        stack: &mut S,
        serial: &mut SerialPort<'_, D>,
    ) {
        match event {
            Event::Incoming => match self.tcp_state {
                TcpState::Listen => match stack.accept() {
                    Ok(()) => self.established(stack, serial),
                    Err(err) => self.last_error = Some(err),
                },
                TcpState::Connected if self.link_lost => {
                    // The old connection predates a link-down event and
                    // is unsalvageable; the new arrival replaces it.
                    net_debug!("port {}: link was lost, pre-empting", self.index);
                    self.link_lost = false;
                    stack.abort();
                    self.free_pbufs();
                    match stack.accept() {
                        Ok(()) => self.established(stack, serial),
                        Err(err) => self.last_error = Some(err),
                    }
                }
                _ => {
                    net_debug!("port {}: busy, refusing connection", self.index);
                    stack.refuse();
                }
            },

            Event::ConnectOk => {
                if self.tcp_state == TcpState::Connecting {
                    self.established(stack, serial);
                } else {
                    stack.abort();
                }
            }

            Event::Received(chain) => {
                if self.tcp_state != TcpState::Connected {
                    return;
                }
                if self.queue.push_back(chain).is_err() {
                    // Queue full: the chain is dropped *without* being
                    // acknowledged, so the peer will retransmit it once
                    // the window reopens.
                    net_debug!("port {}: inbound queue full, dropping", self.index);
                }
            }

            Event::Sent(_len) => {
                self.idle_ticks = 0;
            }

            Event::PeerClosed => {
                net_trace!("port {}: peer closed", self.index);
                stack.close();
                self.free_pbufs();
                self.return_to_rest(stack);
            }

            Event::Error(err) => {
                net_debug!("port {}: tcp error: {}", self.index, err);
                self.error_count = self.error_count.wrapping_add(1);
                self.last_error = Some(err);
                self.free_pbufs();
                self.return_to_rest(stack);
            }
        }
    }

    /// Record a modem-state change reported by the serial controller.
    /// Under the raw protocol there is nobody to notify.
    pub fn note_modem_state(&mut self, state: u8) {
        if self.cfg.protocol == Protocol::Raw {
            return;
        }
        self.modem_state = state;
    }

    /// Flag that the physical link dropped underneath this session.
    pub fn notify_link_lost(&mut self) {
        self.link_lost = true;
    }

    /// The periodic tick: retries client connects, enforces the idle
    /// timeout, emits modem-state notifications, and runs both data
    /// paths.
    pub fn poll<S: TcpStack, D: UartDevice>(
        &mut self,
        stack: &mut S,
        serial: &mut SerialPort<'_, D>,
    ) {
        self.ticks += 1;
        match self.tcp_state {
            TcpState::Connecting => {
                self.retry_ticks += 1;
                if self.retry_ticks >= CONNECT_RETRY_TICKS {
                    // No completion callback within the retry window;
                    // issue a fresh attempt.
                    self.retry_ticks = 0;
                    self.reconnect_count = self.reconnect_count.wrapping_add(1);
                    net_trace!("port {}: retrying connect", self.index);
                    if let Err(err) = stack.connect(self.remote(), self.cfg.local_port) {
                        self.last_error = Some(err);
                    }
                }
            }
            TcpState::Connected => self.poll_connected(stack, serial),
            TcpState::Idle | TcpState::Listen => {}
        }
    }

    fn poll_connected<S: TcpStack, D: UartDevice>(
        &mut self,
        stack: &mut S,
        serial: &mut SerialPort<'_, D>,
    ) {
        // Idle timeout, servers only. Client connections live until one
        // side closes.
        if self.cfg.role == Role::Server && self.cfg.idle_timeout_secs != 0 {
            self.idle_ticks += 1;
            let idle_ms = self.idle_ticks as u64 * TICK_MS as u64;
            if idle_ms >= self.cfg.idle_timeout_secs as u64 * 1000 {
                net_debug!("port {}: idle timeout, aborting", self.index);
                stack.abort();
                self.error_count = self.error_count.wrapping_add(1);
                self.last_error = Some(Error::Aborted);
                self.free_pbufs();
                self.init_protocol();
                self.tcp_state = TcpState::Listen;
                return;
            }
        }

        // Modem-state notification. The comparison value latches even
        // when nothing can be sent, so a change seen before negotiation
        // completes is not replayed afterwards.
        if self.last_modem_state != self.modem_state {
            self.last_modem_state = self.modem_state;
            if self.cfg.protocol == Protocol::Telnet && self.parser.rfc2217_active() {
                let masked = self.modem_state & self.parser.modem_mask();
                if masked != 0 {
                    comport::emit_reply(&mut self.reply, comport::NOTIFY_MODEMSTATE, &[masked]);
                }
            }
        }

        // TCP to UART: feed the parser one byte at a time while the TX
        // ring can take more. A chain is acknowledged and released only
        // once its last byte is consumed.
        while !serial.send_full() {
            let (chain, mut cursor) = match self.current.take() {
                Some(in_progress) => in_progress,
                None => match self.queue.pop_front() {
                    Some(chain) => (chain, ChainCursor::new()),
                    None => break,
                },
            };
            if let Some(byte) = cursor.next(&chain) {
                match self.cfg.protocol {
                    Protocol::Raw => serial.send(byte),
                    Protocol::Telnet => self.parser.process(byte, serial, &mut self.reply),
                }
            }
            if cursor.is_done(&chain) {
                stack.recved(chain.tot_len());
            } else {
                self.current = Some((chain, cursor));
            }
        }

        // Negotiation replies go out with this flush, before any payload
        // drained below.
        if !self.reply.is_empty() {
            match stack.write(&self.reply) {
                Ok(written) => {
                    self.reply.drain(..written);
                }
                Err(err) => self.last_error = Some(err),
            }
        }
        stack.output();

        // The peer asked for a breather.
        if self.parser.suspended() {
            return;
        }

        // UART to TCP: drain what both the RX ring and the send buffer
        // can sustain, in staging-buffer chunks, guarded by the stack's
        // outstanding-segment limit.
        let mut count = serial.recv_avail().min(stack.send_buffer());
        if count > 0 && !stack.send_queue_full() {
            let mut staged = [0u8; STAGING_LEN];
            while count > 0 && !stack.send_queue_full() {
                let mut len = 0;
                while count > 0 && len < STAGING_LEN {
                    match serial.recv() {
                        Some(byte) => {
                            staged[len] = byte;
                            len += 1;
                            count -= 1;
                        }
                        None => count = 0,
                    }
                }
                if len == 0 {
                    break;
                }
                match stack.write(&staged[..len]) {
                    Ok(_) => {}
                    Err(err) => {
                        self.last_error = Some(err);
                        count = 0;
                    }
                }
            }
            stack.output();
            self.last_send_tick = self.ticks;
        }
    }

    /// Tear the session down to `Idle`: abort the connection, stop the
    /// listener, release every queued chain.
    pub fn close<S: TcpStack>(&mut self, stack: &mut S) {
        net_trace!("port {}: closing", self.index);
        stack.abort();
        stack.close_listener();
        self.free_pbufs();
        self.init_protocol();
        self.tcp_state = TcpState::Idle;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::uart::SimUart;
    use crate::wire::telnet::{DO, IAC, SB, SE, WILL};
    use std::net::Ipv4Addr;

    /// A scripted stack: the tests deliver events by hand and inspect
    /// the command trail the session leaves behind.
    #[derive(Debug)]
    struct TestStack {
        listening: Option<u16>,
        connect_calls: Vec<(SocketAddrV4, u16)>,
        connect_result: Result<(), Error>,
        written: Vec<u8>,
        outputs: usize,
        recved: Vec<usize>,
        accepts: usize,
        refusals: usize,
        aborts: usize,
        closes: usize,
        listener_closes: usize,
        sndbuf: usize,
        queue_full: bool,
    }

    impl Default for TestStack {
        fn default() -> TestStack {
            TestStack {
                listening: None,
                connect_calls: Vec::new(),
                connect_result: Ok(()),
                written: Vec::new(),
                outputs: 0,
                recved: Vec::new(),
                accepts: 0,
                refusals: 0,
                aborts: 0,
                closes: 0,
                listener_closes: 0,
                sndbuf: 2048,
                queue_full: false,
            }
        }
    }

    impl TcpStack for TestStack {
        fn listen(&mut self, local_port: u16) -> Result<(), Error> {
            self.listening = Some(local_port);
            Ok(())
        }
        fn connect(&mut self, remote: SocketAddrV4, local_port: u16) -> Result<(), Error> {
            self.connect_calls.push((remote, local_port));
            self.connect_result
        }
        fn accept(&mut self) -> Result<(), Error> {
            self.accepts += 1;
            Ok(())
        }
        fn refuse(&mut self) {
            self.refusals += 1;
        }
        fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
            let accepted = data.len().min(self.sndbuf);
            self.written.extend_from_slice(&data[..accepted]);
            Ok(accepted)
        }
        fn output(&mut self) {
            self.outputs += 1;
        }
        fn recved(&mut self, len: usize) {
            self.recved.push(len);
        }
        fn send_buffer(&self) -> usize {
            self.sndbuf
        }
        fn send_queue_full(&self) -> bool {
            self.queue_full
        }
        fn abort(&mut self) {
            self.aborts += 1;
        }
        fn close(&mut self) {
            self.closes += 1;
        }
        fn close_listener(&mut self) {
            self.listener_closes += 1;
        }
        fn poll_events(&mut self, _events: &mut Vec<Event>) {}
    }

    fn server_config(protocol: Protocol) -> PortConfig {
        PortConfig {
            protocol,
            ..PortConfig::factory(0)
        }
    }

    fn client_config() -> PortConfig {
        PortConfig {
            role: Role::Client,
            remote_addr: Ipv4Addr::new(10, 0, 0, 99),
            remote_port: 9999,
            local_port: 23,
            ..PortConfig::factory(0)
        }
    }

    fn setup<'a>(
        cfg: PortConfig,
    ) -> (Session, TestStack, SerialPort<'a, SimUart>) {
        let session = Session::new(0, cfg);
        let stack = TestStack::default();
        let serial = SerialPort::new(SimUart::new());
        (session, stack, serial)
    }

    fn establish<'a>(
        cfg: PortConfig,
    ) -> (Session, TestStack, SerialPort<'a, SimUart>) {
        let (mut session, mut stack, mut serial) = setup(cfg);
        session.start(&mut stack).unwrap();
        session.handle_event(Event::Incoming, &mut stack, &mut serial);
        assert_eq!(session.tcp_state(), TcpState::Connected);
        stack.written.clear();
        (session, stack, serial)
    }

    /// Negotiate COM-PORT in both directions (the peer's WILL is
    /// implied by the initial offer).
    fn negotiate(
        session: &mut Session,
        stack: &mut TestStack,
        serial: &mut SerialPort<'_, SimUart>,
    ) {
        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[IAC, DO, 44, IAC, DO, 3])),
            stack,
            serial,
        );
        session.poll(stack, serial);
        stack.written.clear();
        stack.recved.clear();
    }

    /// Everything the UART transmits once the TX ring fully drains.
    fn uart_output(serial: &mut SerialPort<'_, SimUart>) -> Vec<u8> {
        let mut out = serial.device_mut().drain_line();
        loop {
            serial.tx_pump();
            let chunk = serial.device_mut().drain_line();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        out
    }

    #[test]
    fn test_server_starts_listening() {
        let (mut session, mut stack, _serial) = setup(server_config(Protocol::Telnet));
        session.start(&mut stack).unwrap();
        assert_eq!(stack.listening, Some(23));
        assert_eq!(session.tcp_state(), TcpState::Listen);
        assert_eq!(session.local_port(), 23);
        assert_eq!(session.remote_port(), 0);
    }

    #[test]
    fn test_accept_sends_initial_offer() {
        let (mut session, mut stack, mut serial) = setup(server_config(Protocol::Telnet));
        session.start(&mut stack).unwrap();
        session.handle_event(Event::Incoming, &mut stack, &mut serial);
        assert_eq!(stack.accepts, 1);
        assert_eq!(session.tcp_state(), TcpState::Connected);
        assert_eq!(stack.written, INIT_OFFER);
        assert_eq!(session.diag().connect_count, 1);
    }

    #[test]
    fn test_raw_accept_sends_nothing() {
        let (mut session, mut stack, mut serial) = setup(server_config(Protocol::Raw));
        session.start(&mut stack).unwrap();
        session.handle_event(Event::Incoming, &mut stack, &mut serial);
        assert_eq!(session.tcp_state(), TcpState::Connected);
        assert!(stack.written.is_empty());
    }

    #[test]
    fn test_raw_tcp_to_uart_transparency() {
        let (mut session, mut stack, mut serial) = establish(server_config(Protocol::Raw));
        let payload = [0x01, 0x02, 0x03, 0xff, 0x04];
        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&payload)),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        assert_eq!(uart_output(&mut serial), payload);
        assert_eq!(stack.recved, [5]);
    }

    #[test]
    fn test_raw_uart_to_tcp_transparency() {
        let (mut session, mut stack, mut serial) = establish(server_config(Protocol::Raw));
        serial.device_mut().feed_rx(&[0x01, 0x02, 0x03, 0xff, 0x04]);
        serial.rx_pump();
        session.poll(&mut stack, &mut serial);
        assert_eq!(stack.written, [0x01, 0x02, 0x03, 0xff, 0x04]);
    }

    #[test]
    fn test_telnet_iac_unescaped_towards_uart() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[0x01, IAC, IAC, 0x02])),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        assert_eq!(uart_output(&mut serial), [0x01, IAC, 0x02]);
        assert_eq!(stack.recved, [4]);
    }

    #[test]
    fn test_telnet_iac_doubled_towards_tcp() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        serial.device_mut().feed_rx(&[0xaa, 0xff, 0xbb]);
        serial.rx_pump();
        session.poll(&mut stack, &mut serial);
        assert_eq!(stack.written, [0xaa, 0xff, 0xff, 0xbb]);
    }

    #[test]
    fn test_raw_random_transparency() {
        use rand::Rng;

        let (mut session, mut stack, mut serial) = establish(server_config(Protocol::Raw));
        let mut rng = rand::thread_rng();
        let payload: Vec<u8> = (0..1024).map(|_| rng.gen()).collect();

        for chunk in payload.chunks(64) {
            session.handle_event(
                Event::Received(PacketBuffer::from_slice(chunk)),
                &mut stack,
                &mut serial,
            );
        }
        session.poll(&mut stack, &mut serial);
        assert_eq!(uart_output(&mut serial), payload);
        assert_eq!(stack.recved.iter().sum::<usize>(), payload.len());
    }

    #[test]
    fn test_telnet_random_escaping_round_trip() {
        use rand::Rng;

        // Whatever the UART of one bridge emits over TCP, the telnet
        // parser of a peer bridge must reduce back to the original
        // bytes, IAC runs included.
        let (mut session_a, mut stack_a, mut serial_a) =
            establish(server_config(Protocol::Telnet));
        let (mut session_b, mut stack_b, mut serial_b) =
            establish(server_config(Protocol::Telnet));

        let mut rng = rand::thread_rng();
        let mut payload: Vec<u8> = (0..200).map(|_| rng.gen()).collect();
        // Force a few IAC runs into the mix.
        payload.extend_from_slice(&[IAC, IAC, 0x00, IAC]);

        serial_a.device_mut().feed_rx(&payload);
        serial_a.rx_pump();
        session_a.poll(&mut stack_a, &mut serial_a);

        // The escaped stream carries one doubling per payload IAC.
        let escaped = stack_a.written.clone();
        let iac_count = payload.iter().filter(|&&b| b == IAC).count();
        assert_eq!(escaped.len(), payload.len() + iac_count);

        for chunk in escaped.chunks(64) {
            session_b.handle_event(
                Event::Received(PacketBuffer::from_slice(chunk)),
                &mut stack_b,
                &mut serial_b,
            );
        }
        session_b.poll(&mut stack_b, &mut serial_b);
        assert_eq!(uart_output(&mut serial_b), payload);
    }

    #[test]
    fn test_chain_spanning_segments() {
        let (mut session, mut stack, mut serial) = establish(server_config(Protocol::Raw));
        let chain = PacketBuffer::from_segments(vec![vec![1, 2], vec![3], vec![4, 5]]);
        session.handle_event(Event::Received(chain), &mut stack, &mut serial);
        session.poll(&mut stack, &mut serial);
        assert_eq!(uart_output(&mut serial), [1, 2, 3, 4, 5]);
        // One acknowledgement for the whole chain.
        assert_eq!(stack.recved, [5]);
    }

    #[test]
    fn test_rfc2217_set_baudrate_end_to_end() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        negotiate(&mut session, &mut stack, &mut serial);

        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[
                IAC, SB, 44, 1, 0x00, 0x00, 0xe1, 0x00, IAC, SE,
            ])),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        assert_eq!(serial.baud_rate(), 57_600);
        assert_eq!(
            stack.written,
            [IAC, SB, 44, 101, 0x00, 0x00, 0xe1, 0x00, IAC, SE]
        );
    }

    #[test]
    fn test_rfc2217_purge_end_to_end() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        negotiate(&mut session, &mut stack, &mut serial);

        // Pre-load the RX ring; the purge must empty it before the
        // drain leg can forward any of it.
        let preload: Vec<u8> = (0x01..=0x10).collect();
        serial.device_mut().feed_rx(&preload);
        serial.rx_pump();

        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[IAC, SB, 44, 12, 3, IAC, SE])),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        assert_eq!(serial.recv_avail(), 0);
        assert_eq!(stack.written, [IAC, SB, 44, 112, 3, IAC, SE]);
    }

    #[test]
    fn test_suspend_pauses_uart_to_tcp() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        negotiate(&mut session, &mut stack, &mut serial);

        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[IAC, SB, 44, 8, IAC, SE])),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        stack.written.clear();

        serial.device_mut().feed_rx(&[0x41, 0x42]);
        serial.rx_pump();
        session.poll(&mut stack, &mut serial);
        assert!(stack.written.is_empty());

        // RESUME releases the data.
        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[IAC, SB, 44, 9, IAC, SE])),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        assert!(stack.written.ends_with(&[0x41, 0x42]));
    }

    #[test]
    fn test_modem_state_notification() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        negotiate(&mut session, &mut stack, &mut serial);

        // Nothing is reported while the mask is zero.
        session.note_modem_state(0x11);
        session.poll(&mut stack, &mut serial);
        assert!(stack.written.is_empty());

        // Select CTS + delta-CTS, then change state again.
        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[IAC, SB, 44, 11, 0x11, IAC, SE])),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        stack.written.clear();

        session.note_modem_state(0x01);
        session.poll(&mut stack, &mut serial);
        assert_eq!(stack.written, [IAC, SB, 44, 107, 0x01, IAC, SE]);
        stack.written.clear();

        // No repeat while the state holds.
        session.poll(&mut stack, &mut serial);
        assert!(stack.written.is_empty());
    }

    #[test]
    fn test_backpressure_unacked_drop() {
        let (mut session, mut stack, mut serial) = establish(server_config(Protocol::Raw));
        for n in 0..(PBUF_QUEUE_LEN + 1) {
            session.handle_event(
                Event::Received(PacketBuffer::from_slice(&[n as u8; 4])),
                &mut stack,
                &mut serial,
            );
        }
        // Nothing acknowledged yet; the overflowing chain is gone.
        assert!(stack.recved.is_empty());
        session.poll(&mut stack, &mut serial);
        assert_eq!(stack.recved.len(), PBUF_QUEUE_LEN);
        assert_eq!(uart_output(&mut serial).len(), PBUF_QUEUE_LEN * 4);
    }

    #[test]
    fn test_idle_timeout_aborts_server() {
        let cfg = PortConfig {
            idle_timeout_secs: 5,
            ..server_config(Protocol::Telnet)
        };
        let (mut session, mut stack, mut serial) = establish(cfg);

        // 5 s at 500 ms per tick = 10 ticks.
        for _ in 0..9 {
            session.poll(&mut stack, &mut serial);
        }
        assert_eq!(session.tcp_state(), TcpState::Connected);
        session.poll(&mut stack, &mut serial);
        assert_eq!(stack.aborts, 1);
        assert_eq!(session.tcp_state(), TcpState::Listen);
    }

    #[test]
    fn test_sent_ack_resets_idle_clock() {
        let cfg = PortConfig {
            idle_timeout_secs: 5,
            ..server_config(Protocol::Telnet)
        };
        let (mut session, mut stack, mut serial) = establish(cfg);
        for _ in 0..8 {
            session.poll(&mut stack, &mut serial);
        }
        session.handle_event(Event::Sent(4), &mut stack, &mut serial);
        for _ in 0..9 {
            session.poll(&mut stack, &mut serial);
        }
        assert_eq!(session.tcp_state(), TcpState::Connected);
        assert_eq!(stack.aborts, 0);
    }

    #[test]
    fn test_idle_timeout_disabled_at_zero() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        for _ in 0..100 {
            session.poll(&mut stack, &mut serial);
        }
        assert_eq!(session.tcp_state(), TcpState::Connected);
        assert_eq!(stack.aborts, 0);
    }

    #[test]
    fn test_client_connects_and_retries() {
        let (mut session, mut stack, mut serial) = setup(client_config());
        session.start(&mut stack).unwrap();
        assert_eq!(session.tcp_state(), TcpState::Connecting);
        assert_eq!(stack.connect_calls.len(), 1);
        let (remote, local) = stack.connect_calls[0];
        assert_eq!(remote, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 9999));
        assert_eq!(local, 23);

        // ~3 seconds per retry.
        for _ in 0..6 {
            session.poll(&mut stack, &mut serial);
        }
        assert_eq!(stack.connect_calls.len(), 2);
        for _ in 0..6 {
            session.poll(&mut stack, &mut serial);
        }
        assert_eq!(stack.connect_calls.len(), 3);
        assert_eq!(session.diag().reconnect_count, 2);

        session.handle_event(Event::ConnectOk, &mut stack, &mut serial);
        assert_eq!(session.tcp_state(), TcpState::Connected);
        assert_eq!(stack.written, INIT_OFFER);

        // Connected clients stop retrying.
        for _ in 0..12 {
            session.poll(&mut stack, &mut serial);
        }
        assert_eq!(stack.connect_calls.len(), 3);
    }

    #[test]
    fn test_client_reenters_connecting_on_error() {
        let (mut session, mut stack, mut serial) = setup(client_config());
        session.start(&mut stack).unwrap();
        session.handle_event(Event::ConnectOk, &mut stack, &mut serial);
        assert_eq!(session.tcp_state(), TcpState::Connected);

        session.handle_event(Event::Error(Error::Reset), &mut stack, &mut serial);
        assert_eq!(session.tcp_state(), TcpState::Connecting);
        assert_eq!(stack.connect_calls.len(), 2);
        let diag = session.diag();
        assert_eq!(diag.error_count, 1);
        assert_eq!(diag.last_error, Some(Error::Reset));
    }

    #[test]
    fn test_client_redials_on_peer_close() {
        let (mut session, mut stack, mut serial) = setup(client_config());
        session.start(&mut stack).unwrap();
        session.handle_event(Event::ConnectOk, &mut stack, &mut serial);
        session.handle_event(Event::PeerClosed, &mut stack, &mut serial);
        assert_eq!(stack.closes, 1);
        assert_eq!(session.tcp_state(), TcpState::Connecting);
        assert_eq!(stack.connect_calls.len(), 2);
    }

    #[test]
    fn test_server_relists_on_peer_close_with_fresh_negotiation() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        negotiate(&mut session, &mut stack, &mut serial);

        session.handle_event(Event::PeerClosed, &mut stack, &mut serial);
        assert_eq!(session.tcp_state(), TcpState::Listen);

        // The next connection negotiates from scratch: DO 44 draws a
        // fresh WILL 44.
        session.handle_event(Event::Incoming, &mut stack, &mut serial);
        stack.written.clear();
        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[IAC, DO, 44])),
            &mut stack,
            &mut serial,
        );
        session.poll(&mut stack, &mut serial);
        assert_eq!(stack.written, [IAC, WILL, 44]);
    }

    #[test]
    fn test_second_accept_refused_while_link_alive() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        session.handle_event(Event::Incoming, &mut stack, &mut serial);
        assert_eq!(stack.refusals, 1);
        assert_eq!(stack.aborts, 0);
        assert_eq!(session.tcp_state(), TcpState::Connected);
    }

    #[test]
    fn test_link_loss_preempts_stale_connection() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        session.notify_link_lost();
        assert!(session.diag().link_lost);

        session.handle_event(Event::Incoming, &mut stack, &mut serial);
        assert_eq!(stack.aborts, 1);
        assert_eq!(stack.accepts, 2);
        assert_eq!(session.tcp_state(), TcpState::Connected);
        assert!(!session.diag().link_lost);
    }

    #[test]
    fn test_send_queue_guard_pauses_drain() {
        let (mut session, mut stack, mut serial) = establish(server_config(Protocol::Raw));
        stack.queue_full = true;
        serial.device_mut().feed_rx(&[1, 2, 3]);
        serial.rx_pump();
        session.poll(&mut stack, &mut serial);
        assert!(stack.written.is_empty());

        stack.queue_full = false;
        session.poll(&mut stack, &mut serial);
        assert_eq!(stack.written, [1, 2, 3]);
    }

    #[test]
    fn test_close_returns_to_idle() {
        let (mut session, mut stack, mut serial) =
            establish(server_config(Protocol::Telnet));
        session.handle_event(
            Event::Received(PacketBuffer::from_slice(&[0x41])),
            &mut stack,
            &mut serial,
        );
        session.close(&mut stack);
        assert_eq!(session.tcp_state(), TcpState::Idle);
        assert_eq!(stack.aborts, 1);
        assert_eq!(stack.listener_closes, 1);
        // Queued data was released, never acknowledged.
        assert!(stack.recved.is_empty());
    }

    #[test]
    fn test_invalid_client_config_stays_idle() {
        let cfg = PortConfig {
            role: Role::Client,
            ..PortConfig::factory(0)
        };
        let (mut session, mut stack, _serial) = setup(cfg);
        session.start(&mut stack).unwrap();
        assert_eq!(session.tcp_state(), TcpState::Idle);
        assert!(stack.connect_calls.is_empty());
    }

    #[test]
    fn test_diag_display() {
        let (session, _stack, _serial) = setup(server_config(Protocol::Telnet));
        let text = session.diag().to_string();
        assert!(text.contains("state=IDLE"));
        assert!(text.contains("connects=0"));
    }
}
