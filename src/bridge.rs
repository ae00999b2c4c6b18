//! The top level: both bridged ports and the periodic handler that
//! advances them.
//!
//! A [`Bridge`] owns the per-port (serial controller, session) pairs;
//! the TCP stack objects stay with the caller and are passed into each
//! call, so the same bridge drives kernel sockets in production and
//! scripted stacks in tests. The driver loop is expected to call
//! [`Bridge::pump_events`] as often as it likes (whenever a socket is
//! readable) and [`Bridge::poll`] once per tick.

use crate::config::{PortConfig, Protocol};
use crate::phy::{Error, Event, TcpStack};
use crate::session::{Session, SessionDiag};
use crate::uart::{SerialPort, UartDevice};

/// One bridged port: the serial controller and its session engine.
#[derive(Debug)]
pub struct Port<'a, D> {
    serial: SerialPort<'a, D>,
    session: Session,
}

impl<'a, D: UartDevice> Port<'a, D> {
    pub fn serial(&self) -> &SerialPort<'a, D> {
        &self.serial
    }

    pub fn serial_mut(&mut self) -> &mut SerialPort<'a, D> {
        &mut self.serial
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

/// The serial-to-Ethernet bridge.
#[derive(Debug)]
pub struct Bridge<'a, D> {
    ports: Vec<Port<'a, D>>,
    events: Vec<Event>,
}

impl<'a, D: UartDevice> Bridge<'a, D> {
    /// Build a bridge from per-port configurations and UART devices.
    /// Configurations are sanitized; the serial side is programmed with
    /// its defaults immediately so the UART is usable before the first
    /// connection.
    pub fn new(configs: Vec<PortConfig>, devices: Vec<D>) -> Bridge<'a, D> {
        assert_eq!(configs.len(), devices.len());
        let ports = configs
            .into_iter()
            .zip(devices)
            .enumerate()
            .map(|(index, (mut cfg, dev))| {
                cfg.sanitize();
                let mut serial = SerialPort::new(dev);
                serial.set_defaults(&cfg);
                Port {
                    serial,
                    session: Session::new(index, cfg),
                }
            })
            .collect();
        Bridge {
            ports,
            events: Vec::new(),
        }
    }

    pub fn num_ports(&self) -> usize {
        self.ports.len()
    }

    pub fn port(&self, index: usize) -> &Port<'a, D> {
        &self.ports[index]
    }

    pub fn port_mut(&mut self, index: usize) -> &mut Port<'a, D> {
        &mut self.ports[index]
    }

    /// Move every session out of `Idle` per its configured role.
    pub fn start<S: TcpStack>(&mut self, stacks: &mut [S]) -> Result<(), Error> {
        for (port, stack) in self.ports.iter_mut().zip(stacks.iter_mut()) {
            port.session.start(stack)?;
        }
        Ok(())
    }

    /// Service the UART FIFOs and dispatch pending stack events. Cheap
    /// enough to run whenever a socket wakes the driver loop.
    pub fn pump_events<S: TcpStack>(&mut self, stacks: &mut [S]) {
        for (port, stack) in self.ports.iter_mut().zip(stacks.iter_mut()) {
            port.serial.rx_pump();
            let mut events = std::mem::take(&mut self.events);
            stack.poll_events(&mut events);
            for event in events.drain(..) {
                port.session.handle_event(event, stack, &mut port.serial);
            }
            self.events = events;
            port.serial.tx_pump();
        }
    }

    /// The periodic tick: pump, then advance every session engine.
    pub fn poll<S: TcpStack>(&mut self, stacks: &mut [S]) {
        self.pump_events(stacks);
        for (port, stack) in self.ports.iter_mut().zip(stacks.iter_mut()) {
            port.session.poll(stack, &mut port.serial);
            port.serial.tx_pump();
        }
    }

    /// Forward an inbound flow-control edge on `index` to its session.
    pub fn flow_in_changed(&mut self, index: usize) {
        let port = &mut self.ports[index];
        if let Some(state) = port.serial.flow_in_changed() {
            port.session.note_modem_state(state);
        }
    }

    /// Physical-link status notification. Going down marks every
    /// session's connection as stale; coming back up needs no action.
    pub fn notify_link_status(&mut self, up: bool) {
        if up {
            return;
        }
        net_debug!("bridge: link lost");
        for port in &mut self.ports {
            port.session.notify_link_lost();
        }
    }

    /// Re-apply a new configuration to one port: tear the session down,
    /// reprogram the UART (writing the hardware-accepted values back
    /// into the configuration), and restart per the new role.
    pub fn reconfigure<S: TcpStack>(
        &mut self,
        index: usize,
        mut cfg: PortConfig,
        stack: &mut S,
    ) -> Result<(), Error> {
        cfg.sanitize();
        let port = &mut self.ports[index];
        port.session.close(stack);
        port.serial.apply_current(&mut cfg);
        port.session = Session::new(index, cfg);
        port.session.start(stack)
    }

    /// Close one port's session.
    pub fn close<S: TcpStack>(&mut self, index: usize, stack: &mut S) {
        self.ports[index].session.close(stack);
    }

    /// Close every port; used at process shutdown.
    pub fn shutdown<S: TcpStack>(&mut self, stacks: &mut [S]) {
        for (port, stack) in self.ports.iter_mut().zip(stacks.iter_mut()) {
            port.session.close(stack);
        }
    }

    pub fn diag(&self, index: usize) -> SessionDiag {
        self.ports[index].session.diag()
    }

    /// Whether the port runs the telnet protocol (used by driver loops
    /// that surface diagnostics).
    pub fn protocol(&self, index: usize) -> Protocol {
        self.ports[index].session.config().protocol
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Role;
    use crate::phy::Error;
    use crate::session::TcpState;
    use crate::uart::SimUart;
    use std::net::SocketAddrV4;

    /// Minimal scripted stack for bridge-level wiring tests.
    #[derive(Debug, Default)]
    struct NullStack {
        listening: Option<u16>,
        queued: Vec<Event>,
        aborts: usize,
    }

    impl TcpStack for NullStack {
        fn listen(&mut self, local_port: u16) -> Result<(), Error> {
            self.listening = Some(local_port);
            Ok(())
        }
        fn connect(&mut self, _remote: SocketAddrV4, _local_port: u16) -> Result<(), Error> {
            Ok(())
        }
        fn accept(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn refuse(&mut self) {}
        fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
            Ok(data.len())
        }
        fn output(&mut self) {}
        fn recved(&mut self, _len: usize) {}
        fn send_buffer(&self) -> usize {
            2048
        }
        fn send_queue_full(&self) -> bool {
            false
        }
        fn abort(&mut self) {
            self.aborts += 1;
        }
        fn close(&mut self) {}
        fn close_listener(&mut self) {}
        fn poll_events(&mut self, events: &mut Vec<Event>) {
            events.append(&mut self.queued);
        }
    }

    fn two_port_bridge<'a>() -> (Bridge<'a, SimUart>, Vec<NullStack>) {
        let configs = vec![PortConfig::factory(0), PortConfig::factory(1)];
        let devices = vec![SimUart::new(), SimUart::new()];
        let bridge = Bridge::new(configs, devices);
        let stacks = vec![NullStack::default(), NullStack::default()];
        (bridge, stacks)
    }

    #[test]
    fn test_start_listens_on_both_ports() {
        let (mut bridge, mut stacks) = two_port_bridge();
        bridge.start(&mut stacks).unwrap();
        assert_eq!(stacks[0].listening, Some(23));
        assert_eq!(stacks[1].listening, Some(26));
        assert_eq!(bridge.diag(0).tcp_state, TcpState::Listen);
        assert_eq!(bridge.diag(1).tcp_state, TcpState::Listen);
    }

    #[test]
    fn test_pump_dispatches_queued_events() {
        let (mut bridge, mut stacks) = two_port_bridge();
        bridge.start(&mut stacks).unwrap();
        stacks[0].queued.push(Event::Incoming);
        bridge.pump_events(&mut stacks);
        assert_eq!(bridge.diag(0).tcp_state, TcpState::Connected);
        assert_eq!(bridge.diag(1).tcp_state, TcpState::Listen);
    }

    #[test]
    fn test_link_loss_flags_every_session() {
        let (mut bridge, mut stacks) = two_port_bridge();
        bridge.start(&mut stacks).unwrap();
        bridge.notify_link_status(false);
        assert!(bridge.diag(0).link_lost);
        assert!(bridge.diag(1).link_lost);
        bridge.notify_link_status(true);
        // Coming back up does not clear the flag; the next accept does.
        assert!(bridge.diag(0).link_lost);
    }

    #[test]
    fn test_reconfigure_applies_clamped_values() {
        let (mut bridge, mut stacks) = two_port_bridge();
        bridge.start(&mut stacks).unwrap();

        let cfg = PortConfig {
            data_bits: 11,
            role: Role::Server,
            local_port: 2300,
            ..PortConfig::factory(0)
        };
        bridge.reconfigure(0, cfg, &mut stacks[0]).unwrap();
        assert_eq!(stacks[0].listening, Some(2300));
        assert_eq!(bridge.port(0).serial().data_bits(), 8);
        assert_eq!(bridge.port(0).session().config().data_bits, 8);
    }

    #[test]
    fn test_shutdown_idles_everything() {
        let (mut bridge, mut stacks) = two_port_bridge();
        bridge.start(&mut stacks).unwrap();
        stacks[0].queued.push(Event::Incoming);
        bridge.pump_events(&mut stacks);
        bridge.shutdown(&mut stacks);
        assert_eq!(bridge.diag(0).tcp_state, TcpState::Idle);
        assert_eq!(bridge.diag(1).tcp_state, TcpState::Idle);
        assert!(stacks[0].aborts > 0);
    }

    #[test]
    fn test_flow_in_edge_reaches_session() {
        use crate::wire::comport::FlowControl;

        let configs = vec![PortConfig {
            flow_control: FlowControl::Hardware,
            ..PortConfig::factory(0)
        }];
        let mut bridge = Bridge::new(configs, vec![SimUart::new()]);
        let mut stacks = vec![NullStack::default()];
        bridge.start(&mut stacks).unwrap();

        bridge.port_mut(0).serial_mut().device_mut().set_flow_in(true);
        bridge.flow_in_changed(0);
        // The edge lands as a pending modem state; its observable effect
        // (the notification) is covered by the session tests.
        assert!(!bridge.port(0).serial().device().tx_enabled());
    }
}
