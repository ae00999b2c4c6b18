use crate::config::{PortConfig, Protocol};
use crate::storage::RingBuffer;
use crate::uart::{LineConfig, UartDevice};
use crate::wire::comport::{
    FlowControl, FlowOut, Parity, PurgeSelect, MODEM_CTS, MODEM_DELTA_CTS,
};
use crate::wire::telnet::IAC;

/// Capacity of the receive ring (UART towards TCP).
pub const RX_RING_LEN: usize = 512;

/// Capacity of the transmit ring (TCP towards UART). Sized larger than
/// the RX ring because the TCP side can burst a full send buffer at once.
pub const TX_RING_LEN: usize = 1536;

/// The controller for one serial port.
///
/// Owns the device and the two ring buffers, and implements the policy
/// layered on top of raw register access:
///
/// - every line-parameter setter stops the UART, reprograms it, and
///   re-enables the transmitter only if the inbound flow-control line
///   allows it; out-of-range requests are clamped, and the getters
///   report what the hardware actually runs;
/// - with hardware flow control, the outbound line asserts once the RX
///   ring reaches 3/4 fill and releases once it drains below 1/4, unless
///   an explicit [`FlowOut::Set`] latch holds it;
/// - an inbound flow-control edge gates the transmitter and yields the
///   modem-state byte reported to the telnet session;
/// - with the telnet protocol active, a `0xFF` arriving on the wire is
///   doubled as it enters the RX ring, so the TCP side can forward the
///   ring contents without re-scanning them.
#[derive(Debug)]
pub struct SerialPort<'a, D> {
    dev: D,
    rx: RingBuffer<'a>,
    tx: RingBuffer<'a>,
    /// Requested (clamped) line parameters; the device may round further.
    config: LineConfig,
    flow_control: FlowControl,
    flow_out_latched: bool,
    protocol: Protocol,
}

impl<'a, D: UartDevice> SerialPort<'a, D> {
    /// Create a controller with the default ring capacities.
    pub fn new(dev: D) -> SerialPort<'a, D> {
        SerialPort::with_buffers(dev, vec![0; RX_RING_LEN], vec![0; TX_RING_LEN])
    }

    /// Create a controller with caller-provided ring storage.
    pub fn with_buffers<S>(dev: D, rx_storage: S, tx_storage: S) -> SerialPort<'a, D>
    where
        S: Into<managed::ManagedSlice<'a, u8>>,
    {
        let config = dev.line_config();
        SerialPort {
            dev,
            rx: RingBuffer::new(rx_storage),
            tx: RingBuffer::new(tx_storage),
            config,
            flow_control: FlowControl::None,
            flow_out_latched: false,
            protocol: Protocol::Telnet,
        }
    }

    /// Access the underlying device.
    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    fn reprogram(&mut self) {
        self.dev.set_enabled(false);
        self.dev.apply_config(&self.config);
        self.enable();
    }

    /// Bring the UART back up after a reconfiguration or purge. The
    /// transmitter stays held off while hardware flow control is active
    /// and the peer is asserting the inbound line.
    fn enable(&mut self) {
        self.dev.set_enabled(true);
        let held = self.flow_control == FlowControl::Hardware && self.dev.flow_in();
        self.dev.set_tx_enabled(!held);
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) {
        let max = self.dev.clock_hz() / 16;
        self.config.baud_rate = baud_rate.clamp(1, max);
        self.reprogram();
    }

    /// The current baud rate. Reports the requested rate while the
    /// hardware-achieved rate is within 1% of it, and the achieved rate
    /// otherwise.
    pub fn baud_rate(&self) -> u32 {
        let nominal = self.config.baud_rate;
        let achieved = self.dev.line_config().baud_rate;
        if achieved.abs_diff(nominal) > nominal / 100 {
            achieved
        } else {
            nominal
        }
    }

    pub fn set_data_bits(&mut self, data_bits: u8) {
        self.config.data_bits = data_bits.clamp(5, 8);
        self.reprogram();
    }

    pub fn data_bits(&self) -> u8 {
        self.dev.line_config().data_bits
    }

    pub fn set_parity(&mut self, parity: Parity) {
        self.config.parity = parity;
        self.reprogram();
    }

    pub fn parity(&self) -> Parity {
        self.dev.line_config().parity
    }

    pub fn set_stop_bits(&mut self, stop_bits: u8) {
        self.config.stop_bits = stop_bits.clamp(1, 2);
        self.reprogram();
    }

    pub fn stop_bits(&self) -> u8 {
        self.dev.line_config().stop_bits
    }

    pub fn set_flow_control(&mut self, flow_control: FlowControl) {
        self.flow_control = flow_control;
        match flow_control {
            FlowControl::Hardware => {
                self.dev.set_tx_enabled(!self.dev.flow_in());
            }
            FlowControl::None => {
                self.dev.set_tx_enabled(true);
            }
        }
    }

    pub fn flow_control(&self) -> FlowControl {
        self.flow_control
    }

    /// Drive the outbound flow-control line by hand. [`FlowOut::Set`]
    /// latches the line asserted; the automatic release in [`Self::recv`]
    /// honours the latch. [`FlowOut::Clear`] removes the latch but only
    /// releases the line if the RX fill level would allow it anyway.
    pub fn set_flow_out(&mut self, value: FlowOut) {
        match value {
            FlowOut::Set => {
                self.flow_out_latched = true;
                self.dev.set_flow_out(true);
            }
            FlowOut::Clear => {
                self.flow_out_latched = false;
                match self.flow_control {
                    FlowControl::Hardware => {
                        if self.rx.used() < self.rx.capacity() / 4 {
                            self.dev.set_flow_out(false);
                        }
                    }
                    FlowControl::None => self.dev.set_flow_out(false),
                }
            }
        }
    }

    pub fn flow_out(&self) -> FlowOut {
        if self.dev.flow_out() {
            FlowOut::Set
        } else {
            FlowOut::Clear
        }
    }

    /// Discard buffered data. The UART is stopped around the flush and
    /// re-enabled under the usual flow-control policy.
    pub fn purge(&mut self, select: PurgeSelect) {
        self.dev.set_enabled(false);
        if select.purges_rx() {
            self.rx.flush();
        }
        if select.purges_tx() {
            self.tx.flush();
        }
        self.enable();
    }

    /// Apply a port configuration and purge both rings; performed on
    /// every new TCP connection so the peer starts from the persisted
    /// defaults.
    pub fn set_defaults(&mut self, config: &PortConfig) {
        self.set_baud_rate(config.baud_rate);
        self.set_data_bits(config.data_bits);
        self.set_parity(config.parity);
        self.set_stop_bits(config.stop_bits);
        self.set_flow_control(config.flow_control);
        self.purge(PurgeSelect::Both);
        self.protocol = config.protocol;
    }

    /// Apply a working configuration and write the values the hardware
    /// actually accepted back into it, keeping the stored parameters in
    /// sync after a reconfigure.
    pub fn apply_current(&mut self, config: &mut PortConfig) {
        self.set_defaults(config);
        config.baud_rate = self.baud_rate();
        config.data_bits = self.data_bits();
        config.parity = self.parity();
        config.stop_bits = self.stop_bits();
        config.flow_control = self.flow_control();
    }

    /// Whether the TX ring can take no more data.
    pub fn send_full(&self) -> bool {
        self.tx.is_full()
    }

    /// Queue one byte towards the UART. Goes straight into the transmit
    /// FIFO when nothing is queued ahead of it, into the TX ring
    /// otherwise; silently dropped if the ring is full.
    pub fn send(&mut self, byte: u8) {
        if self.tx.is_empty() && self.dev.tx_space() > 0 {
            self.dev.tx_byte(byte);
        } else if self.tx.push_byte(byte).is_err() {
            net_trace!("uart: tx ring full, byte dropped");
        }
    }

    /// Take one byte from the RX ring, releasing the outbound
    /// flow-control line once the ring drains below 1/4 fill (unless
    /// latched).
    pub fn recv(&mut self) -> Option<u8> {
        let byte = self.rx.pop_byte().ok()?;
        if self.flow_control == FlowControl::Hardware
            && self.rx.used() < self.rx.capacity() / 4
            && !self.flow_out_latched
        {
            self.dev.set_flow_out(false);
        }
        Some(byte)
    }

    /// Number of bytes waiting in the RX ring.
    pub fn recv_avail(&self) -> usize {
        self.rx.used()
    }

    /// Service the receive FIFO, applying the telnet IAC-doubling rule.
    /// An IAC is stored only if both slots fit; any byte that does not
    /// fit is dropped. Asserts the outbound flow-control line at 3/4
    /// fill.
    pub fn rx_pump(&mut self) {
        while let Some(byte) = self.dev.rx_byte() {
            if self.protocol == Protocol::Telnet && byte == IAC {
                if self.rx.free() >= 2 {
                    let _ = self.rx.push_byte(byte);
                    let _ = self.rx.push_byte(byte);
                } else {
                    net_trace!("uart: rx ring full, escaped IAC dropped");
                }
            } else if self.rx.push_byte(byte).is_err() {
                net_trace!("uart: rx ring full, byte dropped");
            }
        }
        if self.flow_control == FlowControl::Hardware
            && self.rx.used() >= self.rx.capacity() * 3 / 4
        {
            self.dev.set_flow_out(true);
        }
    }

    /// Service the transmit FIFO from the TX ring.
    pub fn tx_pump(&mut self) {
        while !self.tx.is_empty() && self.dev.tx_space() > 0 {
            if let Ok(byte) = self.tx.pop_byte() {
                self.dev.tx_byte(byte);
            }
        }
    }

    /// React to an edge on the inbound flow-control line: gate the
    /// transmitter and report the resulting modem state (CTS plus its
    /// delta bit). Without hardware flow control the line is ignored.
    pub fn flow_in_changed(&mut self) -> Option<u8> {
        if self.flow_control != FlowControl::Hardware {
            return None;
        }
        if self.dev.flow_in() {
            self.dev.set_tx_enabled(false);
            Some(MODEM_CTS | MODEM_DELTA_CTS)
        } else {
            self.dev.set_tx_enabled(true);
            Some(MODEM_DELTA_CTS)
        }
    }
}
