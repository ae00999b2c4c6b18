/*! UART device access and the per-port serial controller.

This module splits the serial side of the bridge the same way the phy
layer splits the network side: a device trait ([`UartDevice`]) carries
the operations a concrete UART must provide (line configuration with
whatever divisor rounding its clocking imposes, FIFO access, the
transmitter gate and the two flow-control pins), and [`SerialPort`] is
the device-independent controller that owns the RX/TX ring buffers and
implements the bridge's policies on top: parameter clamping, the
flow-out hysteresis, the flow-in transmitter gate, purge, and the
telnet IAC doubling applied on the receive path.

[`SimUart`] is the crate's software device, used by the tests and the
demo binary.
*/

mod port;
mod sim;

pub use self::port::{SerialPort, RX_RING_LEN, TX_RING_LEN};
pub use self::sim::SimUart;

use crate::wire::comport::Parity;

/// Serial line parameters as programmed into a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for LineConfig {
    fn default() -> LineConfig {
        LineConfig {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

/// Access to one UART device.
///
/// `apply_config` may round the requested baud rate to whatever its
/// divider can achieve; `line_config` reads back what the hardware is
/// actually running, which is what the RFC 2217 replies report.
pub trait UartDevice {
    /// The clock feeding the baud-rate generator. The highest usable
    /// baud rate is `clock_hz() / 16`.
    fn clock_hz(&self) -> u32;

    /// Program the line parameters.
    fn apply_config(&mut self, config: &LineConfig);

    /// Read back the achieved line parameters.
    fn line_config(&self) -> LineConfig;

    /// Gate the whole UART (receiver and transmitter).
    fn set_enabled(&mut self, enabled: bool);

    /// Gate only the transmitter (flow-control hold-off).
    fn set_tx_enabled(&mut self, enabled: bool);

    /// Level of the inbound flow-control line; `true` means the peer is
    /// asking this end to pause.
    fn flow_in(&self) -> bool;

    /// Drive the outbound flow-control line; `true` asks the peer to
    /// pause.
    fn set_flow_out(&mut self, asserted: bool);

    /// Level currently driven on the outbound flow-control line.
    fn flow_out(&self) -> bool;

    /// Pop one byte from the receive FIFO.
    fn rx_byte(&mut self) -> Option<u8>;

    /// Free space in the transmit FIFO.
    fn tx_space(&self) -> usize;

    /// Push one byte into the transmit FIFO.
    fn tx_byte(&mut self, byte: u8);
}
