//! A software UART used by the tests and the demo binary.

use std::collections::VecDeque;

use crate::uart::{LineConfig, UartDevice};

const TX_FIFO_DEPTH: usize = 16;
const DEFAULT_CLOCK_HZ: u32 = 50_000_000;

/// A simulated UART.
///
/// Line configuration goes through the same fractional divider a real
/// baud generator uses, so the achieved rate read back differs from the
/// requested one exactly where hardware would differ. The "wire" is
/// explicit: bytes written to the transmit FIFO are collected until
/// [`SimUart::drain_line`] (or, in loopback mode, [`SimUart::step`])
/// moves them off-chip.
#[derive(Debug)]
pub struct SimUart {
    clock_hz: u32,
    config: LineConfig,
    achieved_baud: u32,
    enabled: bool,
    tx_enabled: bool,
    flow_in_level: bool,
    flow_out_level: bool,
    flow_out_changes: u32,
    loopback: bool,
    rx_fifo: VecDeque<u8>,
    tx_fifo: VecDeque<u8>,
}

impl SimUart {
    pub fn new() -> SimUart {
        SimUart::with_clock(DEFAULT_CLOCK_HZ)
    }

    pub fn with_clock(clock_hz: u32) -> SimUart {
        let config = LineConfig::default();
        let achieved_baud = divider_baud(clock_hz, config.baud_rate);
        SimUart {
            clock_hz,
            config,
            achieved_baud,
            enabled: true,
            tx_enabled: true,
            flow_in_level: false,
            flow_out_level: false,
            flow_out_changes: 0,
            loopback: false,
            rx_fifo: VecDeque::new(),
            tx_fifo: VecDeque::new(),
        }
    }

    /// Wire the transmit line back into the receive line.
    pub fn set_loopback(&mut self, on: bool) {
        self.loopback = on;
    }

    /// Deliver bytes arriving on the receive line.
    pub fn feed_rx(&mut self, bytes: &[u8]) {
        self.rx_fifo.extend(bytes);
    }

    /// Take everything transmitted since the last drain off the line.
    pub fn drain_line(&mut self) -> Vec<u8> {
        self.tx_fifo.drain(..).collect()
    }

    /// Advance the simulated wire: in loopback mode, transmitted bytes
    /// reappear on the receive line.
    pub fn step(&mut self) {
        if self.loopback {
            while let Some(byte) = self.tx_fifo.pop_front() {
                self.rx_fifo.push_back(byte);
            }
        }
    }

    /// Drive the inbound flow-control line level.
    pub fn set_flow_in(&mut self, asserted: bool) {
        self.flow_in_level = asserted;
    }

    /// Number of level changes seen on the outbound flow-control line.
    pub fn flow_out_changes(&self) -> u32 {
        self.flow_out_changes
    }

    pub fn tx_enabled(&self) -> bool {
        self.tx_enabled
    }
}

impl Default for SimUart {
    fn default() -> SimUart {
        SimUart::new()
    }
}

/// Round a requested baud rate through a 6-bit fractional divider.
fn divider_baud(clock_hz: u32, baud_rate: u32) -> u32 {
    let clock = clock_hz as u64;
    let divider = ((clock * 8 / baud_rate as u64) + 1) / 2;
    (clock * 4 / divider) as u32
}

impl UartDevice for SimUart {
    fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    fn apply_config(&mut self, config: &LineConfig) {
        self.config = *config;
        self.achieved_baud = divider_baud(self.clock_hz, config.baud_rate);
    }

    fn line_config(&self) -> LineConfig {
        LineConfig {
            baud_rate: self.achieved_baud,
            ..self.config
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn set_tx_enabled(&mut self, enabled: bool) {
        self.tx_enabled = enabled;
    }

    fn flow_in(&self) -> bool {
        self.flow_in_level
    }

    fn set_flow_out(&mut self, asserted: bool) {
        if self.flow_out_level != asserted {
            self.flow_out_changes += 1;
        }
        self.flow_out_level = asserted;
    }

    fn flow_out(&self) -> bool {
        self.flow_out_level
    }

    fn rx_byte(&mut self) -> Option<u8> {
        self.rx_fifo.pop_front()
    }

    fn tx_space(&self) -> usize {
        if self.tx_enabled {
            TX_FIFO_DEPTH.saturating_sub(self.tx_fifo.len())
        } else {
            0
        }
    }

    fn tx_byte(&mut self, byte: u8) {
        if self.tx_fifo.len() < TX_FIFO_DEPTH {
            self.tx_fifo.push_back(byte);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_divider_rounding() {
        // 115200 over a 50 MHz clock: divider 868, achieved 230414/2.
        let achieved = divider_baud(50_000_000, 115_200);
        let err = achieved.abs_diff(115_200);
        assert!(err * 100 < 115_200, "{achieved} deviates more than 1%");

        // The divider floor makes very high rates visibly imprecise.
        let achieved = divider_baud(50_000_000, 3_000_000);
        assert_ne!(achieved, 3_000_000);
    }

    #[test]
    fn test_fifo_depth() {
        let mut uart = SimUart::new();
        for byte in 0..32u8 {
            if uart.tx_space() > 0 {
                uart.tx_byte(byte);
            }
        }
        assert_eq!(uart.drain_line().len(), TX_FIFO_DEPTH);
    }

    #[test]
    fn test_loopback() {
        let mut uart = SimUart::new();
        uart.set_loopback(true);
        uart.tx_byte(0x55);
        uart.tx_byte(0xaa);
        uart.step();
        assert_eq!(uart.rx_byte(), Some(0x55));
        assert_eq!(uart.rx_byte(), Some(0xaa));
        assert_eq!(uart.rx_byte(), None);
    }
}
