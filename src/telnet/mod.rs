/*! Telnet option negotiation and RFC 2217 COM-PORT control.

[`Parser`] is the per-connection byte machine fed from the inbound TCP
queue. Plain data bytes fall through to the UART TX ring; IAC sequences
are consumed here. The parser handles:

- the WILL/WONT/DO/DONT verbs for the two supported options
  (SUPPRESS-GO-AHEAD and COM-PORT-OPTION), with flag tracking so a
  negotiation can never loop;
- BINARY, which is accepted but tracked by no flag (the stream is
  already 8-bit transparent because IAC escaping is always applied);
- AYT, answered with a short liveness string;
- skipping unsupported sub-negotiations up to their closing `IAC SE`;
- the COM-PORT-OPTION sub-negotiation: command byte, MSB-first value
  accumulation with IAC unescaping, execution against the serial port
  controller, and the `command + 100` acknowledgement carrying the value
  the hardware actually applied.

Replies are appended to a caller-provided buffer; the session engine
writes that buffer to TCP once per poll, ahead of any payload drained
from the UART, so acknowledgements keep their position in the stream.
*/

use crate::uart::{SerialPort, UartDevice};
use crate::wire::comport::{self, FlowControl, FlowOut, Parity, PurgeSelect};
use crate::wire::telnet::{self, AYT_REPLY, IAC, OPT_BINARY, OPT_COM_PORT, OPT_SUPPRESS_GA};

/// Option negotiation flags, one WILL/DO pair per supported option.
///
/// The WILL bits start set on a fresh session: the initial offer
/// (`IAC DO …`) counts as this side having already solicited the peer's
/// WILL, so the reply the peer sends back must not trigger another DO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionFlags(u8);

impl OptionFlags {
    const WILL_SUPPRESS_GA: u8 = 1 << 0;
    const DO_SUPPRESS_GA: u8 = 1 << 1;
    const WILL_COM_PORT: u8 = 1 << 2;
    const DO_COM_PORT: u8 = 1 << 3;
    const SERVER: u8 = 1 << 4;

    fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Telnet command parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Data bytes pass through until an IAC arrives.
    Normal,
    /// The previous byte was IAC.
    SeenIac,
    /// The previous bytes were IAC WILL.
    AwaitWill,
    /// The previous bytes were IAC WONT.
    AwaitWont,
    /// The previous bytes were IAC DO.
    AwaitDo,
    /// The previous bytes were IAC DONT.
    AwaitDont,
    /// The previous bytes were IAC SB.
    InSb,
    /// Inside an unsupported sub-negotiation.
    InSbIgnore,
    /// Inside an unsupported sub-negotiation, after an IAC.
    InSbIgnoreIac,
    /// Inside a COM-PORT-OPTION sub-negotiation.
    InSb2217,
}

/// COM-PORT sub-negotiation parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rfc2217State {
    /// The next byte is the command code.
    AwaitCommand,
    /// Accumulating the command's value bytes.
    AwaitData,
    /// An IAC arrived inside the value data.
    AwaitDataIac,
}

/// The telnet/RFC 2217 protocol parser for one session.
#[derive(Debug)]
pub struct Parser {
    state: State,
    flags: OptionFlags,
    rfc2217: Rfc2217State,
    command: u8,
    value: u32,
    value_len: u8,
    value_max: u8,
    suspend_tx: bool,
    modem_mask: u8,
    line_mask: u8,
}

impl Parser {
    pub fn new(server: bool) -> Parser {
        let mut parser = Parser {
            state: State::Normal,
            flags: OptionFlags::default(),
            rfc2217: Rfc2217State::AwaitCommand,
            command: 0,
            value: 0,
            value_len: 0,
            value_max: 0,
            suspend_tx: false,
            modem_mask: 0,
            line_mask: 0,
        };
        parser.reset(server);
        parser
    }

    /// Return the parser to the fresh-session state.
    pub fn reset(&mut self, server: bool) {
        self.state = State::Normal;
        self.flags = OptionFlags::default();
        self.flags.insert(OptionFlags::WILL_SUPPRESS_GA);
        self.flags.insert(OptionFlags::WILL_COM_PORT);
        if server {
            self.flags.insert(OptionFlags::SERVER);
        }
        self.rfc2217 = Rfc2217State::AwaitCommand;
        self.command = 0;
        self.value = 0;
        self.value_len = 0;
        self.value_max = 0;
        self.suspend_tx = false;
        self.modem_mask = 0;
        self.line_mask = 0xff;
    }

    /// Whether the peer asked for the UART-to-TCP direction to pause
    /// (RFC 2217 FLOWCONTROL-SUSPEND).
    pub fn suspended(&self) -> bool {
        self.suspend_tx
    }

    /// The mask the peer selected for modem-state notifications.
    pub fn modem_mask(&self) -> u8 {
        self.modem_mask
    }

    /// The mask the peer selected for line-state notifications.
    pub fn line_mask(&self) -> u8 {
        self.line_mask
    }

    /// Whether COM-PORT-OPTION has been negotiated in both directions.
    pub fn rfc2217_active(&self) -> bool {
        self.flags.contains(OptionFlags::WILL_COM_PORT)
            && self.flags.contains(OptionFlags::DO_COM_PORT)
    }

    /// Process one byte received from TCP. Payload bytes are queued on
    /// the serial port; negotiation replies are appended to `reply`.
    pub fn process<D: UartDevice>(
        &mut self,
        byte: u8,
        serial: &mut SerialPort<'_, D>,
        reply: &mut Vec<u8>,
    ) {
        match self.state {
            State::Normal => {
                if byte == IAC {
                    self.state = State::SeenIac;
                } else {
                    serial.send(byte);
                }
            }

            State::SeenIac => match byte {
                IAC => {
                    serial.send(byte);
                    self.state = State::Normal;
                }
                telnet::WILL => self.state = State::AwaitWill,
                telnet::WONT => self.state = State::AwaitWont,
                telnet::DO => self.state = State::AwaitDo,
                telnet::DONT => self.state = State::AwaitDont,
                telnet::SB => self.state = State::InSb,
                telnet::AYT => {
                    reply.extend_from_slice(AYT_REPLY);
                    self.state = State::Normal;
                }
                // GA, NOP and anything unrecognized are ignored.
                _ => self.state = State::Normal,
            },

            State::AwaitWill => {
                self.process_will(byte, reply);
                self.state = State::Normal;
            }
            State::AwaitWont => {
                self.process_wont(byte, reply);
                self.state = State::Normal;
            }
            State::AwaitDo => {
                self.process_do(byte, reply);
                self.state = State::Normal;
            }
            State::AwaitDont => {
                self.process_dont(byte, reply);
                self.state = State::Normal;
            }

            State::InSb => {
                if byte == OPT_COM_PORT && self.rfc2217_active() {
                    self.rfc2217 = Rfc2217State::AwaitCommand;
                    self.state = State::InSb2217;
                } else {
                    self.state = State::InSbIgnore;
                }
            }

            State::InSbIgnore => {
                if byte == IAC {
                    self.state = State::InSbIgnoreIac;
                }
            }

            State::InSbIgnoreIac => {
                if byte == telnet::SE {
                    self.state = State::Normal;
                } else {
                    self.state = State::InSbIgnore;
                }
            }

            State::InSb2217 => self.process_rfc2217(byte, serial, reply),
        }
    }

    fn will_flag(option: u8) -> Option<u8> {
        match option {
            OPT_SUPPRESS_GA => Some(OptionFlags::WILL_SUPPRESS_GA),
            OPT_COM_PORT => Some(OptionFlags::WILL_COM_PORT),
            _ => None,
        }
    }

    fn do_flag(option: u8) -> Option<u8> {
        match option {
            OPT_SUPPRESS_GA => Some(OptionFlags::DO_SUPPRESS_GA),
            OPT_COM_PORT => Some(OptionFlags::DO_COM_PORT),
            _ => None,
        }
    }

    fn process_will(&mut self, option: u8, reply: &mut Vec<u8>) {
        match Self::will_flag(option) {
            Some(flag) => {
                if !self.flags.contains(flag) {
                    self.flags.insert(flag);
                    telnet::emit_verb(reply, telnet::DO, option);
                }
            }
            // BINARY is welcome but tracked by no flag; everything else
            // is refused.
            None if option == OPT_BINARY => telnet::emit_verb(reply, telnet::DO, option),
            None => telnet::emit_verb(reply, telnet::DONT, option),
        }
    }

    fn process_wont(&mut self, option: u8, reply: &mut Vec<u8>) {
        match Self::will_flag(option) {
            Some(flag) => {
                if self.flags.contains(flag) {
                    self.flags.remove(flag);
                    telnet::emit_verb(reply, telnet::DONT, option);
                }
            }
            None => telnet::emit_verb(reply, telnet::DONT, option),
        }
    }

    fn process_do(&mut self, option: u8, reply: &mut Vec<u8>) {
        match Self::do_flag(option) {
            Some(flag) => {
                if !self.flags.contains(flag) {
                    self.flags.insert(flag);
                    telnet::emit_verb(reply, telnet::WILL, option);
                }
            }
            None if option == OPT_BINARY => telnet::emit_verb(reply, telnet::WILL, option),
            None => telnet::emit_verb(reply, telnet::WONT, option),
        }
    }

    fn process_dont(&mut self, option: u8, reply: &mut Vec<u8>) {
        match Self::do_flag(option) {
            Some(flag) => {
                if self.flags.contains(flag) {
                    self.flags.remove(flag);
                    telnet::emit_verb(reply, telnet::WONT, option);
                }
            }
            None => telnet::emit_verb(reply, telnet::WONT, option),
        }
    }

    fn accumulate_value(&mut self, byte: u8) {
        if self.value_max == 0 || self.value_len >= self.value_max {
            return;
        }
        // Values arrive MSB-first; the 4-octet baud rate shifts in from
        // the top, single octets land in the low byte.
        self.value = (self.value << 8) | byte as u32;
        self.value_len += 1;
    }

    fn process_rfc2217<D: UartDevice>(
        &mut self,
        byte: u8,
        serial: &mut SerialPort<'_, D>,
        reply: &mut Vec<u8>,
    ) {
        match self.rfc2217 {
            Rfc2217State::AwaitCommand => {
                self.command = byte;
                self.value = 0;
                self.value_len = 0;
                self.value_max = comport::value_len(byte);
                self.rfc2217 = Rfc2217State::AwaitData;
            }

            Rfc2217State::AwaitData => {
                if byte == IAC {
                    self.rfc2217 = Rfc2217State::AwaitDataIac;
                } else {
                    self.accumulate_value(byte);
                }
            }

            Rfc2217State::AwaitDataIac => {
                if byte == telnet::SE {
                    self.execute_rfc2217(serial, reply);
                    self.state = State::Normal;
                } else {
                    // An escaped data byte; fall back to accumulation.
                    self.rfc2217 = Rfc2217State::AwaitData;
                    self.accumulate_value(byte);
                }
            }
        }
    }

    /// Apply a completed COM-PORT command and append the `command + 100`
    /// acknowledgement carrying the value read back from the port, so
    /// the peer learns what was actually applied.
    fn execute_rfc2217<D: UartDevice>(
        &mut self,
        serial: &mut SerialPort<'_, D>,
        reply: &mut Vec<u8>,
    ) {
        let value = self.value;
        let got_data = self.value_len != 0;

        match self.command {
            comport::SET_BAUDRATE => {
                if value != 0 && got_data {
                    serial.set_baud_rate(value);
                }
            }
            comport::SET_DATASIZE => {
                if value != 0 && got_data {
                    serial.set_data_bits(value as u8);
                }
            }
            comport::SET_PARITY => {
                if value != 0 && got_data {
                    if let Some(parity) = Parity::from_wire(value as u8) {
                        serial.set_parity(parity);
                    }
                }
            }
            comport::SET_STOPSIZE => {
                if value != 0 && got_data {
                    serial.set_stop_bits(value as u8);
                }
            }
            comport::SET_CONTROL => match value {
                1 | 3 => {
                    if let Some(flow) = FlowControl::from_wire(value as u8) {
                        serial.set_flow_control(flow);
                    }
                }
                11 | 12 => {
                    if let Some(flow_out) = FlowOut::from_wire(value as u8) {
                        serial.set_flow_out(flow_out);
                    }
                }
                _ => {}
            },
            comport::FLOWCONTROL_SUSPEND => self.suspend_tx = true,
            comport::FLOWCONTROL_RESUME => self.suspend_tx = false,
            comport::SET_LINESTATE_MASK => self.line_mask = value as u8,
            comport::SET_MODEMSTATE_MASK => self.modem_mask = value as u8,
            comport::PURGE_DATA => {
                if let Some(select) = PurgeSelect::from_wire(value as u8) {
                    serial.purge(select);
                }
            }
            _ => {}
        }

        match self.command {
            comport::SET_BAUDRATE => {
                comport::emit_reply_u32(reply, self.command, serial.baud_rate());
            }
            comport::SET_DATASIZE => {
                comport::emit_reply(reply, self.command, &[serial.data_bits()]);
            }
            comport::SET_PARITY => {
                comport::emit_reply(reply, self.command, &[serial.parity().to_wire()]);
            }
            comport::SET_STOPSIZE => {
                comport::emit_reply(reply, self.command, &[serial.stop_bits()]);
            }
            comport::SET_CONTROL => {
                let current = match value {
                    0..=3 => serial.flow_control().to_wire(),
                    10..=12 => serial.flow_out().to_wire(),
                    _ => 0,
                };
                comport::emit_reply(reply, self.command, &[current]);
            }
            comport::FLOWCONTROL_SUSPEND
            | comport::FLOWCONTROL_RESUME
            | comport::SET_LINESTATE_MASK
            | comport::SET_MODEMSTATE_MASK
            | comport::PURGE_DATA => {
                comport::emit_reply(reply, self.command, &[value as u8]);
            }
            _ => {
                comport::emit_reply(reply, self.command, &[0]);
            }
        }
    }
}
