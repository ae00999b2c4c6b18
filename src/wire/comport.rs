//! COM-PORT-OPTION sub-negotiation codes and values, as defined by
//! RFC 2217.
//!
//! All multi-byte values travel MSB-first ("network order") on the wire;
//! the only multi-byte value in the protocol is the 4-octet baud rate.

use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use crate::wire::telnet::{IAC, OPT_COM_PORT, SB, SE};

//
// Client-to-server command codes. The matching server-to-client code is
// `command + SERVER_OFFSET`.
//
pub const SIGNATURE: u8 = 0;
pub const SET_BAUDRATE: u8 = 1;
pub const SET_DATASIZE: u8 = 2;
pub const SET_PARITY: u8 = 3;
pub const SET_STOPSIZE: u8 = 4;
pub const SET_CONTROL: u8 = 5;
pub const NOTIFY_LINESTATE: u8 = 6;
pub const NOTIFY_MODEMSTATE: u8 = 7;
pub const FLOWCONTROL_SUSPEND: u8 = 8;
pub const FLOWCONTROL_RESUME: u8 = 9;
pub const SET_LINESTATE_MASK: u8 = 10;
pub const SET_MODEMSTATE_MASK: u8 = 11;
pub const PURGE_DATA: u8 = 12;

/// Offset between the client-to-server and server-to-client code spaces.
pub const SERVER_OFFSET: u8 = 100;

//
// Modem-state bits used in NOTIFY-MODEMSTATE values.
//
pub const MODEM_DELTA_CTS: u8 = 0x01;
pub const MODEM_CTS: u8 = 0x10;

/// Number of value bytes that follow a given command byte.
///
/// SIGNATURE and the flow-control suspend/resume commands carry no value,
/// SET-BAUDRATE carries four octets (MSB first), and every other command
/// carries a single octet.
pub const fn value_len(command: u8) -> u8 {
    match command {
        SIGNATURE | FLOWCONTROL_SUSPEND | FLOWCONTROL_RESUME => 0,
        SET_BAUDRATE => 4,
        _ => 1,
    }
}

/// Serial parity, using the RFC 2217 SET-PARITY value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None = 1,
    Odd = 2,
    Even = 3,
    Mark = 4,
    Space = 5,
}

impl Parity {
    pub const fn from_wire(value: u8) -> Option<Parity> {
        match value {
            1 => Some(Parity::None),
            2 => Some(Parity::Odd),
            3 => Some(Parity::Even),
            4 => Some(Parity::Mark),
            5 => Some(Parity::Space),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Parity::None => write!(f, "N"),
            Parity::Odd => write!(f, "O"),
            Parity::Even => write!(f, "E"),
            Parity::Mark => write!(f, "M"),
            Parity::Space => write!(f, "S"),
        }
    }
}

/// Flow-control discipline, using the RFC 2217 SET-CONTROL value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None = 1,
    Hardware = 3,
}

impl FlowControl {
    pub const fn from_wire(value: u8) -> Option<FlowControl> {
        match value {
            1 => Some(FlowControl::None),
            3 => Some(FlowControl::Hardware),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        self as u8
    }
}

/// The latched state of the outbound flow-control line, using the
/// RFC 2217 SET-CONTROL value space (11 = asserted, 12 = released).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOut {
    Set = 11,
    Clear = 12,
}

impl FlowOut {
    pub const fn from_wire(value: u8) -> Option<FlowOut> {
        match value {
            11 => Some(FlowOut::Set),
            12 => Some(FlowOut::Clear),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        self as u8
    }
}

/// PURGE-DATA selector: which of the two data queues to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeSelect {
    Rx = 1,
    Tx = 2,
    Both = 3,
}

impl PurgeSelect {
    pub const fn from_wire(value: u8) -> Option<PurgeSelect> {
        match value {
            1 => Some(PurgeSelect::Rx),
            2 => Some(PurgeSelect::Tx),
            3 => Some(PurgeSelect::Both),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    pub const fn purges_rx(self) -> bool {
        (self as u8) & 0x01 != 0
    }

    pub const fn purges_tx(self) -> bool {
        (self as u8) & 0x02 != 0
    }
}

/// Append a complete server-to-client sub-negotiation:
/// `IAC SB 44 (command+100) <value…> IAC SE`, doubling any value byte
/// that collides with IAC.
pub fn emit_reply(out: &mut Vec<u8>, command: u8, value: &[u8]) {
    out.push(IAC);
    out.push(SB);
    out.push(OPT_COM_PORT);
    out.push(command + SERVER_OFFSET);
    for &byte in value {
        out.push(byte);
        if byte == IAC {
            out.push(IAC);
        }
    }
    out.push(IAC);
    out.push(SE);
}

/// Append the reply for a command carrying a 4-octet value (MSB first).
pub fn emit_reply_u32(out: &mut Vec<u8>, command: u8, value: u32) {
    let mut bytes = [0u8; 4];
    NetworkEndian::write_u32(&mut bytes, value);
    emit_reply(out, command, &bytes);
}
