use core::result;
use core::str::FromStr;

use crate::config::{Protocol, Role};
use crate::wire::comport::Parity;

type Result<T> = result::Result<T, ()>;

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a str) -> Parser<'a> {
        Parser {
            data: data.as_bytes(),
            pos: 0,
        }
    }

    fn advance(&mut self) -> Result<u8> {
        match self.data.get(self.pos) {
            Some(&chr) => {
                self.pos += 1;
                Ok(chr)
            }
            None => Err(()),
        }
    }

    fn try_do<F, T>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Parser<'a>) -> Result<T>,
    {
        let pos = self.pos;
        match f(self) {
            Ok(res) => Some(res),
            Err(()) => {
                self.pos = pos;
                None
            }
        }
    }

    fn accept_eof(&mut self) -> Result<()> {
        if self.data.len() == self.pos {
            Ok(())
        } else {
            Err(())
        }
    }

    fn until_eof<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Parser<'a>) -> Result<T>,
    {
        let res = f(self)?;
        self.accept_eof()?;
        Ok(res)
    }

    fn accept_char(&mut self, chr: u8) -> Result<()> {
        if self.advance()? == chr {
            Ok(())
        } else {
            Err(())
        }
    }

    fn accept_digit(&mut self) -> Result<u8> {
        let digit = self.advance()?;
        if digit.is_ascii_digit() {
            Ok(digit - b'0')
        } else {
            Err(())
        }
    }

    fn accept_number(&mut self, max_digits: usize, max_value: u32) -> Result<u32> {
        let mut value = self.accept_digit()? as u32;
        for _ in 1..max_digits {
            match self.try_do(|p| p.accept_digit()) {
                Some(digit) => {
                    value *= 10;
                    value += digit as u32;
                }
                None => break,
            }
        }
        if value < max_value {
            Ok(value)
        } else {
            Err(())
        }
    }

    fn accept_parity(&mut self) -> Result<Parity> {
        match self.advance()?.to_ascii_uppercase() {
            b'N' => Ok(Parity::None),
            b'O' => Ok(Parity::Odd),
            b'E' => Ok(Parity::Even),
            b'M' => Ok(Parity::Mark),
            b'S' => Ok(Parity::Space),
            _ => Err(()),
        }
    }

    fn accept_line_settings(&mut self) -> Result<LineSettings> {
        let baud = self.accept_number(7, 4_000_000)?;
        self.accept_char(b'-')?;
        let data_bits = self.accept_digit()?;
        if !(5..=8).contains(&data_bits) {
            return Err(());
        }
        let parity = self.accept_parity()?;
        let stop_bits = self.accept_digit()?;
        if !(1..=2).contains(&stop_bits) {
            return Err(());
        }
        Ok(LineSettings {
            baud_rate: baud,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

/// The serial line parameters in the conventional "115200-8N1" notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl FromStr for LineSettings {
    type Err = ();

    /// Parse a string representation of serial line settings, e.g.
    /// `115200-8N1` or `9600-7E2`.
    fn from_str(s: &str) -> Result<LineSettings> {
        Parser::new(s).until_eof(|p| p.accept_line_settings())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Role> {
        match s {
            "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            _ => Err(()),
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Protocol> {
        match s {
            "telnet" => Ok(Protocol::Telnet),
            "raw" => Ok(Protocol::Raw),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_line_settings() {
        assert_eq!(
            LineSettings::from_str("115200-8N1"),
            Ok(LineSettings {
                baud_rate: 115_200,
                data_bits: 8,
                parity: Parity::None,
                stop_bits: 1,
            })
        );
        assert_eq!(
            LineSettings::from_str("9600-7e2"),
            Ok(LineSettings {
                baud_rate: 9600,
                data_bits: 7,
                parity: Parity::Even,
                stop_bits: 2,
            })
        );
        assert_eq!(LineSettings::from_str("115200-9N1"), Err(()));
        assert_eq!(LineSettings::from_str("115200-8N3"), Err(()));
        assert_eq!(LineSettings::from_str("115200-8N1x"), Err(()));
        assert_eq!(LineSettings::from_str("-8N1"), Err(()));
    }

    #[test]
    fn test_role_protocol() {
        assert_eq!(Role::from_str("server"), Ok(Role::Server));
        assert_eq!(Role::from_str("client"), Ok(Role::Client));
        assert_eq!(Role::from_str("peer"), Err(()));
        assert_eq!(Protocol::from_str("telnet"), Ok(Protocol::Telnet));
        assert_eq!(Protocol::from_str("raw"), Ok(Protocol::Raw));
        assert_eq!(Protocol::from_str("tcp"), Err(()));
    }
}
