//! Port and module configuration.
//!
//! A [`PortConfig`] describes one UART/TCP pairing: the serial line
//! parameters, the TCP role (listen or dial) and protocol (telnet or
//! raw), and the session idle timeout. The bridge only ever *reads*
//! configuration — at startup and on an explicit reconfigure — through
//! the [`ConfigStore`] seam; persistence itself lives outside this crate.

use core::fmt;
use std::net::Ipv4Addr;

use crate::wire::comport::{FlowControl, Parity};

/// Number of serial ports on the module.
pub const MAX_PORTS: usize = 2;

/// Factory-default listen ports, one per serial port.
const FACTORY_LOCAL_PORTS: [u16; MAX_PORTS] = [23, 26];

/// Whether a port's TCP endpoint listens for a peer or dials one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Server,
    Client,
}

/// Whether the TCP byte stream carries telnet option negotiation or is a
/// fully transparent pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Telnet,
    Raw,
}

/// Configuration for a single bridged port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Serial baud rate in bits per second.
    pub baud_rate: u32,
    /// Serial data size in bits, 5 through 8.
    pub data_bits: u8,
    pub parity: Parity,
    /// Number of stop bits, 1 or 2.
    pub stop_bits: u8,
    pub flow_control: FlowControl,
    /// Seconds of TCP inactivity after which a server-mode connection is
    /// aborted. 0 disables the timeout. Ignored in client mode.
    pub idle_timeout_secs: u32,
    /// Listen port in server mode; source port in client mode.
    pub local_port: u16,
    /// Port dialed in client mode.
    pub remote_port: u16,
    /// Address dialed in client mode.
    pub remote_addr: Ipv4Addr,
    pub role: Role,
    pub protocol: Protocol,
}

impl Default for PortConfig {
    fn default() -> PortConfig {
        PortConfig::factory(0)
    }
}

impl PortConfig {
    /// The factory configuration for the given port: 115200-8N1, no flow
    /// control, no idle timeout, telnet server.
    pub fn factory(port: usize) -> PortConfig {
        PortConfig {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
            idle_timeout_secs: 0,
            local_port: FACTORY_LOCAL_PORTS[port % MAX_PORTS],
            remote_port: 23,
            remote_addr: Ipv4Addr::UNSPECIFIED,
            role: Role::Server,
            protocol: Protocol::Telnet,
        }
    }

    /// Clamp every parameter into its legal range, in place.
    ///
    /// Mirrors the hardware-side policy: out-of-range requests are not
    /// errors, they snap to the nearest legal value.
    pub fn sanitize(&mut self) {
        self.baud_rate = self.baud_rate.max(1);
        self.data_bits = self.data_bits.clamp(5, 8);
        self.stop_bits = self.stop_bits.clamp(1, 2);
        if self.local_port == 0 {
            self.local_port = FACTORY_LOCAL_PORTS[0];
        }
    }

    /// Check the invariants that cannot be repaired by clamping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_port == 0 {
            return Err(ConfigError::InvalidLocalPort);
        }
        if self.role == Role::Client
            && (self.remote_port == 0 || self.remote_addr.is_unspecified())
        {
            return Err(ConfigError::InvalidRemote);
        }
        Ok(())
    }
}

/// A configuration constraint that clamping cannot repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    InvalidLocalPort,
    InvalidRemote,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::InvalidLocalPort => write!(f, "local port must be non-zero"),
            ConfigError::InvalidRemote => {
                write!(f, "client mode requires a remote address and port")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// The complete parameter set for the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigParameters {
    pub ports: [PortConfig; MAX_PORTS],
    /// Human-readable module name, surfaced in diagnostics.
    pub module_name: String,
}

impl Default for ConfigParameters {
    fn default() -> ConfigParameters {
        ConfigParameters {
            ports: [PortConfig::factory(0), PortConfig::factory(1)],
            module_name: "Serial2Ethernet Module".to_string(),
        }
    }
}

/// Where the working parameter set comes from and goes to.
///
/// The session engine never writes configuration; `save` exists for the
/// configuration front-end that owns this store.
pub trait ConfigStore {
    fn load(&self) -> ConfigParameters;
    fn save(&mut self, params: &ConfigParameters);
}

/// A volatile store holding the factory defaults until overwritten.
#[derive(Debug, Default)]
pub struct MemConfigStore {
    params: ConfigParameters,
}

impl MemConfigStore {
    pub fn new(params: ConfigParameters) -> MemConfigStore {
        MemConfigStore { params }
    }
}

impl ConfigStore for MemConfigStore {
    fn load(&self) -> ConfigParameters {
        self.params.clone()
    }

    fn save(&mut self, params: &ConfigParameters) {
        self.params = params.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_factory_defaults() {
        let p0 = PortConfig::factory(0);
        let p1 = PortConfig::factory(1);
        assert_eq!(p0.baud_rate, 115_200);
        assert_eq!((p0.data_bits, p0.parity, p0.stop_bits), (8, Parity::None, 1));
        assert_eq!(p0.local_port, 23);
        assert_eq!(p1.local_port, 26);
        assert_eq!(p0.idle_timeout_secs, 0);
        assert_eq!(p0.role, Role::Server);
    }

    #[test]
    fn test_sanitize_clamps() {
        let mut cfg = PortConfig {
            data_bits: 9,
            stop_bits: 0,
            baud_rate: 0,
            local_port: 0,
            ..PortConfig::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.data_bits, 8);
        assert_eq!(cfg.stop_bits, 1);
        assert_eq!(cfg.baud_rate, 1);
        assert_eq!(cfg.local_port, 23);

        let mut cfg = PortConfig {
            data_bits: 4,
            stop_bits: 3,
            ..PortConfig::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.data_bits, 5);
        assert_eq!(cfg.stop_bits, 2);
    }

    #[test]
    fn test_validate_client() {
        let mut cfg = PortConfig {
            role: Role::Client,
            ..PortConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidRemote));
        cfg.remote_addr = Ipv4Addr::new(10, 0, 0, 9);
        cfg.remote_port = 4000;
        assert_eq!(cfg.validate(), Ok(()));
    }
}
