/*! A serial-to-Ethernet bridge core.

ser2eth-rs exposes a pair of UART ports over TCP. Each port runs as a
TCP server (accepting one telnet-style connection) or client (dialing a
configured endpoint) and transparently forwards octets between the UART
and the connection. Under the telnet protocol the bridge speaks RFC 854
option negotiation and the RFC 2217 COM-PORT-OPTION, so the remote peer
can inspect and change UART parameters (baud rate, data size, parity,
stop bits, flow control) and purge data in flight.

The crate is organized as the session engine plus the seams it drives:

- [`storage`]: the ring buffers between the UART FIFOs and the engine;
- [`uart`]: the device trait and the port controller (configuration
  with clamping, flow-control policy, purge);
- [`wire`] and [`telnet`]: the RFC 854 / RFC 2217 byte definitions and
  the per-connection parser;
- [`pkbuf`]: received payload chains and their read cursor;
- [`session`]: the TCP lifecycle and both data paths;
- [`phy`]: the TCP stack trait and a host-socket implementation;
- [`bridge`]: the per-process aggregate and periodic handler.
*/

#[macro_use]
mod macros;

pub mod bridge;
pub mod config;
pub mod parsers;
pub mod phy;
pub mod pkbuf;
pub mod session;
pub mod storage;
pub mod telnet;
pub mod time;
pub mod uart;
pub mod wire;
