/*! Low-level protocol byte definitions.

The `wire` module deals with the on-the-wire *representation* of the
telnet control channel. It provides the RFC 854 command and option bytes,
the RFC 2217 COM-PORT-OPTION command codes and wire-value enumerations,
and helpers for emitting IAC-escaped byte sequences.

Telnet is an octet-stream protocol: there are no framed packets to wrap,
so unlike a header-based wire layer this one consists of constants,
value conversions and small emit functions. Everything that keeps *state*
about the stream lives in the [parser](crate::telnet) instead.
*/

pub mod comport;
pub mod telnet;
