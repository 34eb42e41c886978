//! Collector endpoint (C1, spec §4.1): terminates IPFIX sessions over
//! UDP/TCP/TLS and publishes decoded records onto the channel C2 reads.

pub mod session;
pub mod tcp;
pub mod tls;
pub mod udp;
