//! Network transports available to the daemon.

pub mod udp;

pub use udp::UdpTransport;
