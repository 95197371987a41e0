//! TLS tunnel: an exposed host multiplexes raw client connections over two control
//! links to a protected host, which dials the real targets.
//!
//! Wire format: `[len:u16][type:u8][channel:u16][payload]`, big-endian, after a fixed
//! preamble on every control connection. See [`protocol`].

pub mod connection;
pub mod exposed;
pub mod link;
pub mod protected;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod tls;
pub mod transport;
