//! Local port availability probe.
//!
//! Advisory only: nothing is reserved, so a port reported free can be taken
//! before the forwarder binds it. That race surfaces later as an `error` row.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

/// Whether `127.0.0.1:port` can currently be bound.
///
/// Port 0 is never "available": it would let the OS pick an arbitrary port
/// the forwarder does not know about.
pub fn is_available(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}
