//! Local port availability probing

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

/// Tells whether `(address, port)` can currently be bound on this host.
///
/// The answer is a heuristic: another process may take the port between the
/// probe and the real bind, so callers must handle a later bind failure.
pub trait PortProbe: Send + Sync + std::fmt::Debug {
    fn is_local_port_available(&self, address: IpAddr, port: u16) -> bool;
}

/// Probes by binding and listening on a throwaway socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketPortProbe;

impl PortProbe for SocketPortProbe {
    fn is_local_port_available(&self, address: IpAddr, port: u16) -> bool {
        match try_bind(SocketAddr::new(address, port)) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!("Port {}:{} is in use", address, port);
                false
            }
            Err(e) => {
                warn!("Failed to probe {}:{}: {}", address, port, e);
                false
            }
        }
    }
}

/// Bind without SO_REUSEADDR so a live listener always makes the bind fail.
fn try_bind(addr: SocketAddr) -> io::Result<()> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(false)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn free_port_is_available() {
        // Grab an ephemeral port and release it again.
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(SocketPortProbe.is_local_port_available(Ipv4Addr::LOCALHOST.into(), port));
    }

    #[test]
    fn port_held_by_foreign_listener_is_unavailable() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!SocketPortProbe.is_local_port_available(Ipv4Addr::LOCALHOST.into(), port));
    }

    #[test]
    fn probe_releases_the_port() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(SocketPortProbe.is_local_port_available(Ipv4Addr::LOCALHOST.into(), port));
        assert!(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok());
    }
}
