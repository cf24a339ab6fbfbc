//! Loopback listener for worker connections.
//!
//! Each capability gets its own listener on a randomly chosen unprivileged
//! port. Only peers on the loopback address are ever honored.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::RangeInclusive;

use rand::Rng;
use tokio::net::TcpListener;

#[derive(Debug, thiserror::Error)]
#[error("no free loopback port after {attempts} attempts")]
pub struct PortExhausted {
    pub attempts: u32,
    #[source]
    pub last_error: Option<io::Error>,
}

/// Bind a listener on `127.0.0.1` at a random port from `range`, giving up
/// after `attempts` collisions.
///
/// Must be called from within a tokio runtime.
pub fn bind_loopback(
    range: RangeInclusive<u16>,
    attempts: u32,
) -> Result<(TcpListener, u16), PortExhausted> {
    if range.is_empty() {
        return Err(PortExhausted {
            attempts: 0,
            last_error: None,
        });
    }

    let mut rng = rand::rng();
    let mut last_error = None;

    for attempt in 0..attempts {
        let port = rng.random_range(range.clone());
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        match bind(addr) {
            Ok(listener) => {
                tracing::debug!(port, attempt, "Bound worker listener");
                return Ok((listener, port));
            }
            Err(e) => {
                tracing::trace!(port, error = %e, "Port unavailable, retrying");
                last_error = Some(e);
            }
        }
    }

    Err(PortExhausted {
        attempts,
        last_error,
    })
}

fn bind(addr: SocketAddrV4) -> io::Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

pub fn is_loopback_peer(peer: &SocketAddr) -> bool {
    peer.ip().is_loopback()
}
