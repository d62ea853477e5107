use net2::TcpBuilder;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tokio::sync::watch;

const LISTEN_BACKLOG: i32 = 128;

/// Bind a listening socket with `SO_REUSEADDR` set, so a test can rebind a
/// port released by a stopped proxy without waiting out `TIME_WAIT`.
///
/// Must be called from within a Tokio runtime.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let builder = match addr {
        SocketAddr::V4(_) => TcpBuilder::new_v4()?,
        SocketAddr::V6(_) => TcpBuilder::new_v6()?,
    };
    #[cfg(not(windows))]
    builder.reuse_address(true)?;
    builder.bind(addr)?;

    let listener = builder.listen(LISTEN_BACKLOG)?;
    listener.set_nonblocking(true)?;
    TcpListener::from_std(listener)
}

/// Bind an ephemeral port on the IPv4 loopback interface.
pub fn bind_loopback() -> io::Result<TcpListener> {
    bind_listener(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
}

/// The controller's view of the listening socket.
///
/// The socket itself is owned by the accept loop; closing the endpoint
/// flips the shared close signal, which the loop races against every accept
/// and handshake. The socket is released when the loop exits.
pub struct Endpoint {
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl Endpoint {
    pub fn new(local_addr: SocketAddr) -> Self {
        let (closed, _) = watch::channel(false);
        Endpoint { local_addr, closed }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Returns `true` only for the call that actually closed the endpoint.
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_loopback_uses_ephemeral_port() {
        let listener = bind_loopback().unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_port_can_be_rebound_after_release() {
        let listener = bind_loopback().unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);
        drop(client);
        drop(listener);

        let rebound = bind_listener(addr).unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_close_happens_once() {
        let endpoint = Endpoint::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 1080)));
        let signal = endpoint.close_signal();

        assert!(!endpoint.is_closed());
        assert!(endpoint.close());
        assert!(!endpoint.close());
        assert!(endpoint.is_closed());
        assert!(*signal.borrow());
    }
}
