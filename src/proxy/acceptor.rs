use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;

use crate::proxy::handshake::{self, HandshakeError};
use crate::proxy::registry::ConnectionRegistry;
use crate::proxy::startup::StartupSignal;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts connections one at a time, negotiates each and registers the
/// successful ones under their digest.
pub struct SessionAcceptor {
    registry: Arc<ConnectionRegistry>,
    startup: Arc<StartupSignal>,
}

impl SessionAcceptor {
    pub fn new(registry: Arc<ConnectionRegistry>, startup: Arc<StartupSignal>) -> Self {
        SessionAcceptor { registry, startup }
    }

    /// Serve until the close signal is raised or its sender goes away. The
    /// listener is dropped on return.
    pub async fn run(self, listener: TcpListener, mut closed: watch::Receiver<bool>) {
        let local_addr = listener.local_addr().ok();
        info!("SOCKS5 test proxy accepting on {:?}", local_addr);

        let mut incoming = TcpListenerStream::new(listener);

        loop {
            if *closed.borrow_and_update() {
                break;
            }

            let stream = tokio::select! {
                biased;
                _ = closed.changed() => break,
                next = incoming.next() => match next {
                    Some(Ok(stream)) => stream,
                    Some(Err(e)) if is_connection_reset(&e) => {
                        debug!("Accept interrupted: {}", e);
                        continue;
                    }
                    Some(Err(e)) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                    None => break,
                },
            };

            let peer = stream.peer_addr().ok();
            tokio::select! {
                biased;
                _ = closed.changed() => {
                    debug!("Abandoning handshake with {:?} on shutdown", peer);
                    break;
                }
                result = self.establish(stream) => {
                    if let Err(e) = result {
                        log_handshake_failure(peer, &e);
                    }
                }
            }
        }

        info!("SOCKS5 test proxy on {:?} stopped accepting", local_addr);
    }

    /// Negotiate one connection. On failure the stream is dropped, which
    /// closes it.
    async fn establish(&self, mut stream: TcpStream) -> Result<(), HandshakeError> {
        stream.set_nodelay(true)?;
        let digest = handshake::negotiate(&mut stream).await?;

        let stream = stream.into_std()?;
        info!(
            "Registered session '{}' from {:?}",
            digest,
            stream.peer_addr().ok()
        );
        self.registry.put(digest, stream);
        self.startup.fire();
        Ok(())
    }
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

fn log_handshake_failure(peer: Option<SocketAddr>, e: &HandshakeError) {
    if e.is_protocol_violation() {
        warn!("Rejected SOCKS5 client {:?}: {}", peer, e);
    } else {
        warn!("Handshake with {:?} failed: {}", peer, e);
    }
}
