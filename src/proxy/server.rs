use log::{debug, error, info};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::common::config::ProxyConfig;
use crate::net::endpoint::{self, Endpoint};
use crate::proxy::acceptor::SessionAcceptor;
use crate::proxy::registry::ConnectionRegistry;
use crate::proxy::session::SessionStream;
use crate::proxy::startup::StartupSignal;

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("No SOCKS5 client completed a handshake within {0:?}")]
    StartupTimeout(Duration),
}

/// Local SOCKS5 proxy for tests.
///
/// Clients negotiate "no authentication" and send a connect request whose
/// domain-name field carries a digest. The proxy does not connect anywhere;
/// it keeps the negotiated socket so the test can fetch it by digest with
/// [`get_connection`](Self::get_connection) and talk to the client directly.
///
/// Construction spawns the accept loop on the current Tokio runtime. Call
/// [`stop`](Self::stop) to shut down, wait for the loop and release every
/// registered session; dropping the proxy closes the endpoint without
/// waiting.
pub struct Socks5TestProxy {
    endpoint: Endpoint,
    registry: Arc<ConnectionRegistry>,
    startup: Arc<StartupSignal>,
    startup_timeout: Duration,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Socks5TestProxy {
    /// Bind an ephemeral loopback port and start serving.
    pub fn on_loopback() -> Result<Self, ProxyError> {
        Self::start(endpoint::bind_loopback()?)
    }

    pub fn bind(addr: SocketAddr) -> Result<Self, ProxyError> {
        Self::start(endpoint::bind_listener(addr)?)
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let listener = endpoint::bind_listener(config.listen_socket_addr()?)?;
        Self::with_startup_timeout(listener, config.startup_timeout())
    }

    /// Start serving on an already bound listener.
    pub fn start(listener: TcpListener) -> Result<Self, ProxyError> {
        Self::with_startup_timeout(listener, DEFAULT_STARTUP_TIMEOUT)
    }

    pub fn with_startup_timeout(
        listener: TcpListener,
        startup_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let endpoint = Endpoint::new(listener.local_addr()?);
        let registry = Arc::new(ConnectionRegistry::new());
        let startup = Arc::new(StartupSignal::new());

        let acceptor = SessionAcceptor::new(registry.clone(), startup.clone());
        let task = tokio::spawn(acceptor.run(listener, endpoint.close_signal()));

        Ok(Socks5TestProxy {
            endpoint,
            registry,
            startup,
            startup_timeout,
            acceptor: Mutex::new(Some(task)),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.endpoint.is_closed()
    }

    /// Best-effort host address clients can reach the proxy on. `None` if the
    /// proxy listens on the unspecified address and `localhost` does not
    /// resolve.
    pub fn address(&self) -> Option<String> {
        let ip = self.endpoint.local_addr().ip();
        if !ip.is_unspecified() {
            return Some(ip.to_string());
        }
        ("localhost", 0)
            .to_socket_addrs()
            .ok()?
            .next()
            .map(|addr| addr.ip().to_string())
    }

    /// The bound port, or `None` once the proxy has been stopped.
    pub fn port(&self) -> Option<u16> {
        if !self.is_running() {
            return None;
        }
        Some(self.endpoint.local_addr().port())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Fetch the connection a client negotiated with `digest`. Dropping the
    /// returned stream closes the session.
    ///
    /// Until the first handshake completes this waits up to the startup
    /// timeout and fails with [`ProxyError::StartupTimeout`] if none does.
    /// Afterwards it returns immediately, with `None` for unknown digests.
    /// Later handshakes do not re-arm the wait: once any client has
    /// connected, a digest that has not arrived yet is simply `None`.
    pub async fn get_connection(
        &self,
        digest: &str,
    ) -> Result<Option<SessionStream>, ProxyError> {
        if !self.startup.wait(self.startup_timeout).await {
            return Err(ProxyError::StartupTimeout(self.startup_timeout));
        }

        match self.registry.get(digest)? {
            Some(stream) => Ok(Some(SessionStream::new(digest, stream)?)),
            None => {
                debug!("No session registered for digest '{}'", digest);
                Ok(None)
            }
        }
    }

    /// Close the endpoint, wait for the accept loop to exit and shut down the
    /// registered sessions. Concurrent callers all wait for the loop; calls
    /// after that do nothing.
    pub async fn stop(&self) {
        let mut acceptor = self.acceptor.lock().await;
        if self.endpoint.close() {
            info!("Stopping SOCKS5 test proxy on {}", self.endpoint.local_addr());
        }

        if let Some(task) = acceptor.take() {
            if let Err(e) = task.await {
                error!("Accept loop did not shut down cleanly: {}", e);
            }
            let released = self.registry.close_all();
            debug!("Released {} session(s)", released);
        }
    }

    pub async fn close(&self) {
        self.stop().await
    }
}

impl Drop for Socks5TestProxy {
    fn drop(&mut self) {
        self.endpoint.close();
        if let Some(task) = self.acceptor.get_mut().take() {
            task.abort();
        }
    }
}
