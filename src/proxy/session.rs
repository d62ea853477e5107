use log::debug;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A negotiated connection handed to the caller of `get_connection`.
///
/// Dropping it shuts the connection down, so the client sees EOF even though
/// the proxy still holds a descriptor of the same socket.
#[derive(Debug)]
pub struct SessionStream {
    digest: String,
    stream: TcpStream,
    closer: std::net::TcpStream,
}

impl SessionStream {
    /// `stream` must be a non-blocking descriptor of a connected socket.
    pub(crate) fn new(digest: &str, stream: std::net::TcpStream) -> io::Result<Self> {
        let closer = stream.try_clone()?;
        Ok(SessionStream {
            digest: digest.to_string(),
            stream: TcpStream::from_std(stream)?,
            closer,
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn inner(&self) -> &TcpStream {
        &self.stream
    }

    pub fn inner_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if let Err(e) = self.closer.shutdown(Shutdown::Both) {
            debug!("Session '{}' was already closed: {}", self.digest, e);
        }
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn session_pair(digest: &str) -> (TcpStream, SessionStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let session = SessionStream::new(digest, server.into_std().unwrap()).unwrap();
        (client, session)
    }

    #[tokio::test]
    async fn test_session_reads_and_writes() {
        let (mut client, mut session) = session_pair("abcd").await;
        assert_eq!(session.digest(), "abcd");
        assert_eq!(session.peer_addr().unwrap(), client.local_addr().unwrap());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        session.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        session.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_drop_closes_connection_despite_other_descriptor() {
        let (mut client, session) = session_pair("abcd").await;
        let _other = session.closer.try_clone().unwrap();

        drop(session);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(std::time::Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);
    }
}
