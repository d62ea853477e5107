use log::debug;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::proxy::handshake::{METHOD_NO_AUTH, REPLY_SUCCEEDED, SOCKS_VERSION};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Proxy rejected the request (reply code {0:#04x})")]
    Rejected(u8),
    #[error("Unexpected reply from proxy: {0:02x?}")]
    UnexpectedReply(Vec<u8>),
    #[error("Digest is {0} bytes long, at most 255 fit in a request")]
    DigestTooLong(usize),
}

const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN_NAME: u8 = 0x03;

/// Client half of the digest handshake: offers "no authentication" and sends
/// a connect request with `digest` in the domain-name field and port 0.
///
/// Returns the raw stream once the proxy has acknowledged the request.
pub async fn connect_with_digest(proxy: SocketAddr, digest: &str) -> Result<TcpStream, ClientError> {
    if digest.len() > u8::MAX as usize {
        return Err(ClientError::DigestTooLong(digest.len()));
    }

    let mut stream = TcpStream::connect(proxy).await?;
    stream.set_nodelay(true)?;

    stream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
        .await?;
    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != SOCKS_VERSION {
        return Err(ClientError::UnexpectedReply(selection.to_vec()));
    }
    if selection[1] != METHOD_NO_AUTH {
        return Err(ClientError::Rejected(selection[1]));
    }

    let request = connect_request(digest);
    stream.write_all(&request).await?;

    let mut reply = vec![0u8; request.len()];
    stream.read_exact(&mut reply).await?;
    if reply[1] != REPLY_SUCCEEDED {
        return Err(ClientError::Rejected(reply[1]));
    }
    if reply[0] != SOCKS_VERSION || reply[2..] != request[2..] {
        return Err(ClientError::UnexpectedReply(reply));
    }

    debug!("Negotiated digest '{}' with proxy {}", digest, proxy);
    Ok(stream)
}

fn connect_request(digest: &str) -> Vec<u8> {
    let mut request = Vec::with_capacity(7 + digest.len());
    request.extend_from_slice(&[
        SOCKS_VERSION,
        CMD_CONNECT,
        0x00,
        ATYP_DOMAIN_NAME,
        digest.len() as u8,
    ]);
    request.extend_from_slice(digest.as_bytes());
    request.extend_from_slice(&0u16.to_be_bytes());
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::server::Socks5TestProxy;
    use tokio::net::TcpListener;

    #[test]
    fn test_connect_request_layout() {
        assert_eq!(
            connect_request("abcd"),
            vec![0x05, 0x01, 0x00, 0x03, 0x04, b'a', b'b', b'c', b'd', 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_connect_with_digest_against_proxy() {
        let proxy = Socks5TestProxy::on_loopback().unwrap();

        let mut client = connect_with_digest(proxy.local_addr(), "e3b0c442")
            .await
            .unwrap();
        let mut server_side = proxy.get_connection("e3b0c442").await.unwrap().unwrap();

        server_side.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");

        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_digest_too_long() {
        let digest = "x".repeat(256);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = connect_with_digest(addr, &digest).await.unwrap_err();
        assert!(matches!(err, ClientError::DigestTooLong(256)));
    }

    #[tokio::test]
    async fn test_rejected_method_selection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let err = connect_with_digest(addr, "abcd").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected(0xFF)));
        server.await.unwrap();
    }
}
