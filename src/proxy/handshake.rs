use log::debug;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Unsupported SOCKS version: {0:#04x}")]
    InvalidVersion(u8),
    #[error("No acceptable authentication method")]
    NoAcceptableAuthMethod,
}

impl HandshakeError {
    /// True for failures caused by the peer speaking something other than
    /// the supported SOCKS5 subset, as opposed to transport failures.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, HandshakeError::IoError(_))
    }
}

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Offset of the length byte of the domain-name address field.
const DIGEST_LEN_OFFSET: usize = 4;
/// `VER CMD RSV ATYP LEN`
const REQUEST_HEADER_LEN: usize = 5;
/// `DST.PORT` trailing the address field.
const PORT_LEN: usize = 2;

/// Runs the server side of the SOCKS5 negotiation and returns the digest
/// carried in the connect request.
///
/// On success the stream is positioned right after the connect request, so
/// whatever the client sends next is left for the caller.
pub async fn negotiate<S>(stream: &mut S) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    select_auth_method(stream).await?;

    let mut request = read_connect_request(stream).await?;
    let digest = extract_digest(&request);
    debug!("Connect request carries digest '{}'", digest);

    request[1] = REPLY_SUCCEEDED;
    stream.write_all(&request).await?;
    stream.flush().await?;

    Ok(digest)
}

/// Greeting and method selection. Only "no authentication" is offered.
async fn select_auth_method<S>(stream: &mut S) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(HandshakeError::InvalidVersion(version));
    }

    let nmethods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        return Err(HandshakeError::NoAcceptableAuthMethod);
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads a connect request laid out as a domain-name request:
/// +-----+-----+-----+------+-----+----------+----------+
/// | VER | CMD | RSV | ATYP | LEN |  DIGEST  | DST.PORT |
/// +-----+-----+-----+------+-----+----------+----------+
/// |  1  |  1  |  1  |  1   |  1  |   LEN    |    2     |
/// +-----+-----+-----+------+-----+----------+----------+
///
/// Only LEN and DIGEST are interpreted; the rest is echoed back verbatim.
async fn read_connect_request<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; REQUEST_HEADER_LEN];
    stream.read_exact(&mut header).await?;

    let digest_len = header[DIGEST_LEN_OFFSET] as usize;
    let mut request = vec![0u8; REQUEST_HEADER_LEN + digest_len + PORT_LEN];
    request[..REQUEST_HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut request[REQUEST_HEADER_LEN..]).await?;

    Ok(request)
}

fn extract_digest(request: &[u8]) -> String {
    let digest_len = request[DIGEST_LEN_OFFSET] as usize;
    let digest = &request[REQUEST_HEADER_LEN..REQUEST_HEADER_LEN + digest_len];
    String::from_utf8_lossy(digest).into_owned()
}
