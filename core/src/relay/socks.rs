//! Minimal SOCKS5 CONNECT handshake for reaching the rendezvous server
//! through a local anonymizing proxy.
//!
//! Only what the relay leg needs: no authentication, domain addressing so
//! `.onion` hosts resolve inside the proxy, IPv4/IPv6 reply parsing.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS handshake errors
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("Proxy I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Proxy refused our authentication methods")]
    MethodRejected,
    #[error("Proxy replied with SOCKS version {0}")]
    BadVersion(u8),
    #[error("Host name too long for SOCKS addressing")]
    HostTooLong,
    #[error("CONNECT rejected by proxy (reply code {0})")]
    ConnectRejected(u8),
}

/// Open a TCP connection to `host:port` through the SOCKS5 proxy at `proxy`.
///
/// The host is always sent as a domain name; the proxy resolves it, which is
/// required for onion addresses.
pub async fn connect(proxy: &str, host: &str, port: u16) -> Result<TcpStream, SocksError> {
    if host.len() > 255 {
        return Err(SocksError::HostTooLong);
    }

    let mut stream = TcpStream::connect(proxy).await?;

    // Method negotiation: we offer no-auth only
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(reply[0]));
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(SocksError::MethodRejected);
    }

    // CONNECT request with domain addressing
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(head[0]));
    }
    if head[1] != 0x00 {
        return Err(SocksError::ConnectRejected(head[1]));
    }
    let bind_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(SocksError::BadVersion(other)),
    };
    let mut bind = vec![0u8; bind_len + 2];
    stream.read_exact(&mut bind).await?;

    Ok(stream)
}

// ============================================================================
// TESTS
// ============================================================================
