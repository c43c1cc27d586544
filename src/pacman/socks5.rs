//! SOCKS5 front-end server (§4.12): accepts inbound SOCKS5 client
//! connections off the mux and relays `CONNECT` through the routing
//! dialer. No-auth only; every other SOCKS5 command gets "command not
//! supported" per RFC 1928 §6, the same rejection shape the outbound
//! client in `dialer/socks5.rs` checks for on the other end of the wire.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::pacman::dialer::by_host::ByHost;
use crate::pacman::dialer::ContextDialer;
use crate::pacman::error::PacmanError;
use crate::pacman::mux::{MuxConn, SubListener};

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xff;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;

pub async fn serve(mut listener: SubListener, by_host: Arc<ByHost>) {
    while let Some(conn) = listener.accept().await {
        let by_host = by_host.clone();
        tokio::spawn(async move {
            if let Err(err) = handle(conn, &by_host).await {
                tracing::debug!(error = %err, "socks5: connection ended with an error");
            }
        });
    }
}

async fn handle(mut conn: MuxConn, by_host: &ByHost) -> io::Result<()> {
    if !greet(&mut conn.stream).await? {
        return Ok(());
    }

    let (cmd, target) = match read_request(&mut conn.stream).await {
        Ok(v) => v,
        Err(err) => {
            reply(&mut conn.stream, REPLY_HOST_UNREACHABLE).await?;
            return Err(err);
        }
    };

    if cmd != CMD_CONNECT {
        reply(&mut conn.stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }

    let mut upstream = match by_host.dial("tcp", &target).await {
        Ok(upstream) => upstream,
        Err(err) => {
            let typed = PacmanError::UpstreamDialError(err);
            tracing::debug!(%target, error = %typed, "socks5: dial failed");
            reply(&mut conn.stream, REPLY_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };

    reply(&mut conn.stream, REPLY_SUCCESS).await?;
    tokio::io::copy_bidirectional(&mut conn.stream, &mut *upstream).await?;
    Ok(())
}

/// Reads the client's method-selection greeting and replies. Returns
/// `false` (having already replied `AUTH_NO_ACCEPTABLE`) when the client
/// did not offer no-auth.
async fn greet(stream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin)) -> io::Result<bool> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(protocol_error("unsupported SOCKS version in greeting"));
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, AUTH_NONE]).await?;
        Ok(true)
    } else {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await?;
        Ok(false)
    }
}

async fn read_request(
    stream: &mut (impl tokio::io::AsyncRead + Unpin),
) -> io::Result<(u8, String)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(protocol_error("unsupported SOCKS version in request"));
    }
    let cmd = header[1];
    let atyp = header[3];

    let host = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            Ipv4Addr::from(buf).to_string()
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            Ipv6Addr::from(buf).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize];
            stream.read_exact(&mut buf).await?;
            String::from_utf8(buf).map_err(|_| protocol_error("non-UTF8 domain in SOCKS5 request"))?
        }
        other => return Err(protocol_error(&format!("unknown ATYP: {other}"))),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok((cmd, format!("{host}:{port}")))
}

/// Replies with `code` and an all-zero bound address -- this front-end
/// never actually binds a distinct relay socket, so it has no real
/// BND.ADDR/BND.PORT to report.
async fn reply(
    stream: &mut (impl tokio::io::AsyncWrite + Unpin),
    code: u8,
) -> io::Result<()> {
    let mut resp = vec![VERSION, code, 0x00, ATYP_IPV4];
    resp.extend_from_slice(&[0, 0, 0, 0]);
    resp.extend_from_slice(&[0, 0]);
    stream.write_all(&resp).await?;
    stream.flush().await
}

fn protocol_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, PacmanError::ProtocolError(msg.to_string()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn greet_accepts_no_auth() {
        let (mut client, mut server) = duplex(64);
        let task = tokio::spawn(async move { greet(&mut server).await });

        client.write_all(&[VERSION, 1, AUTH_NONE]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [VERSION, AUTH_NONE]);
        assert!(task.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn greet_rejects_when_no_auth_not_offered() {
        let (mut client, mut server) = duplex(64);
        let task = tokio::spawn(async move { greet(&mut server).await });

        client.write_all(&[VERSION, 1, 0x02]).await.unwrap();
        let mut resp = [0u8; 2];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(resp, [VERSION, AUTH_NO_ACCEPTABLE]);
        assert!(!task.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn reads_domain_connect_request() {
        let (mut client, mut server) = duplex(256);
        let task = tokio::spawn(async move { read_request(&mut server).await });

        let mut req = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN];
        req.push(b"example.com".len() as u8);
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let (cmd, target) = task.await.unwrap().unwrap();
        assert_eq!(cmd, CMD_CONNECT);
        assert_eq!(target, "example.com:443");
    }
}
