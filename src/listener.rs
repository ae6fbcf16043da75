//! TCP listener (C6): the dual-stack socket viewers connect to.
//!
//! Grounded in `examples/original_source/c_socket_server_ref_impl.c`'s
//! `getaddrinfo`/bind-first-that-works/`SO_REUSEADDR`/`listen(..., 10)`
//! sequence, ported onto `socket2::Socket` since `std::net::TcpListener`
//! offers no way to set `SO_REUSEADDR` before `bind`. `socket2` is already in
//! the dependency lists of `other_examples/manifests/wez-wezterm` and
//! `gtwatts-wezterm`.

use std::net::{SocketAddr, TcpListener as StdTcpListener};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

/// Backlog passed to `listen(2)`, matching the reference implementation.
const BACKLOG: i32 = 10;

/// Binds a nonblocking, dual-stack-first TCP listener on `port`.
///
/// Tries an IPv6 wildcard bind (`[::]:port`, with `IPV6_V6ONLY` left off so
/// IPv4 viewers still connect) first, then falls back to an IPv4 wildcard
/// bind if IPv6 is unavailable on this host, the Rust equivalent of walking
/// `getaddrinfo`'s result list until one candidate binds.
pub fn bind(port: u16) -> Result<StdTcpListener> {
    let candidates: [SocketAddr; 2] = [
        SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port),
        SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port),
    ];

    let mut last_err = None;
    for addr in candidates {
        match bind_one(addr) {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.expect("candidates is non-empty")).context("failed to bind IPv4 or IPv6 listener")
}

fn bind_one(addr: SocketAddr) -> Result<StdTcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("socket(2)")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if addr.is_ipv6() {
        // Accept IPv4 viewers on the same dual-stack socket when the
        // platform supports it; ignore failures (some platforms, or
        // IPv6-disabled hosts, reject this and the caller falls back to the
        // plain IPv4 bind candidate instead).
        let _ = socket.set_only_v6(false);
    }

    socket.bind(&addr.into()).context("bind(2)")?;
    socket.listen(BACKLOG).context("listen(2)")?;
    socket.set_nonblocking(true).context("set nonblocking")?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[test]
    fn bind_accepts_a_loopback_connection() -> Result<()> {
        let listener = bind(0)?;
        let addr = listener.local_addr()?;

        let mut client = TcpStream::connect(("127.0.0.1", addr.port()))?;
        // The listener is nonblocking; give the kernel a moment to queue
        // the connection before accepting.
        std::thread::sleep(std::time::Duration::from_millis(50));

        let (mut server_side, _peer) = listener.accept()?;
        client.write_all(b"hi")?;
        let mut buf = [0u8; 2];
        server_side.read_exact(&mut buf)?;
        assert_eq!(&buf, b"hi");
        Ok(())
    }

    #[test]
    fn bind_is_nonblocking_with_no_pending_connection() {
        let listener = bind(0).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
