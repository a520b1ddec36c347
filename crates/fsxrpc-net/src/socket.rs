//! Blocking IPv4 stream sockets with deadline-bounded reliable I/O.
//!
//! Addresses and ports cross this API in host byte order. A socket is owned
//! by exactly one thread or bulk descriptor at a time and is closed on drop.

use std::io::{self, ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, error};

use crate::deadline::Deadline;
use crate::error::{NetError, NetResult, SocketSetupError};

/// An IPv4 TCP socket.
#[derive(Debug)]
pub struct StreamSocket {
    inner: Socket,
}

fn sockaddr(ip: u32, port: u16) -> SockAddr {
    let ip = if ip == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(ip)
    };
    SocketAddrV4::new(ip, port).into()
}

impl StreamSocket {
    /// Creates a socket with `SO_REUSEADDR`, bound to `local_ip:local_port`
    /// only when either is non-zero.
    ///
    /// A bind failing with "address in use" is the only non-fatal outcome.
    pub fn create(local_ip: u32, local_port: u16) -> Result<Self, SocketSetupError> {
        let inner = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
            error!(error = %e, "can't create socket");
            SocketSetupError::fatal(e)
        })?;

        inner.set_reuse_address(true).map_err(|e| {
            error!(error = %e, "can't set SO_REUSEADDR for socket");
            SocketSetupError::fatal(e)
        })?;

        if local_ip != 0 || local_port != 0 {
            if let Err(e) = inner.bind(&sockaddr(local_ip, local_port)) {
                if e.raw_os_error() == Some(libc::EADDRINUSE) {
                    debug!(port = local_port, "port already in use");
                    return Err(SocketSetupError::retryable(e));
                }
                error!(port = local_port, error = %e, "error trying to bind to port");
                return Err(SocketSetupError::fatal(e));
            }
        }

        Ok(Self { inner })
    }

    /// Creates a listening socket on `local_ip:local_port`.
    pub fn listen(local_ip: u32, local_port: u16, backlog: i32) -> NetResult<Self> {
        let sock = Self::create(local_ip, local_port).map_err(|e| {
            if !e.is_fatal() {
                error!(port = local_port, "can't create socket: port already in use");
            }
            NetError::from(e)
        })?;

        sock.inner.listen(backlog).map_err(|e| {
            error!(backlog, error = %e, "can't set listen backlog");
            NetError::IoError(e)
        })?;
        Ok(sock)
    }

    /// Accepts one connection, blocking until a peer shows up.
    ///
    /// If nothing is pending the thread sleeps until the listener becomes
    /// readable and tries exactly once more. The listener is back in
    /// blocking mode when this returns, whatever the outcome.
    pub fn accept(&self) -> NetResult<Self> {
        self.inner.set_nonblocking(true)?;
        let attempt = self.accept_once_or_after_wait();
        self.inner.set_nonblocking(false)?;

        let inner = attempt?;
        inner.set_nonblocking(false)?;
        Ok(Self { inner })
    }

    fn accept_once_or_after_wait(&self) -> NetResult<Socket> {
        let accepted = match self.inner.accept() {
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.wait_readable()?;
                self.inner.accept()
            }
            other => other,
        };

        let (inner, _) = accepted.map_err(|e| {
            debug!(error = %e, "accept failed");
            NetError::IoError(e)
        })?;
        Ok(inner)
    }

    fn wait_readable(&self) -> NetResult<()> {
        let mut pfd = libc::pollfd {
            fd: self.inner.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            // a signal counts as a wakeup; the retry decides
            if e.kind() != ErrorKind::Interrupted {
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Connects to `peer_ip:peer_port` from `local_ip:local_port`.
    ///
    /// "Address not available" is non-fatal: the local port is probably
    /// already connected to the same peer by another connection, so the
    /// caller should retry from a different local port.
    pub fn connect(
        local_ip: u32,
        local_port: u16,
        peer_ip: u32,
        peer_port: u16,
    ) -> Result<Self, SocketSetupError> {
        let sock = Self::create(local_ip, local_port)?;

        match sock.inner.connect(&sockaddr(peer_ip, peer_port)) {
            Ok(()) => Ok(sock),
            Err(e) => {
                let fatal = e.raw_os_error() != Some(libc::EADDRNOTAVAIL);
                let (local, peer) = (Ipv4Addr::from(local_ip), Ipv4Addr::from(peer_ip));
                if fatal {
                    error!(%local, local_port, %peer, peer_port, error = %e, "error connecting");
                } else {
                    debug!(%local, local_port, %peer, peer_port, error = %e, "error connecting");
                }
                Err(SocketSetupError {
                    fatal,
                    source: e.into(),
                })
            }
        }
    }

    /// Sends all of `buf` within `timeout`.
    ///
    /// The send timeout is reset to the time still left before every send.
    /// A zero `timeout` means a single best-effort non-blocking pass: if the
    /// whole buffer can't be queued immediately, [`NetError::WouldBlock`].
    pub fn write(&self, buf: &[u8], timeout: Duration) -> NetResult<()> {
        if buf.is_empty() {
            return Err(NetError::InvalidArgument("empty write".to_string()));
        }

        let deadline = Deadline::new(timeout);
        let nonblocking = timeout.is_zero();
        let flags = libc::MSG_NOSIGNAL | if nonblocking { libc::MSG_DONTWAIT } else { 0 };
        let mut sent = 0;

        loop {
            if !nonblocking {
                let tv = deadline.socket_timeout();
                self.inner.set_write_timeout(Some(tv)).map_err(|e| {
                    error!(timeout_us = tv.as_micros() as u64, error = %e, "can't set socket send timeout");
                    NetError::IoError(e)
                })?;
            }

            match self.inner.send_with_flags(&buf[sent..], flags) {
                Ok(0) => {
                    error!("unexpected zero-byte send");
                    return Err(NetError::ConnectionAborted);
                }
                Ok(n) => {
                    sent += n;
                    if sent == buf.len() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    debug!(sent, total = buf.len(), "send would block");
                    return Err(NetError::WouldBlock);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }

            if deadline.is_expired() {
                debug!(sent, total = buf.len(), "send deadline exhausted");
                return Err(NetError::WouldBlock);
            }
        }
    }

    /// Fills `buf` within `timeout`, which must be non-zero.
    ///
    /// The receive timeout is reset to the time still left before every
    /// receive. A zero-byte receive means the peer closed the connection.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> NetResult<()> {
        if buf.is_empty() {
            return Err(NetError::InvalidArgument("empty read".to_string()));
        }
        if timeout.is_zero() {
            return Err(NetError::InvalidArgument("read timeout must be non-zero".to_string()));
        }

        let deadline = Deadline::new(timeout);
        let timed_out = || NetError::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
        };
        let mut received = 0;

        loop {
            let tv = deadline.socket_timeout();
            self.inner.set_read_timeout(Some(tv)).map_err(|e| {
                error!(timeout_us = tv.as_micros() as u64, error = %e, "can't set socket recv timeout");
                NetError::IoError(e)
            })?;

            match (&self.inner).read(&mut buf[received..]) {
                Ok(0) => return Err(NetError::ConnectionReset),
                Ok(n) => {
                    received += n;
                    if received == buf.len() {
                        return Ok(());
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    debug!(received, total = buf.len(), "receive timed out");
                    return Err(timed_out());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }

            if deadline.is_expired() {
                debug!(received, total = buf.len(), "receive deadline exhausted");
                return Err(timed_out());
            }
        }
    }

    /// Sets `SO_SNDBUF`/`SO_RCVBUF`; a zero size leaves that buffer alone.
    pub fn set_buffer_sizes(&self, tx: usize, rx: usize) -> NetResult<()> {
        if tx != 0 {
            self.inner.set_send_buffer_size(tx).map_err(|e| {
                error!(size = tx, error = %e, "can't set send buffer");
                NetError::IoError(e)
            })?;
        }
        if rx != 0 {
            self.inner.set_recv_buffer_size(rx).map_err(|e| {
                error!(size = rx, error = %e, "can't set receive buffer");
                NetError::IoError(e)
            })?;
        }
        Ok(())
    }

    /// Returns the effective `(send, receive)` buffer sizes.
    pub fn buffer_sizes(&self) -> NetResult<(usize, usize)> {
        Ok((
            self.inner.send_buffer_size()?,
            self.inner.recv_buffer_size()?,
        ))
    }

    /// Local `(ip, port)` in host order.
    pub fn local_addr(&self) -> NetResult<(u32, u16)> {
        self.addr(false)
    }

    /// Peer `(ip, port)` in host order.
    pub fn peer_addr(&self) -> NetResult<(u32, u16)> {
        self.addr(true)
    }

    fn addr(&self, remote: bool) -> NetResult<(u32, u16)> {
        let which = if remote { "peer" } else { "local" };
        let addr = if remote {
            self.inner.peer_addr()
        } else {
            self.inner.local_addr()
        }
        .map_err(|e| {
            error!(which, error = %e, "error getting sock IP/port");
            NetError::IoError(e)
        })?;

        let v4 = addr
            .as_socket_ipv4()
            .ok_or_else(|| NetError::InvalidArgument(format!("{} address is not IPv4", which)))?;
        Ok((u32::from(*v4.ip()), v4.port()))
    }
}

impl AsRawFd for StreamSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
