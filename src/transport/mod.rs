//! Byte streams a [`Client`](`crate::Client`) can run over.
//!
//! Every transport is a non-blocking byte stream exposing its descriptor for
//! readiness polling. Reads and writes report `WouldBlock` when the socket is
//! not ready, and the connection's event loop retries them once the poller
//! says so.
//!
//! ```text
//!   Address::Unix ─────► UnixStream ─────────────────┐
//!   Address::Tcp ──────► TcpStream ──► [TlsStream] ──┤
//!   Address::Command ──► socketpair + child ─────────┼──► Box<dyn Transport>
//!   Address::Ssh ──────► socketpair + ssh child ─────┘
//! ```
mod command;
mod tcp;
#[cfg(feature = "tls")]
mod tls;
mod unix;

use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    path::PathBuf,
};

pub use command::CommandStream;
#[cfg(feature = "tls")]
pub use tls::TlsStream;

/// A connected byte stream.
///
/// Implementations must honour non-blocking mode once
/// [`set_nonblocking`](`Transport::set_nonblocking`) has been called: any
/// operation that cannot make progress fails with
/// [`io::ErrorKind::WouldBlock`].
pub trait Transport: Read + Write + AsRawFd + Send + 'static {
    /// Switches the underlying descriptor between blocking and non-blocking
    /// mode.
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Returns `true` if bytes were already pulled off the socket and are
    /// waiting in a user-space buffer, where the poller cannot see them.
    fn has_cached_data(&self) -> bool {
        false
    }

    /// Returns `true` if output is buffered inside the transport and must
    /// be flushed once the socket becomes writable.
    fn wants_write(&self) -> bool {
        false
    }

    /// Returns `true` if descriptors can be passed over this transport.
    fn has_pass_fd(&self) -> bool {
        false
    }

    /// Passes one descriptor to the peer.
    fn send_fd(&mut self, _fd: BorrowedFd<'_>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not pass file descriptors",
        ))
    }

    /// Receives one descriptor from the peer.
    fn recv_fd(&mut self) -> io::Result<OwnedFd> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not pass file descriptors",
        ))
    }

    fn local_addr(&self) -> Option<String> {
        None
    }

    fn remote_addr(&self) -> Option<String> {
        None
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A local UNIX domain socket.
    Unix(PathBuf),
    /// A TCP endpoint. With the `tls` feature and a TLS configuration on the
    /// builder, the session is encrypted and `host` is used for certificate
    /// verification.
    Tcp { host: String, port: u16 },
    /// An external program whose stdin and stdout are the byte stream.
    Command(Vec<String>),
    /// A UNIX socket on a remote host, reached by running a netcat-like tool
    /// through `ssh`.
    Ssh {
        host: String,
        port: Option<u16>,
        username: Option<String>,
        /// The tool run on the remote side, `nc` when unset.
        netcat: Option<String>,
        socket_path: String,
    },
}

impl Address {
    /// The hostname used for TLS certificate verification, if any.
    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Tcp { host, .. } | Address::Ssh { host, .. } => Some(host),
            Address::Unix(_) | Address::Command(_) => None,
        }
    }
}

/// Opens a blocking stream to `address`.
pub(crate) fn connect(address: &Address) -> io::Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match address {
        Address::Unix(path) => Box::new(unix::connect(path)?),
        Address::Tcp { host, port } => Box::new(tcp::connect(host, *port)?),
        Address::Command(argv) => Box::new(CommandStream::spawn(argv)?),
        Address::Ssh {
            host,
            port,
            username,
            netcat,
            socket_path,
        } => {
            let argv = command::ssh_argv(host, *port, username.as_deref(), netcat.as_deref(), socket_path);
            Box::new(CommandStream::spawn(&argv)?)
        }
    };
    Ok(transport)
}

/// Opens a TLS session to a TCP `address`.
#[cfg(feature = "tls")]
pub(crate) fn connect_tls(
    address: &Address,
    config: std::sync::Arc<rustls::ClientConfig>,
    hostname: Option<&str>,
) -> io::Result<Box<dyn Transport>> {
    let Address::Tcp { host, port } = address else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "TLS is only available over TCP",
        ));
    };
    let stream = tcp::connect(host, *port)?;
    let hostname = hostname.unwrap_or(host);
    Ok(Box::new(TlsStream::handshake(stream, config, hostname)?))
}

/// Like [`Read::read`] but reports `Ok(None)` instead of `WouldBlock` and
/// retries on `Interrupted`.
pub(crate) fn read_nonblocking<T: Transport + ?Sized>(t: &mut T, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        match t.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Like [`Write::write`] but reports `Ok(None)` instead of `WouldBlock` and
/// retries on `Interrupted`.
pub(crate) fn write_nonblocking<T: Transport + ?Sized>(t: &mut T, buf: &[u8]) -> io::Result<Option<usize>> {
    loop {
        match t.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}
