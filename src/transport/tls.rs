use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
};

use rustls::{ClientConfig, ClientConnection, pki_types::ServerName};
use tracing::{debug, trace};

use super::Transport;

/// Byte the server sends once it accepted the TLS session.
const SESSION_ACCEPTED: u8 = 1;

/// A TLS session over another transport.
///
/// Decrypted bytes may sit in the session buffer after the socket has been
/// drained, so the connection must ask
/// [`has_cached_data`](`Transport::has_cached_data`) before going to sleep.
pub struct TlsStream<T> {
    conn: ClientConnection,
    sock: T,
    /// Plaintext bytes decrypted but not handed out yet.
    cached: usize,
}

impl<T> TlsStream<T>
where
    T: Transport,
{
    /// Runs the handshake in blocking mode, then waits for the server to
    /// confirm the session.
    pub fn handshake(sock: T, config: Arc<ClientConfig>, hostname: &str) -> io::Result<Self> {
        sock.set_nonblocking(false)?;

        let name = ServerName::try_from(hostname.to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let conn = ClientConnection::new(config, name).map_err(io::Error::other)?;

        let mut stream = Self { conn, sock, cached: 0 };
        while stream.conn.is_handshaking() {
            stream.conn.complete_io(&mut stream.sock)?;
        }
        debug!(hostname, "TLS handshake complete");

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack)?;
        if ack[0] != SESSION_ACCEPTED {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "server refused the TLS session",
            ));
        }

        Ok(stream)
    }

    fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(n) => trace!(bytes = n, "TLS records written"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<T> Read for TlsStream<T>
where
    T: Transport,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => {
                    self.cached = self.cached.saturating_sub(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if self.conn.read_tls(&mut self.sock)? == 0 {
                return Ok(0);
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.cached = state.plaintext_bytes_to_read();
            // Alerts and key updates
            self.flush_tls()?;
        }
    }
}

impl<T> Write for TlsStream<T>
where
    T: Transport,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_tls()?;
        if self.conn.wants_write() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = self.conn.writer().write(buf)?;
        self.flush_tls()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_tls()
    }
}

impl<T> AsRawFd for TlsStream<T>
where
    T: AsRawFd,
{
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl<T> Transport for TlsStream<T>
where
    T: Transport,
{
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.sock.set_nonblocking(nonblocking)
    }

    fn has_cached_data(&self) -> bool {
        self.cached > 0
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn local_addr(&self) -> Option<String> {
        self.sock.local_addr()
    }

    fn remote_addr(&self) -> Option<String> {
        self.sock.remote_addr()
    }

    fn is_encrypted(&self) -> bool {
        true
    }
}
