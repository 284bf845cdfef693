use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
};

use tracing::debug;

use super::Transport;

pub(super) fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "TCP connect attempt failed");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no address found for {host}:{port}"))
    }))
}

impl Transport for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn local_addr(&self) -> Option<String> {
        TcpStream::local_addr(self).ok().map(|a| a.to_string())
    }

    fn remote_addr(&self) -> Option<String> {
        TcpStream::peer_addr(self).ok().map(|a| a.to_string())
    }
}
