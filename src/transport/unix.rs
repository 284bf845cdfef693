use std::{
    io, mem,
    os::{
        fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    path::Path,
    ptr,
};

use passfd::FdPassingExt;

use super::Transport;

/// In-band byte carried by every descriptor. Peers send and expect exactly
/// one per descriptor, between frames.
const FD_MARKER: [u8; 1] = [0];

/// Receives one descriptor along with its single in-band byte, leaving the
/// bytes of the next frame in the socket.
fn recv_fd(sock: RawFd) -> io::Result<OwnedFd> {
    let mut marker = 0u8;
    let mut iov = libc::iovec {
        iov_base: ptr::addr_of_mut!(marker).cast(),
        iov_len: 1,
    };
    // Backed by u64 words to satisfy the alignment of `cmsghdr`.
    // SAFETY: CMSG_SPACE only computes a size.
    let space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut control = vec![0u64; space.div_ceil(mem::size_of::<u64>())];

    // SAFETY: an all-zero msghdr is a valid empty message.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: every pointer in `msg` refers to a live local buffer of the
    // advertised length.
    let n = unsafe { libc::recvmsg(sock, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }

    // SAFETY: `msg` was filled by recvmsg, the header is checked before the
    // data is read.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() || (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "no descriptor attached"));
        }
        let raw = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
        let fd = OwnedFd::from_raw_fd(raw);
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

pub(super) fn connect(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}

fn describe(addr: io::Result<std::os::unix::net::SocketAddr>) -> Option<String> {
    let addr = addr.ok()?;
    match addr.as_pathname() {
        Some(path) => Some(path.display().to_string()),
        None => Some("unnamed".to_string()),
    }
}

impl Transport for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }

    fn has_pass_fd(&self) -> bool {
        true
    }

    fn send_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.as_raw_fd().send_fd_with_payload(fd.as_raw_fd(), &FD_MARKER)
    }

    fn recv_fd(&mut self) -> io::Result<OwnedFd> {
        recv_fd(self.as_raw_fd())
    }

    fn local_addr(&self) -> Option<String> {
        describe(UnixStream::local_addr(self))
    }

    fn remote_addr(&self) -> Option<String> {
        describe(UnixStream::peer_addr(self))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::fd::AsFd,
    };

    use super::*;

    #[test]
    fn unix_pass_fd() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        assert!(Transport::has_pass_fd(&a));

        // 1. Pass one end of another socket pair across
        let (passed, mut kept) = UnixStream::pair().unwrap();
        Transport::send_fd(&mut a, passed.as_fd()).unwrap();
        drop(passed);
        let received = Transport::recv_fd(&mut b).unwrap();

        let mut received = UnixStream::from(received);
        received.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        kept.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // 2. Data still flows on the socket itself
        a.write_all(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn unix_fd_marker() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let (passed, _kept) = UnixStream::pair().unwrap();

        // 1. One in-band byte per descriptor, nothing more
        Transport::send_fd(&mut a, passed.as_fd()).unwrap();
        Transport::set_nonblocking(&b, true).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 0);

        // 2. Receiving a descriptor leaves the next frame alone
        Transport::send_fd(&mut a, passed.as_fd()).unwrap();
        Transport::send_fd(&mut a, passed.as_fd()).unwrap();
        a.write_all(&[0, 0, 0, 28]).unwrap();
        Transport::recv_fd(&mut b).unwrap();
        Transport::recv_fd(&mut b).unwrap();
        let mut len = [0u8; 4];
        b.read_exact(&mut len).unwrap();
        assert_eq!(len, [0, 0, 0, 28]);

        // 3. Nothing pending
        let err = Transport::recv_fd(&mut b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn unix_nonblocking() {
        let (mut a, _b) = UnixStream::pair().unwrap();
        Transport::set_nonblocking(&a, true).unwrap();

        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
