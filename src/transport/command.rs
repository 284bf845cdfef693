use std::{
    io::{self, Read, Write},
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    process::{Child, Command, Stdio},
};

use tracing::{debug, warn};

use super::Transport;

/// A byte stream to a child process, wired to its stdin and stdout through a
/// socket pair.
///
/// The child is killed and reaped when the stream is dropped.
pub struct CommandStream {
    stream: UnixStream,
    child: Child,
    program: String,
}

impl CommandStream {
    /// Spawns `argv[0]` with the remaining arguments.
    pub fn spawn(argv: &[String]) -> io::Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command line"));
        };

        let (ours, theirs) = UnixStream::pair()?;
        let stdin = OwnedFd::from(theirs.try_clone()?);
        let stdout = OwnedFd::from(theirs);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!(program, pid = child.id(), "spawned transport command");

        Ok(Self {
            stream: ours,
            child,
            program: program.clone(),
        })
    }

    /// Process id of the child.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Err(e) = self.child.kill() {
            debug!(pid = self.child.id(), error = %e, "transport command already gone");
        }
        match self.child.wait() {
            Ok(status) => debug!(pid = self.child.id(), %status, "transport command exited"),
            Err(e) => warn!(pid = self.child.id(), error = %e, "failed to reap transport command"),
        }
    }
}

impl Read for CommandStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for CommandStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl AsRawFd for CommandStream {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Transport for CommandStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(nonblocking)
    }

    fn remote_addr(&self) -> Option<String> {
        Some(format!("{}[{}]", self.program, self.child.id()))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Command line reaching `socket_path` on `host` through ssh.
pub(super) fn ssh_argv(
    host: &str,
    port: Option<u16>,
    username: Option<&str>,
    netcat: Option<&str>,
    socket_path: &str,
) -> Vec<String> {
    let mut argv = vec!["ssh".to_string()];
    if let Some(port) = port {
        argv.extend(["-p".to_string(), port.to_string()]);
    }
    if let Some(user) = username {
        argv.extend(["-l".to_string(), user.to_string()]);
    }
    argv.extend(
        ["-T", "-e", "none", "-o", "BatchMode=yes", "--", host]
            .into_iter()
            .map(String::from),
    );
    let netcat = netcat.unwrap_or("nc");
    argv.push(format!("{} -U {}", shell_quote(netcat), shell_quote(socket_path)));
    argv
}
