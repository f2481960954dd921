use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// A single accepted connection.
///
/// The broker forgets the connection as soon as it is returned; whoever holds
/// this value owns the descriptor.
#[derive(Debug)]
pub struct ClientConnection {
    stream: UnixStream,
}

impl ClientConnection {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn into_stream(self) -> UnixStream {
        self.stream
    }

    /// Transfers the descriptor to a collaborator that speaks in integers.
    pub fn into_raw_fd(self) -> RawFd {
        self.stream.into_raw_fd()
    }

    /// Reads into `buf`, returning the byte count; `0` means the peer hung up.
    pub fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

impl AsRawFd for ClientConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsFd for ClientConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl From<ClientConnection> for OwnedFd {
    fn from(connection: ClientConnection) -> Self {
        OwnedFd::from(connection.stream)
    }
}
