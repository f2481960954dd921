use std::fs::{self, Permissions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::error::BrokerError;
use crate::path::remove_stale_entry;

pub const DEFAULT_BACKLOG: u32 = 5;
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Peers run as a different, less-privileged user and must be able to connect.
const WORLD_ACCESSIBLE: u32 = 0o777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerOptions {
    pub backlog: u32,
    pub accept_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Unbound,
    Listening,
    Closed,
}

#[derive(Debug)]
pub enum AcceptOutcome {
    Connected(ClientConnection),
    /// Nothing connected before the wait elapsed. Callers usually retry.
    Timeout,
}

#[derive(Debug)]
struct ListeningEndpoint {
    path: PathBuf,
    listener: UnixListener,
}

/// Owner of the single listening endpoint.
#[derive(Debug)]
pub struct ConnectionBroker {
    options: BrokerOptions,
    endpoint: Option<ListeningEndpoint>,
    /// Path of the most recent endpoint, kept after `close` so the next
    /// `bind` can unlink it.
    last_path: Option<PathBuf>,
    state: EndpointState,
}

impl Default for ConnectionBroker {
    fn default() -> Self {
        Self::new(BrokerOptions::default())
    }
}

impl ConnectionBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            options,
            endpoint: None,
            last_path: None,
            state: EndpointState::Unbound,
        }
    }

    pub fn options(&self) -> BrokerOptions {
        self.options
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn local_path(&self) -> Option<&Path> {
        self.endpoint.as_ref().map(|endpoint| endpoint.path.as_path())
    }

    pub fn listener_fd(&self) -> Option<RawFd> {
        self.endpoint
            .as_ref()
            .map(|endpoint| endpoint.listener.as_raw_fd())
    }

    /// Replaces any current endpoint with a fresh socket listening at `path`.
    ///
    /// The previous endpoint is closed and its socket file unlinked, and a
    /// stale entry at `path` is removed. On failure the broker is left
    /// `Unbound` with nothing open.
    pub fn bind(&mut self, path: impl AsRef<Path>) -> Result<(), BrokerError> {
        let path = path.as_ref();
        self.close();
        self.state = EndpointState::Unbound;
        if let Some(previous) = self.last_path.take() {
            if let Err(err) = remove_stale_entry(&previous) {
                warn!(path = %previous.display(), error = %err, "failed to unlink previous socket");
            }
        }

        let listener = open_listener(path, self.options.backlog).map_err(|source| {
            warn!(path = %path.display(), error = %source, "failed to bind local socket");
            BrokerError::BindFailed {
                path: path.to_path_buf(),
                source,
            }
        })?;

        info!(
            path = %path.display(),
            fd = listener.as_raw_fd(),
            backlog = self.options.backlog,
            "local socket listening"
        );
        self.endpoint = Some(ListeningEndpoint {
            path: path.to_path_buf(),
            listener,
        });
        self.last_path = Some(path.to_path_buf());
        self.state = EndpointState::Listening;
        Ok(())
    }

    /// Waits at most `timeout` for one peer and returns its connection.
    pub fn accept_once(&self, timeout: Duration) -> Result<AcceptOutcome, BrokerError> {
        let endpoint = self.endpoint.as_ref().ok_or(BrokerError::NotListening)?;
        // `None` when the timeout is too large to represent: wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            let mut fds = [PollFd::new(endpoint.listener.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout(remaining)) {
                Ok(0) => {}
                Ok(_) => match endpoint.listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).map_err(BrokerError::Accept)?;
                        let connection = ClientConnection::new(stream);
                        debug!(fd = connection.as_raw_fd(), "accepted client connection");
                        return Ok(AcceptOutcome::Connected(connection));
                    }
                    // The peer went away between readiness and accept.
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) => {}
                    Err(err) => return Err(BrokerError::Accept(err)),
                },
                Err(Errno::EINTR) => {}
                Err(errno) => return Err(BrokerError::Wait(errno.into())),
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(AcceptOutcome::Timeout);
            }
        }
    }

    /// [`accept_once`](Self::accept_once) with the configured default timeout.
    pub fn accept_default(&self) -> Result<AcceptOutcome, BrokerError> {
        self.accept_once(self.options.accept_timeout)
    }

    /// Closes the endpoint. The socket file stays until the next `bind`
    /// or an explicit [`unlink`](Self::unlink).
    pub fn close(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            debug!(path = %endpoint.path.display(), "closing local socket");
        }
        self.state = EndpointState::Closed;
    }

    pub fn unlink(path: impl AsRef<Path>) -> io::Result<()> {
        remove_stale_entry(path.as_ref())
    }
}

fn open_listener(path: &Path, backlog: u32) -> io::Result<UnixListener> {
    let fd: OwnedFd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    remove_stale_entry(path)?;
    let addr = UnixAddr::new(path)?;
    socket::bind(fd.as_raw_fd(), &addr)?;

    match start_listening(path, fd, backlog) {
        Ok(listener) => Ok(listener),
        Err(err) => {
            let _ = fs::remove_file(path);
            Err(err)
        }
    }
}

fn start_listening(path: &Path, fd: OwnedFd, backlog: u32) -> io::Result<UnixListener> {
    fs::set_permissions(path, Permissions::from_mode(WORLD_ACCESSIBLE))?;
    let backlog = i32::try_from(backlog).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("listen backlog {backlog} is out of range"),
        )
    })?;
    socket::listen(&fd, Backlog::new(backlog)?)?;
    let listener = UnixListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Rounds up to whole milliseconds so a wait never ends before `remaining`.
/// Longer waits are split across loop iterations.
fn poll_timeout(remaining: Duration) -> PollTimeout {
    let millis = remaining.as_nanos().div_ceil(1_000_000);
    PollTimeout::from(u16::try_from(millis).unwrap_or(u16::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timeout_rounds_up() {
        assert_eq!(
            poll_timeout(Duration::from_micros(1)),
            PollTimeout::from(1u16)
        );
        assert_eq!(poll_timeout(Duration::ZERO), PollTimeout::ZERO);
        assert_eq!(
            poll_timeout(Duration::from_secs(3600)),
            PollTimeout::from(u16::MAX)
        );
    }

    #[test]
    fn accept_requires_endpoint() {
        let broker = ConnectionBroker::default();
        assert!(matches!(
            broker.accept_once(Duration::from_millis(1)),
            Err(BrokerError::NotListening)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let mut broker = ConnectionBroker::default();
        broker.close();
        broker.close();
        assert_eq!(broker.state(), EndpointState::Closed);
        assert!(broker.local_path().is_none());
    }

    #[test]
    fn poll_timeout_caps_unbounded_waits() {
        assert_eq!(poll_timeout(Duration::MAX), PollTimeout::from(u16::MAX));
    }

    #[test]
    fn default_options_match_policy_constants() {
        let options = BrokerOptions::default();
        assert_eq!(options.backlog, 5);
        assert_eq!(options.accept_timeout, Duration::from_millis(5000));
    }
}
