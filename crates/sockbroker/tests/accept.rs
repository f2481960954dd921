use std::fs;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use sockbroker::{AcceptOutcome, BrokerError, BrokerOptions, ConnectionBroker, EndpointState};
use tempfile::TempDir;

#[test]
fn times_out_then_accepts_a_late_client() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.sock");
    let mut broker = ConnectionBroker::default();
    broker.bind(&path).unwrap();
    assert_eq!(broker.state(), EndpointState::Listening);

    let started = Instant::now();
    let outcome = broker.accept_once(Duration::from_millis(200)).unwrap();
    let waited = started.elapsed();
    assert!(matches!(outcome, AcceptOutcome::Timeout));
    assert!(waited >= Duration::from_millis(200), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(2000), "returned after {waited:?}");

    let _client = UnixStream::connect(&path).unwrap();
    match broker.accept_once(Duration::from_millis(5000)).unwrap() {
        AcceptOutcome::Connected(connection) => assert!(connection.into_raw_fd() >= 0),
        AcceptOutcome::Timeout => panic!("expected a connection"),
    }
    assert_eq!(broker.state(), EndpointState::Listening);
}

#[test]
fn wakes_as_soon_as_a_peer_connects() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wake.sock");
    let mut broker = ConnectionBroker::default();
    broker.bind(&path).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let mut stream = UnixStream::connect(client_path).unwrap();
        stream.write_all(b"\x01").unwrap();
        stream
    });

    let started = Instant::now();
    let outcome = broker.accept_once(Duration::from_millis(5000)).unwrap();
    assert!(started.elapsed() < Duration::from_millis(4000));
    let AcceptOutcome::Connected(mut connection) = outcome else {
        panic!("expected a connection");
    };

    let mut buf = [0u8; 4];
    let read = connection.read_into(&mut buf).unwrap();
    assert_eq!(&buf[..read], b"\x01");

    drop(client.join().unwrap());
    assert_eq!(connection.read_into(&mut buf).unwrap(), 0);
}

#[test]
fn bind_replaces_stale_file_and_opens_permissions() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stale.sock");
    fs::write(&path, b"left over from a previous run").unwrap();

    let mut broker = ConnectionBroker::default();
    broker.bind(&path).unwrap();

    let metadata = fs::metadata(&path).unwrap();
    assert!(metadata.file_type().is_socket());
    assert_eq!(metadata.permissions().mode() & 0o777, 0o777);
}

#[test]
fn rebinding_closes_the_previous_endpoint() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.sock");
    let second = dir.path().join("second.sock");

    let mut broker = ConnectionBroker::new(BrokerOptions {
        backlog: 2,
        accept_timeout: Duration::from_millis(100),
    });
    broker.bind(&first).unwrap();
    broker.bind(&second).unwrap();

    assert_eq!(broker.local_path(), Some(second.as_path()));
    assert!(!first.exists(), "rebinding unlinks the previous socket file");
    assert!(UnixStream::connect(&first).is_err());
    assert!(UnixStream::connect(&second).is_ok());
}

#[test]
fn bind_failure_leaves_broker_unbound() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing-dir/peer.sock");

    let mut broker = ConnectionBroker::default();
    let err = broker.bind(&path).unwrap_err();

    assert!(matches!(err, BrokerError::BindFailed { .. }));
    assert_eq!(broker.state(), EndpointState::Unbound);
    assert!(broker.listener_fd().is_none());
    assert!(matches!(
        broker.accept_default(),
        Err(BrokerError::NotListening)
    ));
}

#[test]
fn close_keeps_socket_file_until_next_bind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("closed.sock");

    let mut broker = ConnectionBroker::default();
    broker.bind(&path).unwrap();
    broker.close();
    broker.close();

    assert_eq!(broker.state(), EndpointState::Closed);
    assert!(path.exists());

    broker.bind(&path).unwrap();
    assert_eq!(broker.state(), EndpointState::Listening);

    broker.close();
    ConnectionBroker::unlink(&path).unwrap();
    ConnectionBroker::unlink(&path).unwrap();
    assert!(!path.exists());
}

#[test]
fn bind_after_close_unlinks_the_closed_endpoint() {
    let dir = TempDir::new().unwrap();
    let old = dir.path().join("old.sock");
    let new = dir.path().join("new.sock");

    let mut broker = ConnectionBroker::default();
    broker.bind(&old).unwrap();
    broker.close();
    assert!(old.exists());

    broker.bind(&new).unwrap();
    assert!(!old.exists());
    assert!(new.exists());
}

#[test]
fn unrepresentable_backlog_fails_bind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backlog.sock");

    let mut broker = ConnectionBroker::new(BrokerOptions {
        backlog: u32::MAX,
        accept_timeout: Duration::from_millis(100),
    });
    let err = broker.bind(&path).unwrap_err();

    assert!(matches!(err, BrokerError::BindFailed { .. }));
    assert_eq!(broker.state(), EndpointState::Unbound);
    assert!(!path.exists());
}

#[test]
fn unbounded_timeout_still_accepts() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("forever.sock");
    let mut broker = ConnectionBroker::default();
    broker.bind(&path).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        UnixStream::connect(client_path).unwrap()
    });

    let outcome = broker.accept_once(Duration::MAX).unwrap();
    assert!(matches!(outcome, AcceptOutcome::Connected(_)));
    drop(client.join().unwrap());
}
