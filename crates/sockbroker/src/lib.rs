//! Local-socket listening endpoint owned by the trusted side of the bridge.
//!
//! The less-privileged peer speaking the windowing protocol cannot own the
//! accepting socket itself, so [`ConnectionBroker`] binds it, makes it
//! world-accessible, and hands each accepted connection straight to its
//! caller. Accepting is a bounded wait: [`AcceptOutcome::Timeout`] is an
//! ordinary result, distinct from [`BrokerError`].

mod broker;
mod connection;
mod error;
mod path;

pub use broker::{
    AcceptOutcome, BrokerOptions, ConnectionBroker, EndpointState, DEFAULT_ACCEPT_TIMEOUT,
    DEFAULT_BACKLOG,
};
pub use connection::ClientConnection;
pub use error::BrokerError;
pub use path::{prepare_socket_path, remove_stale_entry};
