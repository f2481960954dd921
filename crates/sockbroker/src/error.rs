use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to bind local socket at {path}: {source}")]
    BindFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("waiting for a connection failed: {0}")]
    Wait(#[source] io::Error),
    #[error("accepting a connection failed: {0}")]
    Accept(#[source] io::Error),
    #[error("no listening endpoint is bound")]
    NotListening,
}
