use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IcdError {
    #[error("failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("symbol {symbol} not found")]
    MissingSymbol { symbol: String },
    #[error("name contains an interior NUL byte: {0:?}")]
    InvalidName(String),
}
