//! Error types for the session, transport, classifier and lock

use fingerlock_proto::{CharacteristicRole, HexError};

/// Failure reported by the radio transport. Carries the backend's message
/// only, so events stay `Clone` and backend-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("notify subscription failed: {0}")]
    Notify(String),
    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(uuid::Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("expected {expected} fingerprint bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error(transparent)]
    Hex(#[from] HexError),
    #[error("classifier model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("invalid classifier model: {0}")]
    InvalidModel(String),
    #[error("prediction failed: {0}")]
    Prediction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("a lock write is already in flight")]
    WriteInFlight,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session worker has stopped")]
    Closed,
    #[error("a peripheral is already connected")]
    AlreadyConnected,
    #[error("no peripheral connected")]
    NotConnected,
    #[error("characteristic {0:?} is not bound")]
    NotBound(CharacteristicRole),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHome,
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
