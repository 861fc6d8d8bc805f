use std::fmt;
use std::path::PathBuf;

use libsignal_protocol::SignalProtocolError;
use thiserror::Error;

/// Id space of a numbered key record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyNamespace {
    PreKey,
    SignedPreKey,
}

impl fmt::Display for KeyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreKey => f.write_str("prekey"),
            Self::SignedPreKey => f.write_str("signed prekey"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no {namespace} with id {id}")]
    InvalidKeyId { namespace: KeyNamespace, id: u32 },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store has identity material but no {0}")]
    Uninitialised(&'static str),

    #[error("invalid storage scope {0:?}")]
    InvalidScope(String),

    #[error("signal record error: {0}")]
    Signal(#[from] SignalProtocolError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InvalidKeyId { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(key: impl fmt::Display, reason: impl fmt::Display) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failures from session establishment and message encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("signal protocol error: {0}")]
    Signal(#[from] SignalProtocolError),

    #[error("unknown signal message type: {0}")]
    UnknownMessageType(u32),

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}
