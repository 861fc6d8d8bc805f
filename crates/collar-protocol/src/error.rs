use thiserror::Error;

use crate::cypher::CypherError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("unknown packet mode: 0x{0:x}")]
    UnknownMode(u32),

    #[error("recipient cannot be absent when sending encrypted packets")]
    MissingRecipient,

    #[error("cannot read encrypted packets with no sender")]
    MissingSender,

    #[error("serialization error: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cypher error: {0}")]
    Cypher(#[from] CypherError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_too_short_display() {
        let e = ProtocolError::PacketTooShort { expected: 4, got: 1 };
        let msg = e.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn unknown_mode_display() {
        let e = ProtocolError::UnknownMode(0xDEAD);
        assert!(e.to_string().contains("0xdead"));
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let proto_err: ProtocolError = io_err.into();
        assert!(proto_err.to_string().contains("eof"));
    }
}
