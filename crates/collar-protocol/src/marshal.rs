//! Object serialization used for packet payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ProtocolError;

/// Turns application objects into payload bytes and back.
pub trait Marshal {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError>;
}

/// JSON payloads, matching the object-mapper framing older clients speak.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshal;

impl Marshal for JsonMarshal {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact postcard payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardMarshal;

impl Marshal for PostcardMarshal {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        Ok(postcard::to_allocvec(value)?)
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProtocolError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}
