//! Collar wire protocol: peer identities, the encryption capability boundary,
//! and the plain/encrypted packet envelope.

pub mod codec;
pub mod cypher;
pub mod error;
pub mod identity;
pub mod marshal;

pub use codec::{PacketIo, MODE_ENCRYPTED, MODE_PLAIN};
pub use cypher::{Cypher, CypherError};
pub use error::ProtocolError;
pub use identity::{Identity, DEFAULT_DEVICE_ID};
pub use marshal::{JsonMarshal, Marshal, PostcardMarshal};
