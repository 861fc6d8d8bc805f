use std::io::Read;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::cypher::Cypher;
use crate::error::ProtocolError;
use crate::identity::Identity;
use crate::marshal::{JsonMarshal, Marshal};

/// Mode tag for payloads sent in the clear.
pub const MODE_PLAIN: u32 = 0xC001;

/// Mode tag for payloads routed through the [`Cypher`].
pub const MODE_ENCRYPTED: u32 = 0xBA5ED;

const MODE_LEN: usize = 4;

/// Encodes and decodes packets for the wire.
///
/// Packet format: `u32 BE mode || payload`. Plain payloads are the
/// marshalled object; encrypted payloads are whatever the cypher produced
/// for the marshalled object.
pub struct PacketIo<C, M = JsonMarshal> {
    cypher: C,
    marshal: M,
}

impl<C: Cypher> PacketIo<C, JsonMarshal> {
    pub fn new(cypher: C) -> Self {
        Self::with_marshal(cypher, JsonMarshal)
    }
}

impl<C: Cypher, M: Marshal> PacketIo<C, M> {
    pub fn with_marshal(cypher: C, marshal: M) -> Self {
        Self { cypher, marshal }
    }

    /// Encode `object` as a plain packet.
    pub fn encode_plain<T: Serialize>(&self, object: &T) -> Result<Vec<u8>, ProtocolError> {
        let raw = self.marshal.to_bytes(object)?;
        Ok(frame(MODE_PLAIN, &raw))
    }

    /// Encode `object` as an encrypted packet for `recipient`.
    pub fn encode_encrypted<T: Serialize>(
        &self,
        recipient: Option<&Identity>,
        object: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        let recipient = recipient.ok_or(ProtocolError::MissingRecipient)?;
        let raw = self.marshal.to_bytes(object)?;
        let ciphertext = self.cypher.encrypt(recipient, &raw)?;
        Ok(frame(MODE_ENCRYPTED, &ciphertext))
    }

    /// Decode a packet. `sender` is only consulted for encrypted packets.
    pub fn decode<T: DeserializeOwned>(
        &self,
        sender: Option<&Identity>,
        bytes: &[u8],
    ) -> Result<T, ProtocolError> {
        if bytes.len() < MODE_LEN {
            return Err(ProtocolError::PacketTooShort {
                expected: MODE_LEN,
                got: bytes.len(),
            });
        }

        let mut buf = bytes;
        let mode = buf.get_u32();
        match mode {
            MODE_PLAIN => self.marshal.from_bytes(buf),
            MODE_ENCRYPTED => {
                let sender = sender.ok_or(ProtocolError::MissingSender)?;
                let plaintext = self.cypher.decrypt(sender, buf)?;
                self.marshal.from_bytes(&plaintext)
            }
            other => {
                debug!(mode = other, len = bytes.len(), "rejecting packet with unknown mode");
                Err(ProtocolError::UnknownMode(other))
            }
        }
    }

    /// Decode a packet from a stream, reading it to the end first.
    pub fn decode_from<T: DeserializeOwned, R: Read>(
        &self,
        sender: Option<&Identity>,
        mut reader: R,
    ) -> Result<T, ProtocolError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        self.decode(sender, &bytes)
    }
}

fn frame(mode: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(MODE_LEN + payload.len());
    buf.put_u32(mode);
    buf.put_slice(payload);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Cursor;

    use serde::Deserialize;

    use super::*;
    use crate::cypher::CypherError;
    use crate::marshal::PostcardMarshal;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        from: String,
        text: String,
        seq: u64,
    }

    fn greeting() -> Greeting {
        Greeting {
            from: "alice".into(),
            text: "hello there".into(),
            seq: 7,
        }
    }

    /// XORs payloads with a key derived from the peer name and counts calls.
    #[derive(Default)]
    struct XorCypher {
        calls: Cell<u32>,
    }

    impl XorCypher {
        fn apply(identity: &Identity, data: &[u8]) -> Vec<u8> {
            let key = identity.name.as_bytes();
            data.iter()
                .enumerate()
                .map(|(i, b)| b ^ key[i % key.len()] ^ identity.device_id as u8)
                .collect()
        }
    }

    impl Cypher for XorCypher {
        fn encrypt(&self, recipient: &Identity, plaintext: &[u8]) -> Result<Vec<u8>, CypherError> {
            self.calls.set(self.calls.get() + 1);
            Ok(Self::apply(recipient, plaintext))
        }

        fn decrypt(&self, sender: &Identity, ciphertext: &[u8]) -> Result<Vec<u8>, CypherError> {
            self.calls.set(self.calls.get() + 1);
            Ok(Self::apply(sender, ciphertext))
        }
    }

    struct NoSessions;

    impl Cypher for NoSessions {
        fn encrypt(&self, recipient: &Identity, _: &[u8]) -> Result<Vec<u8>, CypherError> {
            Err(CypherError::NoSession(recipient.clone()))
        }

        fn decrypt(&self, sender: &Identity, _: &[u8]) -> Result<Vec<u8>, CypherError> {
            Err(CypherError::NoSession(sender.clone()))
        }
    }

    #[test]
    fn plain_roundtrip_ignores_sender() {
        let io = PacketIo::new(XorCypher::default());
        let bytes = io.encode_plain(&greeting()).unwrap();

        let anonymous: Greeting = io.decode(None, &bytes).unwrap();
        let bob = Identity::new("bob", 1);
        let attributed: Greeting = io.decode(Some(&bob), &bytes).unwrap();

        assert_eq!(anonymous, greeting());
        assert_eq!(attributed, greeting());
        assert_eq!(io.cypher.calls.get(), 0);
    }

    #[test]
    fn plain_packet_layout() {
        let io = PacketIo::new(NoSessions);
        let bytes = io.encode_plain(&"hi").unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x00, 0xC0, 0x01]);
        assert_eq!(&bytes[4..], br#""hi""#);
    }

    #[test]
    fn encrypted_roundtrip() {
        let io = PacketIo::new(XorCypher::default());
        let bob = Identity::new("bob", 2);

        let bytes = io.encode_encrypted(Some(&bob), &greeting()).unwrap();
        assert_eq!(&bytes[..4], &[0x00, 0x0B, 0xA5, 0xED]);
        // Payload must not be the marshalled object verbatim.
        let raw = JsonMarshal.to_bytes(&greeting()).unwrap();
        assert_ne!(&bytes[4..], raw.as_slice());

        let decoded: Greeting = io.decode(Some(&bob), &bytes).unwrap();
        assert_eq!(decoded, greeting());
        assert_eq!(io.cypher.calls.get(), 2);
    }

    #[test]
    fn encrypted_roundtrip_with_postcard() {
        let io = PacketIo::with_marshal(XorCypher::default(), PostcardMarshal);
        let bob = Identity::new("bob", 1);
        let bytes = io.encode_encrypted(Some(&bob), &greeting()).unwrap();
        let decoded: Greeting = io.decode(Some(&bob), &bytes).unwrap();
        assert_eq!(decoded, greeting());
    }

    #[test]
    fn encrypt_without_recipient_is_argument_error() {
        let io = PacketIo::new(XorCypher::default());
        let result = io.encode_encrypted(None, &greeting());
        assert!(matches!(result, Err(ProtocolError::MissingRecipient)));
        assert_eq!(io.cypher.calls.get(), 0);
    }

    #[test]
    fn decrypt_without_sender_is_state_error() {
        let io = PacketIo::new(XorCypher::default());
        let bob = Identity::new("bob", 1);
        let bytes = io.encode_encrypted(Some(&bob), &greeting()).unwrap();

        let result: Result<Greeting, _> = io.decode(None, &bytes);
        assert!(matches!(result, Err(ProtocolError::MissingSender)));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let io = PacketIo::new(XorCypher::default());
        let mut bytes = 0xCAFEu32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");

        let result: Result<Greeting, _> = io.decode(Some(&Identity::new("bob", 1)), &bytes);
        assert!(matches!(result, Err(ProtocolError::UnknownMode(0xCAFE))));
    }

    #[test]
    fn short_packet_is_rejected() {
        let io = PacketIo::new(NoSessions);
        let result: Result<Greeting, _> = io.decode(None, &[0x00, 0xC0, 0x01]);
        assert!(matches!(
            result,
            Err(ProtocolError::PacketTooShort { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn cypher_failures_pass_through() {
        let io = PacketIo::new(NoSessions);
        let bob = Identity::new("bob", 1);

        let result = io.encode_encrypted(Some(&bob), &greeting());
        assert!(matches!(
            result,
            Err(ProtocolError::Cypher(CypherError::NoSession(ref who))) if who == &bob
        ));

        let mut bytes = MODE_ENCRYPTED.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let result: Result<Greeting, _> = io.decode(Some(&bob), &bytes);
        assert!(matches!(result, Err(ProtocolError::Cypher(_))));
    }

    #[test]
    fn stream_decode_consumes_everything() {
        let io = PacketIo::new(XorCypher::default());
        let bob = Identity::new("bob", 1);
        let bytes = io.encode_encrypted(Some(&bob), &greeting()).unwrap();

        let mut cursor = Cursor::new(bytes.clone());
        let decoded: Greeting = io.decode_from(Some(&bob), &mut cursor).unwrap();
        assert_eq!(decoded, greeting());
        assert_eq!(cursor.position() as usize, bytes.len());
    }

    #[test]
    fn plain_payload_of_wrong_type_is_serialization_error() {
        let io = PacketIo::new(NoSessions);
        let bytes = io.encode_plain(&"just a string").unwrap();
        let result: Result<Greeting, _> = io.decode(None, &bytes);
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn plain_roundtrip(from in ".{0,32}", text in ".{0,256}", seq in any::<u64>()) {
                let io = PacketIo::new(NoSessions);
                let original = Greeting { from, text, seq };
                let bytes = io.encode_plain(&original).unwrap();
                let decoded: Greeting = io.decode(None, &bytes).unwrap();
                prop_assert_eq!(decoded, original);
            }

            #[test]
            fn foreign_modes_never_decode(
                mode in any::<u32>().prop_filter("known mode", |m| *m != MODE_PLAIN && *m != MODE_ENCRYPTED),
                payload in proptest::collection::vec(any::<u8>(), 0..64),
            ) {
                let io = PacketIo::new(NoSessions);
                let mut bytes = mode.to_be_bytes().to_vec();
                bytes.extend_from_slice(&payload);
                let result: Result<Greeting, _> = io.decode(Some(&Identity::new("x", 1)), &bytes);
                prop_assert!(matches!(result, Err(ProtocolError::UnknownMode(m)) if m == mode));
            }
        }
    }
}
