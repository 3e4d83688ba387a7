//! Datagram framing.
//!
//! Three shapes travel over the socket:
//!
//! ```text
//! connectionless:  [ 0xFFFFFFFF ][ ASCII command ...                   ]
//! client frame:    [ own seq   ][ echoed peer seq ][ payload(s) ...   ]
//! server frame:    [ seq       ][ ack seq         ][ msg ][ msg ] ... ]
//! ```
//!
//! A client frame may carry several payloads as long as only the last one is
//! variable-length; fixed-width payloads (moves) can always be stepped over.
//! Server messages describe their own length through their layout, see
//! [`MessageCatalog`].

use std::fmt;

use smallvec::SmallVec;

use crate::network::codec::CodecError;
use crate::network::commands::ClientPayload;
use crate::network::messages::{MessageCatalog, ServerMessage};
use crate::network::sequence::{SequenceNumber, SEQUENCE_SIZE};

/// Size of the sequence pair that starts every sequenced frame.
pub const HEADER_SIZE: usize = 2 * SEQUENCE_SIZE;

/// Errors raised while building or splitting frames.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// The datagram is shorter than its header.
    TooShort {
        /// Datagram length.
        len: usize,
        /// Length the header needs.
        needed: usize,
    },
    /// A variable-length payload was followed by another payload.
    VariableLengthNotLast {
        /// Index of the offending payload.
        index: usize,
    },
    /// A sequenced frame was expected but a connectionless one arrived.
    UnexpectedConnectionless,
    /// Payload encoding failed.
    Codec(CodecError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len, needed } => {
                write!(f, "datagram of {len} bytes is shorter than its {needed}-byte header")
            },
            Self::VariableLengthNotLast { index } => write!(
                f,
                "payload {index} has variable length but is not the last payload of the frame"
            ),
            Self::UnexpectedConnectionless => {
                write!(f, "expected a sequenced frame, got a connectionless one")
            },
            Self::Codec(err) => write!(f, "payload encoding failed: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<CodecError> for FrameError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

/// One outbound or inbound datagram, split into sequence fields and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Own sequence, or the connectionless sentinel.
    pub seq_a: SequenceNumber,
    /// Echo of the peer's sequence; absent for connectionless frames.
    pub seq_b: Option<SequenceNumber>,
    /// Everything after the sequence fields.
    pub payload: Vec<u8>,
}

impl WireFrame {
    /// A handshake datagram carrying raw command text.
    #[must_use]
    pub fn connectionless(text: &str) -> Self {
        Self {
            seq_a: SequenceNumber::CONNECTIONLESS,
            seq_b: None,
            payload: text.as_bytes().to_vec(),
        }
    }

    /// A frame for an established session.
    pub fn client(
        seq_a: SequenceNumber,
        seq_b: SequenceNumber,
        payloads: &[ClientPayload],
    ) -> Result<Self, FrameError> {
        let capacity = payloads.iter().map(ClientPayload::encoded_len).sum();
        let mut payload = Vec::with_capacity(capacity);
        for (index, item) in payloads.iter().enumerate() {
            if !item.is_fixed_width() && index + 1 != payloads.len() {
                return Err(FrameError::VariableLengthNotLast { index });
            }
            item.encode_into(&mut payload)?;
        }
        Ok(Self {
            seq_a,
            seq_b: Some(seq_b),
            payload,
        })
    }

    /// Whether this is a connectionless frame.
    #[must_use]
    pub fn is_connectionless(&self) -> bool {
        self.seq_a.is_connectionless() && self.seq_b.is_none()
    }

    /// Serializes the frame into a datagram.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let header = if self.seq_b.is_some() {
            HEADER_SIZE
        } else {
            SEQUENCE_SIZE
        };
        let mut out = Vec::with_capacity(header + self.payload.len());
        out.extend_from_slice(&self.seq_a.encode());
        if let Some(seq_b) = self.seq_b {
            out.extend_from_slice(&seq_b.encode());
        }
        out.extend_from_slice(&self.payload);
        out
    }

    /// Splits a datagram into sequence fields and payload.
    ///
    /// A leading connectionless sentinel yields a frame without `seq_b`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let seq_a = SequenceNumber::try_decode(bytes, 0).ok_or(FrameError::TooShort {
            len: bytes.len(),
            needed: SEQUENCE_SIZE,
        })?;
        if seq_a.is_connectionless() {
            return Ok(Self {
                seq_a,
                seq_b: None,
                payload: bytes[SEQUENCE_SIZE..].to_vec(),
            });
        }
        let seq_b = SequenceNumber::try_decode(bytes, SEQUENCE_SIZE).ok_or(FrameError::TooShort {
            len: bytes.len(),
            needed: HEADER_SIZE,
        })?;
        Ok(Self {
            seq_a,
            seq_b: Some(seq_b),
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Whether a raw datagram starts with the connectionless sentinel.
#[must_use]
pub fn is_connectionless_datagram(bytes: &[u8]) -> bool {
    SequenceNumber::try_decode(bytes, 0).is_some_and(SequenceNumber::is_connectionless)
}

/// Text of a connectionless datagram, lossily decoded.
#[must_use]
pub fn connectionless_text(bytes: &[u8]) -> Option<String> {
    is_connectionless_datagram(bytes)
        .then(|| String::from_utf8_lossy(&bytes[SEQUENCE_SIZE..]).into_owned())
}

/// A server message and where it started in its datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Byte offset of the message tag within the datagram.
    pub offset: usize,
    /// The decoded message.
    pub message: ServerMessage,
}

/// Messages of one datagram, inline for the common small case.
pub type MessageList = SmallVec<[DecodedMessage; 4]>;

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFrame {
    /// Server's own sequence.
    pub seq_a: SequenceNumber,
    /// Our sequence as acknowledged by the server, with our reliable parity.
    pub seq_b: SequenceNumber,
    /// Messages in arrival order.
    pub messages: MessageList,
}

impl ServerFrame {
    /// Decodes a full server datagram.
    ///
    /// Decoding is pure: the same bytes always produce the same frame. A
    /// [`ServerMessage::Bad`] entry ends the list since it swallows whatever
    /// follows it.
    pub fn decode(bytes: &[u8], catalog: &MessageCatalog) -> Result<Self, FrameError> {
        if is_connectionless_datagram(bytes) {
            return Err(FrameError::UnexpectedConnectionless);
        }
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                needed: HEADER_SIZE,
            });
        }
        let seq_a = SequenceNumber::decode(bytes, 0);
        let seq_b = SequenceNumber::decode(bytes, SEQUENCE_SIZE);
        let mut messages = MessageList::new();
        let mut offset = HEADER_SIZE;
        while offset < bytes.len() {
            let (message, consumed) = catalog.decode(bytes, offset);
            messages.push(DecodedMessage { offset, message });
            offset += consumed.max(1);
        }
        Ok(Self {
            seq_a,
            seq_b,
            messages,
        })
    }

    /// Whether any message failed to decode.
    #[must_use]
    pub fn has_bad_message(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m.message, ServerMessage::Bad { .. }))
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::commands::{MoveCommand, MOVE_PAYLOAD_SIZE};
    use crate::network::messages::PrintLevel;

    fn server_datagram(seq_a: SequenceNumber, seq_b: SequenceNumber, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&seq_a.encode());
        out.extend_from_slice(&seq_b.encode());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn connectionless_frame_encoding() {
        let frame = WireFrame::connectionless("getchallenge");
        assert!(frame.is_connectionless());
        let bytes = frame.encode();
        assert_eq!(&bytes[..4], &[0xFF; 4]);
        assert_eq!(&bytes[4..], b"getchallenge");
        let seq = SequenceNumber::decode(&bytes, 0);
        assert_eq!(seq.value(), 0x7fff_ffff);
        assert!(seq.is_reliable());
        assert_eq!(connectionless_text(&bytes).as_deref(), Some("getchallenge"));
    }

    #[test]
    fn client_frame_with_move_then_command() {
        let payloads = [
            ClientPayload::Move(MoveCommand::default().to_payload(-1, 16)),
            ClientPayload::StringCommand("say hi".to_owned()),
        ];
        let frame = WireFrame::client(
            SequenceNumber::new(3, true),
            SequenceNumber::new(9, false),
            &payloads,
        )
        .unwrap();
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + MOVE_PAYLOAD_SIZE + 8);
        // The command starts right after the fixed-width move.
        assert_eq!(bytes[HEADER_SIZE + MOVE_PAYLOAD_SIZE], 4);
        let parsed = WireFrame::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert!(parsed.seq_a.is_reliable());
    }

    #[test]
    fn variable_length_payload_must_be_last() {
        let payloads = [ClientPayload::StringCommand("a".to_owned()), ClientPayload::Nop];
        let err = WireFrame::client(
            SequenceNumber::new(1, false),
            SequenceNumber::new(1, false),
            &payloads,
        )
        .unwrap_err();
        assert_eq!(err, FrameError::VariableLengthNotLast { index: 0 });
    }

    #[test]
    fn parse_rejects_short_datagrams() {
        assert!(matches!(
            WireFrame::parse(&[1, 2]),
            Err(FrameError::TooShort { needed: 4, .. })
        ));
        assert!(matches!(
            WireFrame::parse(&[1, 0, 0, 0, 2]),
            Err(FrameError::TooShort { needed: 8, .. })
        ));
    }

    #[test]
    fn two_back_to_back_messages() {
        let body = b"\x06\x0a\x01hello\0";
        let bytes = server_datagram(
            SequenceNumber::new(5, true),
            SequenceNumber::new(2, false),
            body,
        );
        let frame = ServerFrame::decode(&bytes, &MessageCatalog::standard()).unwrap();
        assert_eq!(frame.seq_a.value(), 5);
        assert!(frame.seq_a.is_reliable());
        assert_eq!(frame.messages.len(), 2);
        assert_eq!(frame.messages[0].message, ServerMessage::Nop);
        assert_eq!(frame.messages[0].offset, HEADER_SIZE);
        assert_eq!(frame.messages[1].offset, HEADER_SIZE + 1);
        assert_eq!(
            frame.messages[1].message,
            ServerMessage::Print {
                level: PrintLevel::Medium,
                text: "hello".to_owned()
            }
        );
    }

    #[test]
    fn unknown_tag_ends_the_message_list() {
        let bytes = server_datagram(
            SequenceNumber::new(1, false),
            SequenceNumber::new(1, false),
            &[6, 99, 6, 6],
        );
        let frame = ServerFrame::decode(&bytes, &MessageCatalog::standard()).unwrap();
        assert_eq!(frame.messages.len(), 2);
        assert!(frame.has_bad_message());
        assert_eq!(
            frame.messages[1].message,
            ServerMessage::Bad {
                tag: 99,
                offset: 9,
                bytes: vec![99, 6, 6]
            }
        );
    }

    #[test]
    fn header_only_frame_has_no_messages() {
        let bytes = server_datagram(
            SequenceNumber::new(1, false),
            SequenceNumber::new(1, false),
            &[],
        );
        let frame = ServerFrame::decode(&bytes, &MessageCatalog::standard()).unwrap();
        assert!(frame.messages.is_empty());
    }

    #[test]
    fn server_decode_rejects_connectionless() {
        let bytes = WireFrame::connectionless("challenge 1").encode();
        assert_eq!(
            ServerFrame::decode(&bytes, &MessageCatalog::standard()),
            Err(FrameError::UnexpectedConnectionless)
        );
    }

    #[test]
    fn decoding_is_repeatable() {
        let bytes = server_datagram(
            SequenceNumber::new(8, true),
            SequenceNumber::new(4, true),
            b"\x0b\x63md 1\n\0\x06\x07",
        );
        let catalog = MessageCatalog::standard();
        let first = ServerFrame::decode(&bytes, &catalog).unwrap();
        let second = ServerFrame::decode(&bytes, &catalog).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.messages.len(), 3);
    }
}
