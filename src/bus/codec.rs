use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use thiserror::Error;

use crate::bus::envelope::{NodeMessage, NodeMessageKind, NodePayload};
use crate::dao::models::{SNAPSHOT_VERSION, TeamSnapshot};

/// Length byte marking an absent string field in the binary framing.
const LEN_ABSENT: u8 = 0xFF;
/// Longest string the one-byte length prefix can carry.
const MAX_FIELD_LEN: usize = 0xFE;

/// Errors raised while encoding or decoding [`NodeMessage`]s.
///
/// Decoders fail loudly: a truncated header or an unknown kind is never
/// coerced into a partial message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A header string does not fit the one-byte length prefix.
    #[error("header field `{0}` exceeds {MAX_FIELD_LEN} bytes")]
    FieldTooLong(&'static str),
    /// The input ended in the middle of the named element.
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),
    /// The kind byte is not a known [`NodeMessageKind`].
    #[error("unknown message kind byte {0:#04x}")]
    UnknownKind(u8),
    /// The kind header names no known [`NodeMessageKind`].
    #[error("unknown message kind `{0}`")]
    UnknownKindName(String),
    /// The payload variant does not fit the declared message kind.
    #[error("payload does not match message kind `{}`", .0.name())]
    PayloadMismatch(NodeMessageKind),
    /// The snapshot was written by an incompatible release.
    #[error("unsupported snapshot version {0}")]
    UnsupportedSnapshotVersion(u32),
    /// A header string is not valid UTF-8.
    #[error("invalid UTF-8 in header field")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// Payload JSON could not be read or written.
    #[error("payload serialization failed")]
    Json(#[from] serde_json::Error),
    /// Deflate failed on a snapshot payload.
    #[error("snapshot compression failed")]
    Compression(#[from] std::io::Error),
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encode the full envelope as UTF-8 JSON (snapshot payloads uncompressed).
pub fn encode_json(message: &NodeMessage) -> CodecResult<Vec<u8>> {
    check_payload_kind(message)?;
    Ok(serde_json::to_vec(message)?)
}

/// Decode a JSON envelope produced by [`encode_json`].
pub fn decode_json(bytes: &[u8]) -> CodecResult<NodeMessage> {
    let message: NodeMessage = serde_json::from_slice(bytes)?;
    check_payload_kind(&message)?;
    if let NodePayload::Snapshot(snapshot) = &message.payload {
        check_snapshot_version(snapshot)?;
    }
    Ok(message)
}

/// Serialize only the payload to bytes, deflating snapshot kinds.
///
/// This is the shared payload encoding for transports that carry the header
/// fields out of band (broker message headers) as well as for the binary
/// framing.
pub fn encode_payload(message: &NodeMessage) -> CodecResult<Vec<u8>> {
    match (&message.kind, &message.payload) {
        (NodeMessageKind::TeamMessage, NodePayload::TeamEvent(event)) => {
            Ok(serde_json::to_vec(event)?)
        }
        (
            NodeMessageKind::TeamCreated | NodeMessageKind::InitializeTeam,
            NodePayload::Snapshot(snapshot),
        ) => deflate(&serde_json::to_vec(snapshot)?),
        (
            NodeMessageKind::TeamList | NodeMessageKind::RequestTeams,
            NodePayload::TeamNames(names),
        ) => Ok(serde_json::to_vec(names)?),
        (NodeMessageKind::RequestTeamList, NodePayload::Empty) => Ok(Vec::new()),
        _ => Err(CodecError::PayloadMismatch(message.kind)),
    }
}

/// Inverse of [`encode_payload`] for a known message kind.
pub fn decode_payload(kind: NodeMessageKind, bytes: &[u8]) -> CodecResult<NodePayload> {
    match kind {
        NodeMessageKind::TeamMessage => Ok(NodePayload::TeamEvent(serde_json::from_slice(bytes)?)),
        NodeMessageKind::TeamCreated | NodeMessageKind::InitializeTeam => {
            let snapshot: TeamSnapshot = serde_json::from_slice(&inflate(bytes)?)?;
            check_snapshot_version(&snapshot)?;
            Ok(NodePayload::Snapshot(snapshot))
        }
        NodeMessageKind::TeamList | NodeMessageKind::RequestTeams => {
            Ok(NodePayload::TeamNames(serde_json::from_slice(bytes)?))
        }
        NodeMessageKind::RequestTeamList => Ok(NodePayload::Empty),
    }
}

/// Encode the envelope in the length-prefixed binary framing:
/// `[len:1][sender]` `[len:1][recipient]` `[kind:1]` `[len:1][subtype]`
/// followed by the payload bytes. Length `0xFF` encodes an absent field,
/// `0x00` an empty string.
pub fn encode_binary(message: &NodeMessage) -> CodecResult<Vec<u8>> {
    let payload = encode_payload(message)?;
    let mut buf = Vec::with_capacity(payload.len() + 64);
    write_field(&mut buf, Some(&message.sender), "sender")?;
    write_field(&mut buf, message.recipient.as_deref(), "recipient")?;
    buf.push(message.kind.wire_byte());
    write_field(&mut buf, message.payload.subtype_name(), "subtype")?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a frame produced by [`encode_binary`].
pub fn decode_binary(bytes: &[u8]) -> CodecResult<NodeMessage> {
    let mut reader = Reader { bytes, pos: 0 };
    let sender = reader
        .read_field("sender")?
        .ok_or(CodecError::Truncated("sender"))?;
    let recipient = reader.read_field("recipient")?;
    let kind_byte = reader.read_byte("kind")?;
    let kind = NodeMessageKind::from_wire_byte(kind_byte).ok_or(CodecError::UnknownKind(kind_byte))?;
    // The subtype travels for mixed-version compatibility; the kind already
    // pins the payload shape on this release.
    let _subtype = reader.read_field("subtype")?;
    let payload = decode_payload(kind, reader.rest())?;

    Ok(NodeMessage {
        kind,
        sender,
        recipient,
        payload,
    })
}

fn check_payload_kind(message: &NodeMessage) -> CodecResult<()> {
    let ok = matches!(
        (&message.kind, &message.payload),
        (NodeMessageKind::TeamMessage, NodePayload::TeamEvent(_))
            | (
                NodeMessageKind::TeamCreated | NodeMessageKind::InitializeTeam,
                NodePayload::Snapshot(_)
            )
            | (
                NodeMessageKind::TeamList | NodeMessageKind::RequestTeams,
                NodePayload::TeamNames(_)
            )
            | (NodeMessageKind::RequestTeamList, NodePayload::Empty)
    );
    if ok {
        Ok(())
    } else {
        Err(CodecError::PayloadMismatch(message.kind))
    }
}

fn check_snapshot_version(snapshot: &TeamSnapshot) -> CodecResult<()> {
    if snapshot.version == SNAPSHOT_VERSION {
        Ok(())
    } else {
        Err(CodecError::UnsupportedSnapshotVersion(snapshot.version))
    }
}

fn deflate(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn write_field(buf: &mut Vec<u8>, value: Option<&str>, field: &'static str) -> CodecResult<()> {
    match value {
        None => buf.push(LEN_ABSENT),
        Some(s) => {
            let bytes = s.as_bytes();
            if bytes.len() > MAX_FIELD_LEN {
                return Err(CodecError::FieldTooLong(field));
            }
            buf.push(bytes.len() as u8);
            buf.extend_from_slice(bytes);
        }
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_byte(&mut self, context: &'static str) -> CodecResult<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(CodecError::Truncated(context))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_field(&mut self, context: &'static str) -> CodecResult<Option<String>> {
        let len = self.read_byte(context)?;
        if len == LEN_ABSENT {
            return Ok(None);
        }
        let len = len as usize;
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(CodecError::Truncated(context))?;
        self.pos = end;
        Ok(Some(String::from_utf8(slice.to_vec())?))
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}
