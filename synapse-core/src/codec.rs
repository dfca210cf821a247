//! Stream framing codec
//!
//! Encodes one protocol message per self-delimiting frame and extracts
//! complete frames from an ordered byte stream regardless of how the stream
//! was chunked. Header and payload are independently length-delimited so a
//! payload of arbitrary binary content is safe, and an absent payload is
//! encoded distinctly from an empty one.
//!
//! Wire layout:
//!
//! ```text
//! u32 BE header length | header JSON | u8 payload flag | [u32 BE payload length | payload]
//! ```
//!
//! Malformed input is fatal: the transport owning the decoder must close
//! the connection rather than attempt resynchronization.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, SynapseError};
use crate::message::{Command, Envelope, Message};

/// Upper bound on an encoded header.
pub const MAX_HEADER_LEN: usize = 64 * 1024;
/// Upper bound on a payload.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const PAYLOAD_ABSENT: u8 = 0;
const PAYLOAD_PRESENT: u8 = 1;

fn put_frame<H: Serialize>(header: &H, payload: Option<&[u8]>) -> Result<Bytes> {
    let header_json = serde_json::to_vec(header)?;
    if header_json.len() > MAX_HEADER_LEN {
        return Err(SynapseError::FrameCorrupt("header over limit".into()));
    }
    if let Some(p) = payload {
        if p.len() > MAX_PAYLOAD_LEN {
            return Err(SynapseError::FrameCorrupt("payload over limit".into()));
        }
    }
    let payload_len = payload.map(|p| p.len() + 4).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(4 + header_json.len() + 1 + payload_len);
    buf.put_u32(header_json.len() as u32);
    buf.put_slice(&header_json);
    match payload {
        None => buf.put_u8(PAYLOAD_ABSENT),
        Some(p) => {
            buf.put_u8(PAYLOAD_PRESENT);
            buf.put_u32(p.len() as u32);
            buf.put_slice(p);
        }
    }
    Ok(buf.freeze())
}

/// Extract one complete frame from the front of `buf`, or `None` if more
/// bytes are needed. Errors are fatal to the connection.
fn take_frame<H: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<(H, Option<Bytes>)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let header_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(SynapseError::FrameCorrupt(format!(
            "declared header length {header_len} over limit"
        )));
    }
    if buf.len() < 4 + header_len + 1 {
        return Ok(None);
    }
    let flag = buf[4 + header_len];
    let (payload_len, total) = match flag {
        PAYLOAD_ABSENT => (None, 4 + header_len + 1),
        PAYLOAD_PRESENT => {
            if buf.len() < 4 + header_len + 5 {
                return Ok(None);
            }
            let at = 4 + header_len + 1;
            let len =
                u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
            if len > MAX_PAYLOAD_LEN {
                return Err(SynapseError::FrameCorrupt(format!(
                    "declared payload length {len} over limit"
                )));
            }
            (Some(len), 4 + header_len + 5 + len)
        }
        other => {
            return Err(SynapseError::FrameCorrupt(format!(
                "bad payload flag {other:#04x}"
            )));
        }
    };
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(4);
    let header_bytes = buf.split_to(header_len);
    let header: H = serde_json::from_slice(&header_bytes)
        .map_err(|e| SynapseError::FrameCorrupt(format!("undecodable header: {e}")))?;
    buf.advance(1);
    let payload = match payload_len {
        None => None,
        Some(len) => {
            buf.advance(4);
            Some(buf.split_to(len).freeze())
        }
    };
    Ok(Some((header, payload)))
}

/// Serialize one message, fresh each call.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    put_frame(&message.command, message.payload.as_deref())
}

/// Serialize one envelope, fresh each call.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes> {
    let header = EnvelopeHeader {
        name: envelope.name.clone(),
        command: envelope.message.command.clone(),
    };
    put_frame(&header, envelope.message.payload.as_deref())
}

#[derive(Debug, Serialize, serde::Deserialize)]
struct EnvelopeHeader {
    name: String,
    #[serde(flatten)]
    command: Command,
}

/// A message whose encoding is computed once and reused across every
/// recipient of a fan-out.
#[derive(Debug)]
pub struct CachedFrame {
    message: Message,
    encoded: OnceCell<Bytes>,
}

impl CachedFrame {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            encoded: OnceCell::new(),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The encoded frame, serialized on first use.
    pub fn bytes(&self) -> Result<Bytes> {
        self.encoded
            .get_or_try_init(|| encode_message(&self.message))
            .cloned()
    }
}

/// Incremental decoder over an ordered byte stream. Chunks may split frames
/// at any boundary; the trailing partial frame is retained between calls.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and invoke `on_frame` once per complete message now
    /// available. An error poisons the stream; the caller must close it.
    pub fn consume(&mut self, chunk: &[u8], mut on_frame: impl FnMut(Message)) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        while let Some((command, payload)) = take_frame::<Command>(&mut self.buf)? {
            on_frame(Message { command, payload });
        }
        Ok(())
    }

    /// Bytes retained waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// `tokio_util` codec for [`Message`] frames.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = SynapseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        Ok(take_frame::<Command>(src)?.map(|(command, payload)| Message { command, payload }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = SynapseError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_message(&item)?);
        Ok(())
    }
}

/// `tokio_util` codec for [`Envelope`] frames on the child control channel.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = SynapseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        Ok(take_frame::<EnvelopeHeader>(src)?.map(|(header, payload)| Envelope {
            name: header.name,
            message: Message {
                command: header.command,
                payload,
            },
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = SynapseError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&encode_envelope(&item)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn decode_all(bytes: &[u8]) -> Vec<Message> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        decoder.consume(bytes, |m| out.push(m)).unwrap();
        assert_eq!(decoder.pending(), 0);
        out
    }

    #[test]
    fn round_trip_with_payload() {
        let msg = Message::emit("job::done", Some(Bytes::from_static(b"{\"n\":1}")));
        let frame = encode_message(&msg).unwrap();
        assert_eq!(decode_all(&frame), vec![msg]);
    }

    #[test]
    fn absent_payload_is_distinct_from_empty() {
        let absent = Message::push_emit("t", None);
        let empty = Message::push_emit("t", Some(Bytes::new()));
        let fa = encode_message(&absent).unwrap();
        let fe = encode_message(&empty).unwrap();
        assert_ne!(fa, fe);
        assert_eq!(decode_all(&fa), vec![absent]);
        assert_eq!(decode_all(&fe), vec![empty]);
    }

    #[test]
    fn every_chunk_boundary_reassembles() {
        let msg = Message::emit("a::b::c", Some(Bytes::from_static(b"[0,1,2,3]")));
        let frame = encode_message(&msg).unwrap();
        for split in 1..frame.len() {
            let mut decoder = FrameDecoder::new();
            let mut out = Vec::new();
            decoder.consume(&frame[..split], |m| out.push(m)).unwrap();
            decoder.consume(&frame[split..], |m| out.push(m)).unwrap();
            assert_eq!(out, vec![msg.clone()], "split at {split}");
        }
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let a = Message::on("x");
        let b = Message::echo("y");
        let mut bytes = encode_message(&a).unwrap().to_vec();
        bytes.extend_from_slice(&encode_message(&b).unwrap());
        assert_eq!(decode_all(&bytes), vec![a, b]);
    }

    #[test]
    fn oversized_header_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        let bytes = (u32::MAX).to_be_bytes();
        let err = decoder.consume(&bytes, |_| {}).unwrap_err();
        assert!(matches!(err, SynapseError::FrameCorrupt(_)));
    }

    #[test]
    fn bad_payload_flag_is_fatal() {
        let msg = Message::on("x");
        let mut frame = encode_message(&msg).unwrap().to_vec();
        let flag_at = frame.len() - 1;
        frame[flag_at] = 9;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.consume(&frame, |_| {}).is_err());
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let header = br#"{"kind":"mystery"}"#;
        let mut frame = Vec::new();
        frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
        frame.extend_from_slice(header);
        frame.push(0);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.consume(&frame, |_| {}),
            Err(SynapseError::FrameCorrupt(_))
        ));
    }

    #[test]
    fn cached_frame_encodes_once_and_matches_normal_path() {
        let msg = Message::push_emit("t", Some(Bytes::from_static(b"1")));
        let cached = CachedFrame::new(msg.clone());
        let first = cached.bytes().unwrap();
        let second = cached.bytes().unwrap();
        assert_eq!(first, second);
        assert_eq!(first, encode_message(&msg).unwrap());
    }

    #[test]
    fn envelope_round_trip() {
        let env = Envelope::new(
            "worker-1",
            Message::emit("task", Some(Bytes::from_static(b"{}"))),
        );
        let frame = encode_envelope(&env).unwrap();
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from(&frame[..]);
        let back = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(back, env);
        assert!(buf.is_empty());
    }
}
