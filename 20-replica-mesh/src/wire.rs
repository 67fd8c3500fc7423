//! Frame codecs for replica and client connections.
//!
//! Two framings share the wire:
//!
//! - **Sized (legacy)**: `[u32 length][payload]`. Used on the client path.
//! - **Tagged**: `[u8 flag][u32 sender][u32 length][payload]`, followed by
//!   `[u32 sig_length][signature]` when `flag == FLAG_SIGNED`. Used between
//!   replicas.
//!
//! All integers are big-endian. Both decoders peek at the buffer before
//! consuming anything: a frame is only split off once every byte of it has
//! arrived, so a short read leaves the buffer untouched and decoding resumes
//! on the next chunk.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::identity::PeerId;

pub const FLAG_PLAIN: u8 = 0x00;
pub const FLAG_SIGNED: u8 = 0x01;

/// Upper bound for a single payload or signature.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_FIELD: usize = 4;
const TAGGED_HEADER: usize = 1 + 4 + LEN_FIELD;

/// One decoded tagged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender_id: PeerId,
    pub payload: Bytes,
    pub signature: Option<Bytes>,
}

impl Envelope {
    pub fn plain(sender_id: PeerId, payload: impl Into<Bytes>) -> Self {
        Self {
            sender_id,
            payload: payload.into(),
            signature: None,
        }
    }

    pub fn signed(sender_id: PeerId, payload: impl Into<Bytes>, signature: impl Into<Bytes>) -> Self {
        Self {
            sender_id,
            payload: payload.into(),
            signature: Some(signature.into()),
        }
    }

    pub fn has_signature(&self) -> bool {
        self.signature.is_some()
    }

    /// Number of bytes this envelope occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        TAGGED_HEADER
            + self.payload.len()
            + self
                .signature
                .as_ref()
                .map_or(0, |sig| LEN_FIELD + sig.len())
    }
}

/// Codec for the legacy `[length][payload]` frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizedCodec;

/// Codec for tagged, optionally signed frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl Decoder for SizedCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        let mut peek = &src[..];
        if peek.remaining() < LEN_FIELD {
            return Ok(None);
        }
        let len = checked_len(peek.get_u32())?;
        if peek.remaining() < len {
            src.reserve(LEN_FIELD + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_FIELD);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for SizedCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        let len = wire_len(payload.len())?;
        dst.reserve(LEN_FIELD + payload.len());
        dst.put_u32(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Envelope>> {
        let mut peek = &src[..];
        if peek.remaining() < TAGGED_HEADER {
            return Ok(None);
        }

        let flag = peek.get_u8();
        if flag != FLAG_PLAIN && flag != FLAG_SIGNED {
            return Err(invalid_data(format!("unknown frame flag {flag:#04x}")));
        }
        let sender_id = peek.get_u32();
        let payload_len = checked_len(peek.get_u32())?;
        if peek.remaining() < payload_len {
            return Ok(None);
        }
        peek.advance(payload_len);

        let mut total = TAGGED_HEADER + payload_len;
        let mut sig_len = 0;
        if flag == FLAG_SIGNED {
            if peek.remaining() < LEN_FIELD {
                return Ok(None);
            }
            sig_len = checked_len(peek.get_u32())?;
            if peek.remaining() < sig_len {
                return Ok(None);
            }
            total += LEN_FIELD + sig_len;
        }

        // The whole frame is buffered; consume it.
        let mut frame = src.split_to(total);
        frame.advance(TAGGED_HEADER);
        let payload = frame.split_to(payload_len).freeze();
        let signature = if flag == FLAG_SIGNED {
            frame.advance(LEN_FIELD);
            Some(frame.split_to(sig_len).freeze())
        } else {
            None
        };

        Ok(Some(Envelope {
            sender_id,
            payload,
            signature,
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> io::Result<()> {
        let payload_len = wire_len(envelope.payload.len())?;
        dst.reserve(envelope.encoded_len());

        let flag = if envelope.has_signature() {
            FLAG_SIGNED
        } else {
            FLAG_PLAIN
        };
        dst.put_u8(flag);
        dst.put_u32(envelope.sender_id);
        dst.put_u32(payload_len);
        dst.extend_from_slice(&envelope.payload);

        if let Some(signature) = &envelope.signature {
            dst.put_u32(wire_len(signature.len())?);
            dst.extend_from_slice(signature);
        }
        Ok(())
    }
}

fn checked_len(len: u32) -> io::Result<usize> {
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(invalid_data(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }
    Ok(len)
}

fn wire_len(len: usize) -> io::Result<u32> {
    if len > MAX_FRAME_LEN {
        return Err(invalid_data(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }
    Ok(len as u32)
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn encode_envelope(envelope: &Envelope) -> BytesMut {
        let mut buf = BytesMut::new();
        EnvelopeCodec
            .encode(envelope.clone(), &mut buf)
            .expect("encode envelope");
        buf
    }

    #[test]
    fn plain_frame_layout_is_bit_exact() {
        let buf = encode_envelope(&Envelope::plain(0x0102_0304, &b"hi"[..]));
        assert_eq!(
            &buf[..],
            &[0x00, 0x01, 0x02, 0x03, 0x04, 0, 0, 0, 2, b'h', b'i'][..]
        );
    }

    #[test]
    fn signed_frame_layout_is_bit_exact() {
        let buf = encode_envelope(&Envelope::signed(7, &b"x"[..], &b"sig"[..]));
        assert_eq!(
            &buf[..],
            &[0x01, 0, 0, 0, 7, 0, 0, 0, 1, b'x', 0, 0, 0, 3, b's', b'i', b'g'][..]
        );
    }

    #[test]
    fn sized_frame_layout_is_bit_exact() {
        let mut buf = BytesMut::new();
        SizedCodec
            .encode(Bytes::from_static(b"abc"), &mut buf)
            .expect("encode sized");
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c'][..]);
    }

    #[test]
    fn short_buffer_is_not_consumed() {
        let full = encode_envelope(&Envelope::signed(3, &b"payload"[..], &b"signature"[..]));
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            let decoded = EnvelopeCodec.decode(&mut partial).expect("decode partial");
            assert!(decoded.is_none(), "cut at {cut} should not yield a frame");
            assert_eq!(partial.len(), cut, "cut at {cut} consumed input");
        }
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let first = Envelope::plain(1, &b"one"[..]);
        let second = Envelope::signed(2, &b"two"[..], &b"s"[..]);
        let mut buf = encode_envelope(&first);
        buf.extend_from_slice(&encode_envelope(&second));

        assert_eq!(EnvelopeCodec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(EnvelopeCodec.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(EnvelopeCodec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let mut buf = BytesMut::from(&[0x7f, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        let err = EnvelopeCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN as u32 + 1);
        let err = SizedCodec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_payload_roundtrips() {
        let mut buf = BytesMut::new();
        SizedCodec.encode(Bytes::new(), &mut buf).unwrap();
        assert_eq!(SizedCodec.decode(&mut buf).unwrap(), Some(Bytes::new()));
    }

    fn arb_envelope() -> impl Strategy<Value = Envelope> {
        (
            any::<u32>(),
            proptest::collection::vec(any::<u8>(), 0..256),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..96)),
        )
            .prop_map(|(sender_id, payload, signature)| Envelope {
                sender_id,
                payload: payload.into(),
                signature: signature.map(Bytes::from),
            })
    }

    proptest! {
        #[test]
        fn envelope_roundtrip(envelope in arb_envelope()) {
            let mut buf = encode_envelope(&envelope);
            prop_assert_eq!(buf.len(), envelope.encoded_len());
            prop_assert_eq!(EnvelopeCodec.decode(&mut buf).unwrap(), Some(envelope));
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn sized_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let payload = Bytes::from(payload);
            let mut buf = BytesMut::new();
            SizedCodec.encode(payload.clone(), &mut buf).unwrap();
            prop_assert_eq!(SizedCodec.decode(&mut buf).unwrap(), Some(payload));
        }

        #[test]
        fn split_delivery_matches_whole(envelope in arb_envelope(), split in any::<prop::sample::Index>()) {
            let bytes = encode_envelope(&envelope);
            let at = split.index(bytes.len() + 1);

            let mut buf = BytesMut::from(&bytes[..at]);
            let early = EnvelopeCodec.decode(&mut buf).unwrap();
            let decoded = match early {
                Some(frame) => frame,
                None => {
                    buf.extend_from_slice(&bytes[at..]);
                    EnvelopeCodec.decode(&mut buf).unwrap().expect("complete frame")
                }
            };
            prop_assert_eq!(decoded, envelope);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn sized_split_delivery_matches_whole(payload in proptest::collection::vec(any::<u8>(), 0..128), split in any::<prop::sample::Index>()) {
            let mut whole = BytesMut::new();
            SizedCodec.encode(Bytes::from(payload.clone()), &mut whole).unwrap();
            let at = split.index(whole.len() + 1);

            let mut buf = BytesMut::from(&whole[..at]);
            let decoded = match SizedCodec.decode(&mut buf).unwrap() {
                Some(frame) => frame,
                None => {
                    buf.extend_from_slice(&whole[at..]);
                    SizedCodec.decode(&mut buf).unwrap().expect("complete frame")
                }
            };
            prop_assert_eq!(&decoded[..], &payload[..]);
        }
    }
}
