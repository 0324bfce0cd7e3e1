use bytes::{Buf, BufMut};
use ciborium::Value;

use crate::error::CodecError;

/// Fixed SMP header length preceding every CBOR body.
pub const FRAME_HEADER_LEN: usize = 8;

pub const OP_READ: u8 = 0;
pub const OP_READ_RSP: u8 = 1;
pub const OP_WRITE: u8 = 2;
pub const OP_WRITE_RSP: u8 = 3;

/// Decoded SMP header. Multi-byte fields are big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: u8,
    pub flags: u8,
    pub len: u16,
    pub group: u16,
    pub seq: u8,
    pub id: u8,
}

impl FrameHeader {
    /// Parses the first eight bytes of `bytes`, if present.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return None;
        }
        let mut buf = &bytes[..FRAME_HEADER_LEN];
        Some(Self {
            op: buf.get_u8(),
            flags: buf.get_u8(),
            len: buf.get_u16(),
            group: buf.get_u16(),
            seq: buf.get_u8(),
            id: buf.get_u8(),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u8(self.op);
        out.put_u8(self.flags);
        out.put_u16(self.len);
        out.put_u16(self.group);
        out.put_u8(self.seq);
        out.put_u8(self.id);
    }
}

/// One complete inbound or outbound SMP frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    /// `None` when the header declares a zero-length body.
    pub body: Option<Value>,
}

impl Frame {
    /// Looks up a text key in a map body.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.as_ref().and_then(|body| map_get(body, key))
    }

    pub fn int_field(&self, key: &str) -> Option<i128> {
        self.field(key).and_then(value_as_i128)
    }
}

/// Reads the declared body length from a buffer holding at least four bytes.
pub fn declared_body_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < 4 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[2], bytes[3]]) as usize)
}

pub fn encode_body(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Encodes an outbound frame with `flags = 0`. A missing body encodes as
/// `len = 0` with no trailing bytes.
pub fn encode_frame(
    op: u8,
    group: u16,
    id: u8,
    seq: u8,
    body: Option<&Value>,
) -> Result<Vec<u8>, CodecError> {
    let body = match body {
        Some(value) => encode_body(value)?,
        None => Vec::new(),
    };
    let len = u16::try_from(body.len())
        .map_err(|_| CodecError::BodyTooLarge { len: body.len() })?;
    let header = FrameHeader {
        op,
        flags: 0,
        len,
        group,
        seq,
        id,
    };
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    header.write_to(&mut out);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes exactly one frame. The header length must match the remaining
/// bytes and the body must be a single CBOR item.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let header = FrameHeader::parse(bytes).ok_or_else(|| {
        CodecError::MalformedFrame(format!("{} bytes is shorter than a header", bytes.len()))
    })?;
    let body = &bytes[FRAME_HEADER_LEN..];
    if body.len() != header.len as usize {
        return Err(CodecError::MalformedFrame(format!(
            "header declares {} body bytes, got {}",
            header.len,
            body.len()
        )));
    }
    if body.is_empty() {
        return Ok(Frame { header, body: None });
    }
    let mut reader = body;
    let value: Value = ciborium::de::from_reader(&mut reader)
        .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
    if !reader.is_empty() {
        return Err(CodecError::MalformedFrame(format!(
            "{} trailing bytes after body",
            reader.len()
        )));
    }
    Ok(Frame {
        header,
        body: Some(value),
    })
}

/// Builds a CBOR map with text keys, preserving entry order.
pub fn text_map<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    Value::Map(
        entries
            .into_iter()
            .map(|(key, value)| (Value::Text(key.to_string()), value))
            .collect(),
    )
}

pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

pub fn value_as_i128(value: &Value) -> Option<i128> {
    value.as_integer().map(i128::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_big_endian() {
        let frame = encode_frame(OP_WRITE, 0x0140, 7, 9, None).expect("frame should encode");
        assert_eq!(frame, vec![2, 0, 0, 0, 0x01, 0x40, 9, 7]);
        let header = FrameHeader::parse(&frame).expect("header should parse");
        assert_eq!(header.group, 0x0140);
        assert_eq!(header.seq, 9);
        assert_eq!(header.id, 7);
    }

    #[test]
    fn empty_body_decodes_to_none() {
        let frame = decode_frame(&[3, 0, 0, 0, 0, 0, 1, 5]).expect("frame should decode");
        assert_eq!(frame.header.op, OP_WRITE_RSP);
        assert!(frame.body.is_none());
        assert!(frame.field("rc").is_none());
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut bytes = encode_frame(
            OP_WRITE,
            0,
            0,
            0,
            Some(&text_map([("d", Value::Text("hi".into()))])),
        )
        .expect("frame should encode");
        bytes.push(0x00);
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_trailing_cbor_bytes() {
        // Two CBOR items (0x01, 0x02) behind a header declaring both bytes.
        let bytes = [3, 0, 0, 2, 0, 0, 0, 0, 0x01, 0x02];
        assert!(matches!(
            decode_frame(&bytes),
            Err(CodecError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(decode_frame(&[0, 0, 0]).is_err());
    }

    #[test]
    fn integer_fields_are_readable() {
        let body = text_map([
            ("rc", Value::Integer(0.into())),
            ("off", Value::Integer(132.into())),
        ]);
        let bytes = encode_frame(OP_WRITE_RSP, 1, 1, 4, Some(&body)).expect("frame should encode");
        let frame = decode_frame(&bytes).expect("frame should decode");
        assert_eq!(frame.int_field("rc"), Some(0));
        assert_eq!(frame.int_field("off"), Some(132));
        assert_eq!(frame.int_field("len"), None);
    }

    #[test]
    fn body_over_u16_is_rejected() {
        let body = Value::Bytes(vec![0u8; u16::MAX as usize]);
        assert!(matches!(
            encode_frame(OP_WRITE, 1, 1, 0, Some(&body)),
            Err(CodecError::BodyTooLarge { .. })
        ));
    }
}
