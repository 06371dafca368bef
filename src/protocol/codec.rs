//! Framing and binary (de)serialization of [`Message`] values over an
//! encrypted stream.
//!
//! Frame shape: `u32` big-endian byte length, followed by that many bytes of
//! encoded message. Encoding itself is a flat, self-describing binary
//! format (name, then each field as `name, type tag, value`) so that
//! `MessageSchema::verify` can run against the decoded value without any
//! message-specific code, matching the teacher's
//! `ProtocolHandler::{serialize_message, deserialize_message}` shape in
//! `ciresnave-commy/src/manager/protocol.rs` generalized from JSON-only to
//! this crate's typed-field wire format.

use std::io;

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{WiredError, WiredResult};
use crate::protocol::message::{Field, Message};

/// Maximum frame size accepted from a peer. Prevents a malicious or broken
/// client from claiming an unbounded allocation via the length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

const TAG_BOOL: u8 = 0;
const TAG_ENUM: u8 = 1;
const TAG_INT32: u8 = 2;
const TAG_INT64: u8 = 3;
const TAG_UINT32: u8 = 4;
const TAG_UINT64: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_DATE: u8 = 7;
const TAG_UUID: u8 = 8;
const TAG_DATA: u8 = 9;
const TAG_LIST: u8 = 10;
const TAG_OOB: u8 = 11;

/// Encodes a message to its flat binary representation (without the
/// length-prefix frame header).
pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    write_string(&mut out, message.name());
    let fields: Vec<_> = message.fields().collect();
    out.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    for (name, value) in fields {
        write_string(&mut out, name);
        encode_field(&mut out, value);
    }
    out
}

/// Decodes a message from its flat binary representation.
pub fn decode_message(bytes: &[u8]) -> WiredResult<Message> {
    let mut cursor = Cursor { data: bytes, pos: 0 };
    let name = cursor.read_string()?;
    let mut message = Message::new(name);
    let count = cursor.read_u32()?;
    for _ in 0..count {
        let field_name = cursor.read_string()?;
        let value = decode_field(&mut cursor)?;
        message.set(field_name, value);
    }
    Ok(message)
}

fn encode_field(out: &mut Vec<u8>, field: &Field) {
    match field {
        Field::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Field::Enum(v) => {
            out.push(TAG_ENUM);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Field::Int32(v) => {
            out.push(TAG_INT32);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Field::Int64(v) => {
            out.push(TAG_INT64);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Field::Uint32(v) => {
            out.push(TAG_UINT32);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Field::Uint64(v) => {
            out.push(TAG_UINT64);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Field::String(s) => {
            out.push(TAG_STRING);
            write_string(out, s);
        }
        Field::Date(d) => {
            out.push(TAG_DATE);
            out.extend_from_slice(&d.timestamp().to_be_bytes());
        }
        Field::Uuid(u) => {
            out.push(TAG_UUID);
            out.extend_from_slice(u.as_bytes());
        }
        Field::Data(d) => {
            out.push(TAG_DATA);
            out.extend_from_slice(&(d.len() as u32).to_be_bytes());
            out.extend_from_slice(d);
        }
        Field::List(items) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_field(out, item);
            }
        }
        Field::Oob(d) => {
            out.push(TAG_OOB);
            out.extend_from_slice(&(d.len() as u32).to_be_bytes());
            out.extend_from_slice(d);
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> WiredResult<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(WiredError::Protocol("truncated message".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> WiredResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> WiredResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> WiredResult<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> WiredResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_i64(&mut self) -> WiredResult<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_string(&mut self) -> WiredResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| WiredError::Protocol(format!("invalid utf8 string: {}", e)))
    }

    fn read_bytes(&mut self) -> WiredResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn decode_field(cursor: &mut Cursor<'_>) -> WiredResult<Field> {
    let tag = cursor.read_u8()?;
    Ok(match tag {
        TAG_BOOL => Field::Bool(cursor.read_u8()? != 0),
        TAG_ENUM => Field::Enum(cursor.read_i32()?),
        TAG_INT32 => Field::Int32(cursor.read_i32()?),
        TAG_INT64 => Field::Int64(cursor.read_i64()?),
        TAG_UINT32 => Field::Uint32(cursor.read_u32()?),
        TAG_UINT64 => Field::Uint64(cursor.read_u64()?),
        TAG_STRING => Field::String(cursor.read_string()?),
        TAG_DATE => {
            let secs = cursor.read_i64()?;
            let date: DateTime<Utc> = Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| WiredError::Protocol("invalid date field".to_string()))?;
            Field::Date(date)
        }
        TAG_UUID => {
            let bytes = cursor.take(16)?;
            Field::Uuid(Uuid::from_slice(bytes).unwrap())
        }
        TAG_DATA => Field::Data(cursor.read_bytes()?),
        TAG_LIST => {
            let count = cursor.read_u32()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_field(cursor)?);
            }
            Field::List(items)
        }
        TAG_OOB => Field::Oob(cursor.read_bytes()?),
        other => {
            return Err(WiredError::Protocol(format!(
                "unknown field type tag {}",
                other
            )))
        }
    })
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Reads one length-prefixed frame and decodes it into a [`Message`].
/// Fails with [`WiredError::Protocol`] on short read, an oversized frame, or
/// a framing/decode violation (spec.md §4.A).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> WiredResult<Message> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(io_to_protocol_error)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(WiredError::Protocol(format!(
            "frame of {} bytes exceeds maximum of {} bytes",
            len, MAX_FRAME_BYTES
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(io_to_protocol_error)?;
    decode_message(&payload)
}

/// Encodes and writes one [`Message`] as a length-prefixed frame.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> WiredResult<()> {
    let payload = encode_message(message);
    let len = payload.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(io_to_protocol_error)?;
    writer
        .write_all(&payload)
        .await
        .map_err(io_to_protocol_error)?;
    writer.flush().await.map_err(io_to_protocol_error)?;
    Ok(())
}

fn io_to_protocol_error(e: io::Error) -> WiredError {
    WiredError::Protocol(format!("framing error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_field_variant() {
        let mut msg = Message::new("wired.test");
        msg.set("a", Field::Bool(true));
        msg.set("b", Field::Enum(3));
        msg.set("c", Field::Int32(-7));
        msg.set("d", Field::Int64(-7_000_000_000));
        msg.set("e", Field::Uint32(9));
        msg.set("f", Field::Uint64(9_000_000_000));
        msg.set("g", Field::String("hello".into()));
        msg.set("h", Field::Uuid(Uuid::nil()));
        msg.set("i", Field::Data(vec![1, 2, 3]));
        msg.set(
            "j",
            Field::List(vec![Field::Bool(false), Field::Int32(1)]),
        );
        msg.set("k", Field::Oob(vec![9, 9]));

        let encoded = encode_message(&msg);
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn read_write_round_trip_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let msg = Message::new("wired.ping").with("wired.transaction", Field::Uint32(1));
        write_message(&mut client, &msg).await.unwrap();
        let received = read_message(&mut server).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let huge_len = (MAX_FRAME_BYTES + 1).to_be_bytes();
        client.write_all(&huge_len).await.unwrap();
        let result = read_message(&mut server).await;
        assert!(result.is_err());
    }
}
