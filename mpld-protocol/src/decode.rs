// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::msg::{StreamHello, StructuredLogMessage, WireMessage};
use crate::value::{Atom, AttrKey, AttrMap, AttrValue};
use crate::{EXT_ATOM, EXT_FILE_PROXY, EXT_LOG_MESSAGE, EXT_STREAM_HELLO, EXT_TIMESTAMP};
use chrono::{DateTime, Utc};
use rmpv::Value;
use std::io::{self, Cursor};

/// Why a buffer failed to decode. `Truncated` is recoverable: the caller
/// simply has not read a whole message yet.
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    /// More bytes are needed before a complete message can be decoded.
    Truncated,
    /// The message carried an extension tag this peer does not know.
    UnknownExtension(i8),
    /// The buffer is not a valid message.
    InvalidFormat(String),
    /// A string or atom contained invalid UTF-8.
    Utf8Error(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "message is incomplete"),
            DecodeError::UnknownExtension(tag) => write!(f, "unknown extension tag {tag}"),
            DecodeError::InvalidFormat(msg) => write!(f, "invalid message: {msg}"),
            DecodeError::Utf8Error(msg) => write!(f, "invalid utf-8: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one extension-framed message from the front of `buf`.
///
/// Returns the message and the number of bytes it occupied; trailing bytes
/// are left for the caller (on stream connections they are the first bytes
/// of the raw phase).
pub fn decode_message(buf: &[u8]) -> Result<(WireMessage, usize), DecodeError> {
    let mut cursor = Cursor::new(buf);
    let value = rmpv::decode::read_value(&mut cursor).map_err(map_read_err)?;
    let consumed = cursor.position() as usize;

    let msg = match value {
        Value::Ext(EXT_LOG_MESSAGE, payload) => {
            WireMessage::Log(log_message_from_payload(&payload)?)
        }
        Value::Ext(EXT_STREAM_HELLO, payload) => {
            WireMessage::Hello(stream_hello_from_payload(&payload)?)
        }
        Value::Ext(EXT_FILE_PROXY, _) => WireMessage::FileProxy,
        Value::Ext(tag, _) => return Err(DecodeError::UnknownExtension(tag)),
        other => {
            return Err(DecodeError::InvalidFormat(format!(
                "expected an extension-framed message, got {other}"
            )))
        }
    };
    Ok((msg, consumed))
}

fn map_read_err(err: rmpv::decode::Error) -> DecodeError {
    use rmpv::decode::Error as E;
    let truncated = match &err {
        E::InvalidMarkerRead(e) | E::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        #[allow(unreachable_patterns)]
        _ => false,
    };
    if truncated {
        DecodeError::Truncated
    } else {
        DecodeError::InvalidFormat(err.to_string())
    }
}

fn log_message_from_payload(payload: &[u8]) -> Result<StructuredLogMessage, DecodeError> {
    let [text, attributes, pid, tid, stream_type] = read_values::<5>(payload)?;
    Ok(StructuredLogMessage {
        message_text: text_from(text)?,
        attributes: attr_map_from(attributes)?,
        pid: opt_i32_from(pid)?,
        tid: opt_i32_from(tid)?,
        stream_type: opt_atom_from(stream_type)?,
    })
}

fn stream_hello_from_payload(payload: &[u8]) -> Result<StreamHello, DecodeError> {
    let [attributes, pid, stream_type] = read_values::<3>(payload)?;
    Ok(StreamHello {
        attributes: attr_map_from(attributes)?,
        pid: opt_i32_from(pid)?,
        stream_type: opt_atom_from(stream_type)?,
    })
}

// Inside an extension payload truncation is no longer recoverable: the
// outer message was complete, so a short payload is just malformed.
fn read_values<const N: usize>(payload: &[u8]) -> Result<[Value; N], DecodeError> {
    let mut cursor = Cursor::new(payload);
    let mut values = Vec::with_capacity(N);
    for _ in 0..N {
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| DecodeError::InvalidFormat(format!("bad extension payload: {e}")))?;
        values.push(value);
    }
    values
        .try_into()
        .map_err(|_| DecodeError::InvalidFormat("bad extension payload".to_owned()))
}

fn text_from(value: Value) -> Result<Vec<u8>, DecodeError> {
    match value {
        Value::Binary(bytes) => Ok(bytes),
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Nil => Ok(Vec::new()),
        other => Err(DecodeError::InvalidFormat(format!(
            "message text must be bytes, got {other}"
        ))),
    }
}

fn attr_map_from(value: Value) -> Result<AttrMap, DecodeError> {
    match value {
        Value::Nil => Ok(AttrMap::new()),
        Value::Map(entries) => attr_entries_from(entries),
        other => Err(DecodeError::InvalidFormat(format!(
            "attributes must be a map, got {other}"
        ))),
    }
}

fn attr_entries_from(entries: Vec<(Value, Value)>) -> Result<AttrMap, DecodeError> {
    entries
        .into_iter()
        .map(|(k, v)| Ok((attr_key_from(k)?, attr_value_from(v)?)))
        .collect()
}

fn attr_key_from(value: Value) -> Result<AttrKey, DecodeError> {
    match value {
        Value::String(s) => Ok(AttrKey::Str(utf8(s)?)),
        Value::Ext(EXT_ATOM, bytes) => Ok(AttrKey::Atom(atom_from(bytes)?)),
        other => Err(DecodeError::InvalidFormat(format!(
            "attribute key must be a string or atom, got {other}"
        ))),
    }
}

fn attr_value_from(value: Value) -> Result<AttrValue, DecodeError> {
    Ok(match value {
        Value::Nil => AttrValue::Null,
        Value::Boolean(b) => AttrValue::Bool(b),
        Value::Integer(i) => AttrValue::Int(i.as_i64().ok_or_else(|| {
            DecodeError::InvalidFormat("integer attribute out of range".to_owned())
        })?),
        Value::F32(f) => AttrValue::Float(f.into()),
        Value::F64(f) => AttrValue::Float(f),
        Value::String(s) => AttrValue::Str(utf8(s)?),
        Value::Ext(EXT_TIMESTAMP, bytes) => AttrValue::Timestamp(timestamp_from(&bytes)?),
        // Atoms have no slot in the value sum; read them as plain strings.
        Value::Ext(EXT_ATOM, bytes) => AttrValue::Str(atom_from(bytes)?.as_str().to_owned()),
        Value::Array(items) => AttrValue::List(
            items
                .into_iter()
                .map(attr_value_from)
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => AttrValue::Map(attr_entries_from(entries)?),
        other => {
            return Err(DecodeError::InvalidFormat(format!(
                "unsupported attribute value: {other}"
            )))
        }
    })
}

fn opt_i32_from(value: Value) -> Result<Option<i32>, DecodeError> {
    match value {
        Value::Nil => Ok(None),
        Value::Integer(i) => i
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| DecodeError::InvalidFormat("process id out of range".to_owned())),
        other => Err(DecodeError::InvalidFormat(format!(
            "process id must be an integer, got {other}"
        ))),
    }
}

fn opt_atom_from(value: Value) -> Result<Option<Atom>, DecodeError> {
    match value {
        Value::Nil => Ok(None),
        Value::Ext(EXT_ATOM, bytes) => Ok(Some(atom_from(bytes)?)),
        Value::String(s) => Ok(Some(Atom::from(utf8(s)?))),
        other => Err(DecodeError::InvalidFormat(format!(
            "stream type must be an atom, got {other}"
        ))),
    }
}

fn atom_from(bytes: Vec<u8>) -> Result<Atom, DecodeError> {
    String::from_utf8(bytes)
        .map(Atom::from)
        .map_err(|_| DecodeError::Utf8Error("atom name is not utf-8".to_owned()))
}

fn utf8(s: rmpv::Utf8String) -> Result<String, DecodeError> {
    s.into_str()
        .ok_or_else(|| DecodeError::Utf8Error("string is not utf-8".to_owned()))
}

fn timestamp_from(bytes: &[u8]) -> Result<DateTime<Utc>, DecodeError> {
    let (sec, nsec) = match bytes.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(bytes);
            (i64::from(u32::from_be_bytes(b)), 0)
        }
        8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(bytes);
            let packed = u64::from_be_bytes(b);
            ((packed & 0x3_FFFF_FFFF) as i64, (packed >> 34) as u32)
        }
        12 => {
            let mut nsec = [0u8; 4];
            nsec.copy_from_slice(&bytes[..4]);
            let mut sec = [0u8; 8];
            sec.copy_from_slice(&bytes[4..]);
            (i64::from_be_bytes(sec), u32::from_be_bytes(nsec))
        }
        n => {
            return Err(DecodeError::InvalidFormat(format!(
                "timestamp payload of {n} bytes"
            )))
        }
    };
    DateTime::from_timestamp(sec, nsec)
        .ok_or_else(|| DecodeError::InvalidFormat("timestamp out of range".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{encode_file_proxy, encode_log_message, encode_stream_hello};

    fn sample_message() -> StructuredLogMessage {
        let mut attributes = AttrMap::new();
        attributes.insert("service", "billing");
        attributes.insert("attempt", 3i64);
        attributes.insert("cached", false);
        let mut nested = AttrMap::new();
        nested.insert("zone", "eu-1");
        attributes.insert("placement", nested);
        StructuredLogMessage {
            message_text: b"payment settled\n".to_vec(),
            attributes,
            pid: Some(4242),
            tid: Some(77),
            stream_type: Some(Atom::new("structured")),
        }
    }

    #[test]
    fn log_message_round_trip() {
        let msg = sample_message();
        let encoded = encode_log_message(&msg);
        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, WireMessage::Log(msg));
    }

    #[test]
    fn attribute_order_survives_the_wire() {
        let encoded = encode_log_message(&sample_message());
        let (decoded, _) = decode_message(&encoded).unwrap();
        let WireMessage::Log(msg) = decoded else {
            panic!("expected a log message");
        };
        let keys: Vec<&str> = msg.attributes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["service", "attempt", "cached", "placement"]);
    }

    #[test]
    fn stream_hello_round_trip() {
        let mut hello = StreamHello::new(Some(99), Some(Atom::new("stdout")));
        hello.attributes.insert("host", "worker-3");
        let encoded = encode_stream_hello(&hello);
        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, WireMessage::Hello(hello));
    }

    #[test]
    fn file_proxy_round_trip() {
        let encoded = encode_file_proxy();
        let (decoded, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, WireMessage::FileProxy);
    }

    #[test]
    fn trailing_bytes_are_left_for_the_caller() {
        let mut encoded = encode_stream_hello(&StreamHello::default());
        let hello_len = encoded.len();
        encoded.extend_from_slice(b"first raw bytes");
        let (_, consumed) = decode_message(&encoded).unwrap();
        assert_eq!(consumed, hello_len);
    }

    #[test]
    fn every_prefix_reports_truncated() {
        let encoded = encode_log_message(&sample_message());
        for end in 0..encoded.len() {
            assert_eq!(
                decode_message(&encoded[..end]).unwrap_err(),
                DecodeError::Truncated,
                "prefix of {end} bytes"
            );
        }
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let mut out = Vec::new();
        rmp::encode::write_ext_meta(&mut out, 0, 9).unwrap();
        assert_eq!(
            decode_message(&out).unwrap_err(),
            DecodeError::UnknownExtension(9)
        );
    }

    #[test]
    fn non_extension_value_is_rejected() {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &Value::from("plain string")).unwrap();
        assert!(matches!(
            decode_message(&out).unwrap_err(),
            DecodeError::InvalidFormat(_)
        ));
    }

    #[test]
    fn timestamps_round_trip_in_both_encodings() {
        let modern = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let ancient = DateTime::from_timestamp(-1, 0).unwrap();
        for ts in [modern, ancient] {
            let mut msg = StructuredLogMessage::new("t");
            msg.attributes.insert("at", ts);
            let (decoded, _) = decode_message(&encode_log_message(&msg)).unwrap();
            let WireMessage::Log(decoded) = decoded else {
                panic!("expected a log message");
            };
            assert_eq!(decoded.attributes.get("at"), Some(&AttrValue::Timestamp(ts)));
        }
    }

    #[test]
    fn string_message_text_is_accepted() {
        // Other producers may send the text as str rather than bin.
        let mut payload = Vec::new();
        for value in [
            Value::from("hello"),
            Value::Map(vec![]),
            Value::Nil,
            Value::Nil,
            Value::Nil,
        ] {
            rmpv::encode::write_value(&mut payload, &value).unwrap();
        }
        let mut out = Vec::new();
        rmp::encode::write_ext_meta(&mut out, payload.len() as u32, EXT_LOG_MESSAGE).unwrap();
        out.extend_from_slice(&payload);

        let (decoded, _) = decode_message(&out).unwrap();
        let WireMessage::Log(msg) = decoded else {
            panic!("expected a log message");
        };
        assert_eq!(msg.message_text, b"hello");
    }
}
