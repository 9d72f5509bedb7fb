// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::msg::{StreamHello, StructuredLogMessage};
use crate::value::{Atom, AttrKey, AttrMap, AttrValue};
use crate::{EXT_ATOM, EXT_FILE_PROXY, EXT_LOG_MESSAGE, EXT_STREAM_HELLO, EXT_TIMESTAMP};
use chrono::{DateTime, Utc};
use rmpv::Value;

/// Encode one structured log message as a single extension value.
pub fn encode_log_message(msg: &StructuredLogMessage) -> Vec<u8> {
    let mut payload = Vec::with_capacity(msg.message_text.len() + 64);
    write_bin(&mut payload, &msg.message_text);
    write_value(&mut payload, attr_map_value(&msg.attributes));
    write_value(&mut payload, opt_int_value(msg.pid));
    write_value(&mut payload, opt_int_value(msg.tid));
    write_value(&mut payload, opt_atom_value(msg.stream_type.as_ref()));
    wrap_ext(EXT_LOG_MESSAGE, &payload)
}

/// Encode the one-shot stream handshake.
pub fn encode_stream_hello(hello: &StreamHello) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    write_value(&mut payload, attr_map_value(&hello.attributes));
    write_value(&mut payload, opt_int_value(hello.pid));
    write_value(&mut payload, opt_atom_value(hello.stream_type.as_ref()));
    wrap_ext(EXT_STREAM_HELLO, &payload)
}

/// Encode the empty "payload is in the attached fd" marker.
pub fn encode_file_proxy() -> Vec<u8> {
    wrap_ext(EXT_FILE_PROXY, &[])
}

fn wrap_ext(tag: i8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);
    #[allow(clippy::expect_used)]
    rmp::encode::write_ext_meta(&mut out, payload.len() as u32, tag)
        .expect("infallible: writing to a Vec cannot fail");
    out.extend_from_slice(payload);
    out
}

fn write_value(out: &mut Vec<u8>, value: Value) {
    #[allow(clippy::expect_used)]
    rmpv::encode::write_value(out, &value).expect("infallible: writing to a Vec cannot fail");
}

// The message text is written directly so a large payload is not copied
// into an intermediate Value first.
fn write_bin(out: &mut Vec<u8>, data: &[u8]) {
    #[allow(clippy::expect_used)]
    rmp::encode::write_bin(out, data).expect("infallible: writing to a Vec cannot fail");
}

fn attr_map_value(map: &AttrMap) -> Value {
    Value::Map(
        map.iter()
            .map(|(k, v)| (attr_key_value(k), attr_value_value(v)))
            .collect(),
    )
}

fn attr_key_value(key: &AttrKey) -> Value {
    match key {
        AttrKey::Str(s) => Value::from(s.as_str()),
        AttrKey::Atom(a) => atom_value(a),
    }
}

fn attr_value_value(value: &AttrValue) -> Value {
    match value {
        AttrValue::Null => Value::Nil,
        AttrValue::Bool(b) => Value::Boolean(*b),
        AttrValue::Int(i) => Value::from(*i),
        AttrValue::Float(f) => Value::F64(*f),
        AttrValue::Str(s) => Value::from(s.as_str()),
        AttrValue::Timestamp(ts) => Value::Ext(EXT_TIMESTAMP, timestamp_bytes(ts)),
        AttrValue::List(items) => Value::Array(items.iter().map(attr_value_value).collect()),
        AttrValue::Map(map) => attr_map_value(map),
    }
}

fn atom_value(atom: &Atom) -> Value {
    Value::Ext(EXT_ATOM, atom.as_str().as_bytes().to_vec())
}

fn opt_int_value(value: Option<i32>) -> Value {
    match value {
        Some(v) => Value::from(v),
        None => Value::Nil,
    }
}

fn opt_atom_value(value: Option<&Atom>) -> Value {
    match value {
        Some(atom) => atom_value(atom),
        None => Value::Nil,
    }
}

/// Standard MessagePack timestamp payload: the 8-byte packed form when the
/// instant fits, the 12-byte form otherwise.
fn timestamp_bytes(ts: &DateTime<Utc>) -> Vec<u8> {
    let sec = ts.timestamp();
    let nsec = ts.timestamp_subsec_nanos();
    if sec >= 0 && sec < (1i64 << 34) {
        (((nsec as u64) << 34) | sec as u64).to_be_bytes().to_vec()
    } else {
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&nsec.to_be_bytes());
        bytes.extend_from_slice(&sec.to_be_bytes());
        bytes
    }
}
