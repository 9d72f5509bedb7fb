// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::FramingSink;
use chrono::{DateTime, SecondsFormat, Utc};
use mpld_protocol::{AttrValue, StructuredLogMessage};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::io::{self, Write};

/// One compact JSON object per message. Built-in fields live under a
/// nested `"_mpld"` object so they can never collide with user attributes;
/// the message text comes last.
pub struct JsonFraming<W> {
    out: W,
}

impl<W: Write + Send> JsonFraming<W> {
    pub fn new(out: W) -> Self {
        JsonFraming { out }
    }
}

impl<W: Write + Send> FramingSink for JsonFraming<W> {
    fn on_message(&mut self, msg: StructuredLogMessage) -> io::Result<()> {
        let mut line = serde_json::to_vec(&JsonRecord(&msg))?;
        line.push(b'\n');
        self.out.write_all(&line)?;
        self.out.flush()
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

struct JsonRecord<'a>(&'a StructuredLogMessage);

impl Serialize for JsonRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let msg = self.0;
        let mut map = serializer.serialize_map(None)?;
        if msg.pid.is_some() || msg.tid.is_some() || msg.stream_type.is_some() {
            map.serialize_entry("_mpld", &Builtins(msg))?;
        }
        for (key, value) in &msg.attributes {
            map.serialize_entry(key.as_str(), &JsonAttr(value))?;
        }
        map.serialize_entry("message", &String::from_utf8_lossy(&msg.message_text))?;
        map.end()
    }
}

struct Builtins<'a>(&'a StructuredLogMessage);

impl Serialize for Builtins<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let msg = self.0;
        let mut map = serializer.serialize_map(None)?;
        if let Some(stream_type) = &msg.stream_type {
            map.serialize_entry("stream_type", stream_type.as_str())?;
        }
        if let Some(pid) = msg.pid {
            map.serialize_entry("pid", &pid)?;
        }
        if let Some(tid) = msg.tid {
            map.serialize_entry("tid", &tid)?;
        }
        map.end()
    }
}

/// Serializes an attribute value, preserving map insertion order.
pub(crate) struct JsonAttr<'a>(pub(crate) &'a AttrValue);

impl Serialize for JsonAttr<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            AttrValue::Null => serializer.serialize_unit(),
            AttrValue::Bool(b) => serializer.serialize_bool(*b),
            AttrValue::Int(i) => serializer.serialize_i64(*i),
            AttrValue::Float(f) => serializer.serialize_f64(*f),
            AttrValue::Str(s) => serializer.serialize_str(s),
            AttrValue::Timestamp(ts) => serializer.serialize_str(&format_timestamp(ts)),
            AttrValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&JsonAttr(item))?;
                }
                seq.end()
            }
            AttrValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key.as_str(), &JsonAttr(value))?;
                }
                map.end()
            }
        }
    }
}
