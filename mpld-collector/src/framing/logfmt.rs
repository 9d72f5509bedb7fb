// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::json::{format_timestamp, JsonAttr};
use super::FramingSink;
use mpld_protocol::{AttrValue, StructuredLogMessage};
use std::io::{self, Write};

/// One logfmt line per message: `_mpld.`-prefixed built-in keys, then user
/// attributes in insertion order, then `message` last. A single trailing
/// newline on the message text is stripped before emission.
pub struct LogfmtFraming<W> {
    out: W,
}

impl<W: Write + Send> LogfmtFraming<W> {
    pub fn new(out: W) -> Self {
        LogfmtFraming { out }
    }
}

impl<W: Write + Send> FramingSink for LogfmtFraming<W> {
    fn on_message(&mut self, msg: StructuredLogMessage) -> io::Result<()> {
        let mut line = String::new();
        if let Some(stream_type) = &msg.stream_type {
            push_pair(&mut line, "_mpld.stream_type", stream_type.as_str());
        }
        if let Some(pid) = msg.pid {
            push_pair(&mut line, "_mpld.pid", &pid.to_string());
        }
        if let Some(tid) = msg.tid {
            push_pair(&mut line, "_mpld.tid", &tid.to_string());
        }
        for (key, value) in &msg.attributes {
            push_pair(&mut line, key.as_str(), &value_text(value));
        }
        let text = msg
            .message_text
            .strip_suffix(b"\n")
            .unwrap_or(&msg.message_text);
        push_pair(&mut line, "message", &String::from_utf8_lossy(text));
        line.push('\n');
        self.out.write_all(line.as_bytes())?;
        self.out.flush()
    }
}

fn value_text(value: &AttrValue) -> String {
    match value {
        AttrValue::Null => String::new(),
        AttrValue::Bool(b) => b.to_string(),
        AttrValue::Int(i) => i.to_string(),
        AttrValue::Float(f) => f.to_string(),
        AttrValue::Str(s) => s.clone(),
        AttrValue::Timestamp(ts) => format_timestamp(ts),
        // Nested structures render as their canonical compact JSON form.
        AttrValue::List(_) | AttrValue::Map(_) =>
        {
            #[allow(clippy::expect_used)]
            serde_json::to_string(&JsonAttr(value))
                .expect("infallible: attribute values serialize without errors")
        }
    }
}

fn push_pair(line: &mut String, key: &str, value: &str) {
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(key);
    line.push('=');
    if needs_quoting(value) {
        push_quoted(line, value);
    } else {
        line.push_str(value);
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '=' || c == '\\')
}

fn push_quoted(line: &mut String, value: &str) {
    line.push('"');
    for c in value.chars() {
        match c {
            '"' => line.push_str("\\\""),
            '\\' => line.push_str("\\\\"),
            '\n' => line.push_str("\\n"),
            '\r' => line.push_str("\\r"),
            '\t' => line.push_str("\\t"),
            c => line.push(c),
        }
    }
    line.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use mpld_protocol::{Atom, AttrMap};

    fn frame(msg: StructuredLogMessage) -> String {
        let mut sink = LogfmtFraming::new(Vec::new());
        sink.on_message(msg).unwrap();
        String::from_utf8(sink.out).unwrap()
    }

    #[test]
    fn builtins_then_attributes_then_message() {
        let mut msg = StructuredLogMessage {
            message_text: b"disk almost full\n".to_vec(),
            attributes: AttrMap::new(),
            pid: Some(9),
            tid: Some(10),
            stream_type: Some(Atom::new("stderr")),
        };
        msg.attributes.insert("mount", "/var");
        assert_eq!(
            frame(msg),
            "_mpld.stream_type=stderr _mpld.pid=9 _mpld.tid=10 mount=/var message=\"disk almost full\"\n"
        );
    }

    #[test]
    fn only_one_trailing_newline_is_stripped() {
        assert_eq!(frame(StructuredLogMessage::new("a\n\n")), "message=\"a\\n\"\n");
        assert_eq!(frame(StructuredLogMessage::new("plain")), "message=plain\n");
    }

    #[test]
    fn values_needing_quotes_are_escaped() {
        let mut msg = StructuredLogMessage::new("ok");
        msg.attributes.insert("q", "say \"hi\"\tnow");
        msg.attributes.insert("empty", "");
        msg.attributes.insert("eq", "a=b");
        assert_eq!(
            frame(msg),
            "q=\"say \\\"hi\\\"\\tnow\" empty=\"\" eq=\"a=b\" message=ok\n"
        );
    }

    #[test]
    fn timestamps_and_nested_maps_render_as_single_tokens() {
        let mut inner = AttrMap::new();
        inner.insert("zone", "eu-1");
        let mut msg = StructuredLogMessage::new("ok");
        msg.attributes
            .insert("at", DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        msg.attributes.insert("place", inner);
        assert_eq!(
            frame(msg),
            "at=2023-11-14T22:13:20.000000Z place=\"{\\\"zone\\\":\\\"eu-1\\\"}\" message=ok\n"
        );
    }
}
