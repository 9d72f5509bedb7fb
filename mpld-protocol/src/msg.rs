// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::value::{Atom, AttrMap};

/// The unit of output: one chunk of text plus the metadata that travels
/// with it. Stream connections synthesize these from raw bytes; structured
/// devices send them fully formed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredLogMessage {
    /// Raw message bytes. May contain embedded newlines and need not be
    /// valid UTF-8.
    pub message_text: Vec<u8>,
    pub attributes: AttrMap,
    pub pid: Option<i32>,
    pub tid: Option<i32>,
    pub stream_type: Option<Atom>,
}

impl StructuredLogMessage {
    pub fn new(message_text: impl Into<Vec<u8>>) -> Self {
        StructuredLogMessage {
            message_text: message_text.into(),
            ..Default::default()
        }
    }
}

/// First frame on every stream connection. The fields are remembered for
/// the connection's lifetime and stamped onto every line read after it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHello {
    pub attributes: AttrMap,
    pub pid: Option<i32>,
    pub stream_type: Option<Atom>,
}

impl StreamHello {
    pub fn new(pid: Option<i32>, stream_type: Option<Atom>) -> Self {
        StreamHello {
            attributes: AttrMap::new(),
            pid,
            stream_type,
        }
    }
}

/// Everything a decoder can produce from one wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Log(StructuredLogMessage),
    Hello(StreamHello),
    /// The real payload is in the first file descriptor attached to the
    /// datagram carrying this marker.
    FileProxy,
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Log(_) => "structured log message",
            WireMessage::Hello(_) => "stream hello",
            WireMessage::FileProxy => "attached file proxy",
        }
    }
}
