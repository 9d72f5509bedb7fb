// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire model for the multiproc log device: the attribute value types, the
//! three messages exchanged over the collector sockets, and their
//! MessagePack encoding.
//!
//! Every message is a single MessagePack extension value, so both sides can
//! tell where one message ends without any out-of-band framing:
//!
//! | tag | message | payload |
//! |-----|---------|---------|
//! | 1 | atom | UTF-8 name |
//! | 2 | [`StructuredLogMessage`] | `message_text, attributes, pid, tid, stream_type` |
//! | 3 | [`StreamHello`] | `attributes, pid, stream_type` |
//! | 4 | attached-file proxy | empty |
//!
//! Attribute timestamps use the standard MessagePack timestamp extension
//! (tag -1).

mod decode;
mod encode;
mod msg;
mod value;

pub use decode::{decode_message, DecodeError};
pub use encode::{encode_file_proxy, encode_log_message, encode_stream_hello};
pub use msg::{StreamHello, StructuredLogMessage, WireMessage};
pub use value::{Atom, AttrKey, AttrMap, AttrValue};

/// Extension tag for a small symbolic atom.
pub const EXT_ATOM: i8 = 1;
/// Extension tag for a full structured log message.
pub const EXT_LOG_MESSAGE: i8 = 2;
/// Extension tag for the one-shot stream handshake.
pub const EXT_STREAM_HELLO: i8 = 3;
/// Extension tag for the "payload travels as a passed fd" marker.
pub const EXT_FILE_PROXY: i8 = 4;
/// Standard MessagePack timestamp extension tag.
pub const EXT_TIMESTAMP: i8 = -1;

/// Largest datagram body a structured device will put on the wire.
/// Anything bigger is spilled to an anonymous file and sent as an
/// attached-file proxy instead.
pub const MAX_DATAGRAM_SIZE: usize = 512 * 1024;
