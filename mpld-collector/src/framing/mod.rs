// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pluggable formatting stage between ingest and the output stream.
//!
//! Every ingest path funnels into one [`FramingSink`]; the server
//! serializes `on_message` calls under a single mutex, so a sink only has
//! to keep each record's bytes together itself.

use anyhow::anyhow;
use mpld_protocol::StructuredLogMessage;
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

mod json;
mod logfmt;
mod plain;

pub use json::JsonFraming;
pub use logfmt::LogfmtFraming;
pub use plain::{LineFraming, NoneFraming};

pub trait FramingSink: Send {
    /// Turn one message into bytes on the output stream. Calls are
    /// serialized by the server; each call must write a whole record.
    fn on_message(&mut self, msg: StructuredLogMessage) -> io::Result<()>;
}

pub(crate) type SharedSink = Arc<Mutex<Box<dyn FramingSink>>>;

/// Constructor for a custom framing: receives the output stream, returns
/// the sink that will own it.
pub type SinkConstructor = Box<dyn Fn(Box<dyn Write + Send>) -> Box<dyn FramingSink> + Send>;

/// Named custom framings, registered before the server starts (by the
/// embedding application or by a loaded plugin).
#[derive(Default)]
pub struct FramingRegistry {
    entries: HashMap<String, SinkConstructor>,
}

impl FramingRegistry {
    pub fn register(&mut self, name: impl Into<String>, constructor: SinkConstructor) {
        self.entries.insert(name.into(), constructor);
    }

    pub fn build(
        &self,
        name: &str,
        out: Box<dyn Write + Send>,
    ) -> Option<Box<dyn FramingSink>> {
        self.entries.get(name).map(|constructor| constructor(out))
    }
}

/// Resolve a framing name: the four built-ins first, then the registry.
pub fn make_sink(
    name: &str,
    registry: &FramingRegistry,
    out: Box<dyn Write + Send>,
) -> anyhow::Result<Box<dyn FramingSink>> {
    match name {
        "none" => Ok(Box::new(NoneFraming::new(out))),
        "line" => Ok(Box::new(LineFraming::new(out))),
        "json" => Ok(Box::new(JsonFraming::new(out))),
        "logfmt" => Ok(Box::new(LogfmtFraming::new(out))),
        other => registry
            .build(other, out)
            .ok_or_else(|| anyhow!("unknown framing {other:?}")),
    }
}
