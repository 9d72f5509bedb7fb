// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::framing::SharedSink;
use anyhow::{bail, Context};
use mpld_protocol::{decode_message, DecodeError, StreamHello, StructuredLogMessage, WireMessage};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Accept stream connections until cancelled, one task per connection.
///
/// Returns the set of still-running connection tasks so the server loop
/// can drain them on its own clock; the listening socket closes when this
/// function returns.
pub(crate) async fn accept_loop(
    listener: UnixListener,
    sink: SharedSink,
    max_line_length: usize,
    shutdown: CancellationToken,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let sink = sink.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, sink, max_line_length).await {
                            debug!(error = %e, "stream connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept stream connection");
                }
            },
        }
    }
    connections
}

async fn serve_connection(
    mut stream: UnixStream,
    sink: SharedSink,
    max_line_length: usize,
) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(8 * 1024);
    let mut tmp = [0u8; 8 * 1024];

    // Handshake phase: exactly one message, which must be a hello.
    let (hello, consumed) = loop {
        match decode_message(&buf) {
            Ok((WireMessage::Hello(hello), consumed)) => break (hello, consumed),
            Ok((other, _)) => bail!("expected a stream hello, got a {}", other.kind()),
            Err(DecodeError::Truncated) => {
                let n = stream.read(&mut tmp).await?;
                if n == 0 {
                    bail!("connection closed before the handshake completed");
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            Err(e) => return Err(e).context("bad handshake"),
        }
    };

    // Raw phase: bytes after the handshake are already line data.
    let mut chunker = LineChunker::new(max_line_length);
    chunker.push(&buf[consumed..]);
    loop {
        while let Some(chunk) = chunker.next_chunk() {
            emit(&sink, &hello, chunk)?;
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            if let Some(rest) = chunker.finish() {
                emit(&sink, &hello, rest)?;
            }
            return Ok(());
        }
        chunker.push(&tmp[..n]);
    }
}

fn emit(sink: &SharedSink, hello: &StreamHello, chunk: Vec<u8>) -> anyhow::Result<()> {
    let msg = StructuredLogMessage {
        message_text: chunk,
        attributes: hello.attributes.clone(),
        pid: hello.pid,
        tid: None,
        stream_type: hello.stream_type.clone(),
    };
    sink.lock().unwrap().on_message(msg)?;
    Ok(())
}

/// Splits a byte stream into per-message chunks: at each newline, or after
/// `max` bytes accumulate without one (`max == 0` means unbounded). A
/// forced split leaves the line's eventual real newline to come through as
/// an empty-with-newline chunk, which lets downstream framings
/// re-synchronize.
pub(crate) struct LineChunker {
    buf: Vec<u8>,
    max: usize,
}

impl LineChunker {
    pub(crate) fn new(max: usize) -> Self {
        LineChunker {
            buf: Vec::new(),
            max,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let search_end = if self.max > 0 {
            self.buf.len().min(self.max)
        } else {
            self.buf.len()
        };
        if let Some(pos) = self.buf[..search_end].iter().position(|&b| b == b'\n') {
            return Some(self.take(pos + 1));
        }
        if self.max > 0 && self.buf.len() >= self.max {
            return Some(self.take(self.max));
        }
        None
    }

    pub(crate) fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    fn take(&mut self, len: usize) -> Vec<u8> {
        let rest = self.buf.split_off(len);
        std::mem::replace(&mut self.buf, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(max: usize, input: &[u8]) -> Vec<Vec<u8>> {
        let mut chunker = LineChunker::new(max);
        chunker.push(input);
        let mut out = Vec::new();
        while let Some(chunk) = chunker.next_chunk() {
            out.push(chunk);
        }
        out.extend(chunker.finish());
        out
    }

    #[test]
    fn unbounded_splits_at_newlines_only() {
        assert_eq!(
            chunks(0, b"one\ntwo\nrest"),
            [b"one\n".to_vec(), b"two\n".to_vec(), b"rest".to_vec()]
        );
    }

    #[test]
    fn long_lines_are_broken_at_the_limit() {
        assert_eq!(
            chunks(10, b"short\na_very_long_line\nalso_short\n"),
            [
                b"short\n".to_vec(),
                b"a_very_lon".to_vec(),
                b"g_line\n".to_vec(),
                b"also_short".to_vec(),
                b"\n".to_vec(),
            ]
        );
    }

    #[test]
    fn exactly_limit_sized_line_is_emitted_whole() {
        assert_eq!(
            chunks(4, b"abcd\nef"),
            [b"abcd".to_vec(), b"\n".to_vec(), b"ef".to_vec()]
        );
    }

    #[test]
    fn partial_line_waits_for_more_input() {
        let mut chunker = LineChunker::new(0);
        chunker.push(b"beg");
        assert_eq!(chunker.next_chunk(), None);
        chunker.push(b"inning\n");
        assert_eq!(chunker.next_chunk(), Some(b"beginning\n".to_vec()));
        assert_eq!(chunker.finish(), None);
    }
}
