// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::FramingSink;
use mpld_protocol::StructuredLogMessage;
use std::io::{self, Write};

/// Writes the message text verbatim and nothing else.
pub struct NoneFraming<W> {
    out: W,
}

impl<W: Write + Send> NoneFraming<W> {
    pub fn new(out: W) -> Self {
        NoneFraming { out }
    }
}

impl<W: Write + Send> FramingSink for NoneFraming<W> {
    fn on_message(&mut self, msg: StructuredLogMessage) -> io::Result<()> {
        self.out.write_all(&msg.message_text)?;
        self.out.flush()
    }
}

/// Writes the message text, appending a newline when it lacks one.
pub struct LineFraming<W> {
    out: W,
}

impl<W: Write + Send> LineFraming<W> {
    pub fn new(out: W) -> Self {
        LineFraming { out }
    }
}

impl<W: Write + Send> FramingSink for LineFraming<W> {
    fn on_message(&mut self, msg: StructuredLogMessage) -> io::Result<()> {
        self.out.write_all(&msg.message_text)?;
        if !msg.message_text.ends_with(b"\n") {
            self.out.write_all(b"\n")?;
        }
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait IntoOut<W> {
        fn into_out(self) -> W;
    }

    impl<W: Write + Send> IntoOut<W> for NoneFraming<W> {
        fn into_out(self) -> W {
            self.out
        }
    }

    impl<W: Write + Send> IntoOut<W> for LineFraming<W> {
        fn into_out(self) -> W {
            self.out
        }
    }

    fn framed<S: FramingSink + IntoOut<Vec<u8>>, F: FnOnce(Vec<u8>) -> S>(
        make: F,
        texts: &[&[u8]],
    ) -> Vec<u8> {
        let mut sink = make(Vec::new());
        for text in texts {
            sink.on_message(StructuredLogMessage::new(*text)).unwrap();
        }
        sink.into_out()
    }

    #[test]
    fn none_is_verbatim() {
        let out = framed(NoneFraming::new, &[b"a\n", b"no newline", b"b\n"]);
        assert_eq!(out, b"a\nno newlineb\n");
    }

    #[test]
    fn line_appends_missing_newlines_only() {
        let out = framed(LineFraming::new, &[b"a\n", b"truncated", b"", b"b\n"]);
        assert_eq!(out, b"a\ntruncated\n\nb\n");
    }
}
