// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{socket_path_from_env, DGRAM_SOCKET_ENV};
use mpld_protocol::{
    encode_file_proxy, encode_log_message, Atom, AttrMap, StructuredLogMessage, MAX_DATAGRAM_SIZE,
};
use nix::sys::socket::{setsockopt, sockopt};
use sendfd::SendWithFd;
use std::io::{self, Seek, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

/// Stream type stamped on messages sent through a structured device.
pub const STRUCTURED_STREAM_TYPE: &str = "structured";

/// A connection to the collector's datagram endpoint. One datagram per
/// message; payloads too large for a datagram are spilled to an anonymous
/// file whose descriptor rides along as ancillary data.
#[derive(Debug)]
pub struct StructuredDevice {
    socket: UnixDatagram,
}

impl StructuredDevice {
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        // Advisory only; the fd fallback keeps the exact value non-critical.
        let _ = setsockopt(&socket, sockopt::SndBuf, &MAX_DATAGRAM_SIZE);
        Ok(StructuredDevice { socket })
    }

    /// Connect through the path exported in `MULTIPROC_LOG_DEVICE_DGRAM`.
    pub fn from_env() -> io::Result<Self> {
        Self::connect(socket_path_from_env(DGRAM_SOCKET_ENV)?)
    }

    /// Send a message with `pid`, `tid` and `stream_type` filled in for the
    /// calling process.
    pub fn log(&self, text: impl Into<Vec<u8>>, attributes: AttrMap) -> io::Result<()> {
        self.send_message(&StructuredLogMessage {
            message_text: text.into(),
            attributes,
            pid: Some(std::process::id() as i32),
            tid: current_tid(),
            stream_type: Some(Atom::new(STRUCTURED_STREAM_TYPE)),
        })
    }

    /// Send a fully caller-controlled message. The collector forwards it
    /// as-is without overriding any field.
    pub fn send_message(&self, msg: &StructuredLogMessage) -> io::Result<()> {
        let payload = encode_log_message(msg);
        if payload.len() > MAX_DATAGRAM_SIZE {
            return self.send_via_fd(&payload);
        }
        match self.socket.send(&payload) {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EMSGSIZE) | Some(libc::ENOBUFS)
                ) =>
            {
                self.send_via_fd(&payload)
            }
            Err(e) => Err(e),
        }
    }

    // The receiver reads the shared open-file description, so the file must
    // be rewound before its descriptor goes on the wire.
    fn send_via_fd(&self, payload: &[u8]) -> io::Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(payload)?;
        file.rewind()?;
        self.socket
            .send_with_fd(&encode_file_proxy(), &[file.as_raw_fd()])?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn current_tid() -> Option<i32> {
    Some(nix::unistd::gettid().as_raw())
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> Option<i32> {
    None
}
