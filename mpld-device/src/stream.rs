// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{socket_path_from_env, STREAM_SOCKET_ENV};
use mpld_protocol::{encode_stream_hello, StreamHello};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

/// A connection to the collector's stream endpoint.
///
/// The handshake is sent once during `connect`; afterwards the device is a
/// plain byte sink. The collector splits whatever is written here into
/// lines and stamps each one with the handshake's attributes, pid and
/// stream type.
#[derive(Debug)]
pub struct StreamDevice {
    socket: UnixStream,
}

impl StreamDevice {
    pub fn connect<P: AsRef<Path>>(path: P, hello: &StreamHello) -> io::Result<Self> {
        let socket = UnixStream::connect(path)?;
        (&socket).write_all(&encode_stream_hello(hello))?;
        Ok(StreamDevice { socket })
    }

    /// Connect through the path exported in `MULTIPROC_LOG_DEVICE_STREAM`.
    pub fn from_env(hello: &StreamHello) -> io::Result<Self> {
        Self::connect(socket_path_from_env(STREAM_SOCKET_ENV)?, hello)
    }

    pub fn into_inner(self) -> UnixStream {
        self.socket
    }
}

impl Write for StreamDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket.flush()
    }
}

impl AsRawFd for StreamDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl IntoRawFd for StreamDevice {
    fn into_raw_fd(self) -> RawFd {
        self.socket.into_raw_fd()
    }
}
