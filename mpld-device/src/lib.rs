// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side emitters for the multiproc log device.
//!
//! A supervised subcommand (or any of its descendants) finds the collector
//! through two environment variables and picks the device matching what it
//! wants to say:
//!
//! - [`StreamDevice`] — a stream-socket connection that sends one
//!   [`StreamHello`](mpld_protocol::StreamHello) and then behaves as a
//!   transparent byte sink, suitable for `dup2` onto stdout/stderr.
//! - [`StructuredDevice`] — a datagram-socket connection carrying one
//!   structured message per datagram, with an automatic file-descriptor
//!   fallback for payloads a datagram cannot hold.

#![cfg(unix)]

mod stream;
mod structured;

pub use stream::StreamDevice;
pub use structured::StructuredDevice;

/// Environment variable holding the stream socket path, exported to the
/// supervised process tree.
pub const STREAM_SOCKET_ENV: &str = "MULTIPROC_LOG_DEVICE_STREAM";

/// Environment variable holding the datagram socket path.
pub const DGRAM_SOCKET_ENV: &str = "MULTIPROC_LOG_DEVICE_DGRAM";

fn socket_path_from_env(var: &str) -> std::io::Result<std::path::PathBuf> {
    std::env::var_os(var)
        .map(std::path::PathBuf::from)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{var} is not set; is this process running under the collector?"),
            )
        })
}
