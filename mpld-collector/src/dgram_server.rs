// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::framing::SharedSink;
use mpld_protocol::{decode_message, WireMessage, MAX_DATAGRAM_SIZE};
use sendfd::RecvWithFd;
use std::fs::File;
use std::io::{Read, Seek};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use tokio::net::UnixDatagram;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Most datagrams carry no descriptors and a proxy carries one; anything
/// beyond this is a misbehaving producer and gets closed unread.
const MAX_PASSED_FDS: usize = 4;

/// Receive structured datagrams until cancelled. A malformed datagram is
/// dropped with a note; it must never take the receiver down.
///
/// After cancellation the socket is drained without blocking: stream
/// connections close later than this cancel fires, and a just-forked
/// grandchild may have queued datagrams right up to that point.
pub(crate) async fn receive_loop(socket: UnixDatagram, sink: SharedSink, shutdown: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        select! {
            _ = shutdown.cancelled() => break,
            ready = socket.readable() => {
                if ready.is_err() {
                    break;
                }
                match recv_one(&socket, &mut buf) {
                    Ok(Some((len, fds))) => handle_datagram(&buf[..len], fds, &sink),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "datagram receive failed"),
                }
            }
        }
    }
    loop {
        match recv_one(&socket, &mut buf) {
            Ok(Some((len, fds))) => handle_datagram(&buf[..len], fds, &sink),
            _ => break,
        }
    }
}

fn recv_one(
    socket: &UnixDatagram,
    buf: &mut [u8],
) -> std::io::Result<Option<(usize, Vec<OwnedFd>)>> {
    let mut fds: [RawFd; MAX_PASSED_FDS] = [-1; MAX_PASSED_FDS];
    match socket.recv_with_fd(buf, &mut fds) {
        Ok((len, nfds)) => {
            // Own every received descriptor immediately so each one is
            // closed no matter how handling goes.
            let fds = fds[..nfds]
                .iter()
                .map(|&fd| unsafe { OwnedFd::from_raw_fd(fd) })
                .collect();
            Ok(Some((len, fds)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

fn handle_datagram(data: &[u8], fds: Vec<OwnedFd>, sink: &SharedSink) {
    match decode_message(data) {
        Ok((WireMessage::Log(msg), _)) => forward(msg, sink),
        Ok((WireMessage::FileProxy, _)) => {
            let Some(fd) = fds.into_iter().next() else {
                debug!("attached-file proxy datagram carried no descriptor");
                return;
            };
            match read_proxied_message(fd) {
                Ok(msg) => forward(msg, sink),
                Err(e) => debug!(error = %e, "discarding bad proxied payload"),
            }
        }
        Ok((other, _)) => debug!(kind = other.kind(), "discarding unexpected datagram"),
        Err(e) => debug!(error = %e, "discarding malformed datagram"),
    }
}

fn read_proxied_message(fd: OwnedFd) -> anyhow::Result<mpld_protocol::StructuredLogMessage> {
    let mut file = File::from(fd);
    file.rewind()?;
    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    match decode_message(&payload)? {
        (WireMessage::Log(msg), _) => Ok(msg),
        (other, _) => anyhow::bail!("proxied payload is a {}", other.kind()),
    }
}

fn forward(msg: mpld_protocol::StructuredLogMessage, sink: &SharedSink) {
    if let Err(e) = sink.lock().unwrap().on_message(msg) {
        warn!(error = %e, "failed to write framed record");
    }
}
