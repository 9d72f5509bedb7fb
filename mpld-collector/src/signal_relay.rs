// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS signal → self-pipe → child, without doing anything in the handler
//! beyond the one async-signal-safe `write` it is allowed.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Write end of the active relay's self-pipe, or -1. The handler reads
/// this and nothing else.
static RELAY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn relay_handler(signum: libc::c_int) {
    let fd = RELAY_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // Best effort: the pipe is non-blocking, and a dropped byte only
        // loses a duplicate delivery.
        unsafe {
            libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
        }
    }
}

pub(crate) struct SignalRelay {
    read_end: UnixStream,
    write_end: StdUnixStream,
}

impl SignalRelay {
    pub(crate) fn new() -> anyhow::Result<Self> {
        let (read_end, write_end) = StdUnixStream::pair()?;
        read_end.set_nonblocking(true)?;
        write_end.set_nonblocking(true)?;
        RELAY_FD.store(write_end.as_raw_fd(), Ordering::SeqCst);
        Ok(SignalRelay {
            read_end: UnixStream::from_std(read_end)?,
            write_end,
        })
    }

    /// Route `signum` through the relay. Signals that cannot or must not
    /// be trapped are skipped; installation failures are never fatal.
    pub(crate) fn handle_trap(&self, signum: i32) {
        if matches!(signum, libc::SIGCHLD | libc::SIGKILL | libc::SIGSTOP) {
            return;
        }
        let Ok(sig) = Signal::try_from(signum) else {
            return;
        };
        let action = SigAction::new(
            SigHandler::Handler(relay_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe {
            let _ = signal::sigaction(sig, &action);
        }
    }

    /// Forward relayed signal numbers to the child — or to the child's
    /// whole process group when `kill_pgroup` is set.
    pub(crate) async fn forward_loop(
        mut self,
        child_pid: i32,
        kill_pgroup: bool,
        shutdown: CancellationToken,
    ) {
        let target = if kill_pgroup { -child_pid } else { child_pid };
        let mut buf = [0u8; 16];
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                read = self.read_end.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            let Ok(sig) = Signal::try_from(i32::from(byte)) else {
                                continue;
                            };
                            debug!(signal = ?sig, target, "forwarding signal");
                            if let Err(e) = signal::kill(Pid::from_raw(target), sig) {
                                debug!(signal = ?sig, error = %e, "could not forward signal");
                            }
                        }
                    }
                },
            }
        }
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        // Withdraw the fd from the handler before the pipe closes. The
        // handlers themselves stay installed; with no fd published they do
        // nothing.
        let _ = RELAY_FD.compare_exchange(
            self.write_end.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
