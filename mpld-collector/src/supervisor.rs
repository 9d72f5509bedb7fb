// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use mpld_device::{StreamDevice, DGRAM_SOCKET_ENV, STREAM_SOCKET_ENV};
use mpld_protocol::{Atom, StreamHello};
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};
use tracing::debug;

pub(crate) struct ChildSpec {
    pub argv: Vec<OsString>,
    pub stream_socket: PathBuf,
    pub dgram_socket: PathBuf,
    pub capture_stderr: bool,
}

/// Fork and exec the supervised subcommand.
///
/// The pre-exec hook runs in the forked child: it starts a new session
/// (detaching the controlling terminal), replaces stdout — and stderr when
/// captured — with fresh stream-device connections whose handshakes carry
/// the child's own pid, flags every other descriptor close-on-exec, and
/// then performs the exec itself. Keeping the exec inside the hook means
/// an exec failure ends the child with the conventional shell status (127,
/// or 126 when the program is not executable), which the parent observes
/// through `wait` like any other exit.
pub(crate) fn spawn_child(spec: &ChildSpec) -> anyhow::Result<Child> {
    anyhow::ensure!(!spec.argv.is_empty(), "no subcommand given");

    let prepared = PreparedExec::new(
        &spec.argv,
        &[
            (STREAM_SOCKET_ENV, spec.stream_socket.as_os_str()),
            (DGRAM_SOCKET_ENV, spec.dgram_socket.as_os_str()),
        ],
    )?;

    let mut cmd = Command::new(&spec.argv[0]);
    cmd.kill_on_drop(true);

    let stream_socket = spec.stream_socket.clone();
    let capture_stderr = spec.capture_stderr;
    unsafe {
        cmd.pre_exec(move || {
            nix::unistd::setsid().map_err(io::Error::from)?;
            redirect_to_device(&stream_socket, libc::STDOUT_FILENO, "stdout")?;
            if capture_stderr {
                redirect_to_device(&stream_socket, libc::STDERR_FILENO, "stderr")?;
            }
            mark_fds_cloexec();
            prepared.exec()
        });
    }

    cmd.spawn()
        .with_context(|| format!("failed to spawn {:?}", spec.argv[0]))
}

/// argv and the environment additions turned into C strings ahead of the
/// fork, leaving the child side only pointer work before the exec.
struct PreparedExec {
    program: CString,
    argv: Vec<CString>,
    env: Vec<(CString, CString)>,
}

impl PreparedExec {
    fn new(argv: &[OsString], env: &[(&str, &OsStr)]) -> io::Result<Self> {
        let program = to_cstring(argv[0].as_bytes())?;
        let argv = argv
            .iter()
            .map(|arg| to_cstring(arg.as_bytes()))
            .collect::<io::Result<_>>()?;
        let env = env
            .iter()
            .map(|(key, value)| Ok((to_cstring(key.as_bytes())?, to_cstring(value.as_bytes())?)))
            .collect::<io::Result<_>>()?;
        Ok(PreparedExec { program, argv, env })
    }

    /// Runs in the forked child: apply the environment, replace the
    /// process image. Does not return; an exec failure exits with 126 for
    /// a program that cannot be executed, 127 otherwise.
    fn exec(&self) -> ! {
        unsafe {
            for (key, value) in &self.env {
                libc::setenv(key.as_ptr(), value.as_ptr(), 1);
            }
            let mut argv: Vec<*const libc::c_char> =
                self.argv.iter().map(|arg| arg.as_ptr()).collect();
            argv.push(std::ptr::null());
            libc::execvp(self.program.as_ptr(), argv.as_ptr());
            let code = match io::Error::last_os_error().raw_os_error() {
                Some(libc::EACCES) => 126,
                _ => 127,
            };
            libc::_exit(code)
        }
    }
}

fn to_cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "argument contains a NUL byte"))
}

fn redirect_to_device(socket: &Path, target_fd: i32, stream_type: &str) -> io::Result<()> {
    let hello = StreamHello::new(
        Some(unsafe { libc::getpid() }),
        Some(Atom::new(stream_type)),
    );
    let device = StreamDevice::connect(socket, &hello)?;
    let fd = device.into_raw_fd();
    if unsafe { libc::dup2(fd, target_fd) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    unsafe { libc::close(fd) };
    Ok(())
}

/// Flag every descriptor beyond stdio close-on-exec, covering anything
/// leaked into this process from the outside. One call where the kernel
/// has `close_range`; a walk of the descriptor table otherwise.
fn mark_fds_cloexec() {
    #[cfg(target_os = "linux")]
    {
        let done = unsafe {
            libc::close_range(3, libc::c_uint::MAX, libc::CLOSE_RANGE_CLOEXEC as libc::c_int) == 0
        };
        if done {
            return;
        }
    }
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if limit < 0 {
        1024
    } else {
        limit.min(libc::c_long::from(i32::MAX)) as i32
    };
    for fd in 3..limit {
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
}

/// Used when the control path aborts after the child is already running:
/// nothing graceful, just make sure the child is gone and reaped before
/// the error propagates.
pub(crate) async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to kill child");
    }
}
