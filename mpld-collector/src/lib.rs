// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The supervisor engine: spawns a subcommand, collects everything the
//! resulting process tree says — raw bytes on inherited stdio streams,
//! raw bytes on late-joining stream connections, structured datagrams —
//! and serializes it all through one framing sink onto one output stream.
//!
//! The whole server is cooperative on a single thread: acceptors,
//! per-connection readers, the datagram receiver, the signal relay and the
//! child waiter are all tasks on a current-thread runtime, and the only
//! lock is the output mutex that keeps framed records whole.

#![cfg(unix)]

pub mod framing;

mod dgram_server;
mod signal_relay;
mod stream_server;
mod supervisor;

pub use framing::{
    make_sink, FramingRegistry, FramingSink, JsonFraming, LineFraming, LogfmtFraming, NoneFraming,
    SinkConstructor,
};

use anyhow::Context;
use framing::SharedSink;
use manual_future::ManualFuture;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use supervisor::ChildSpec;
use tokio::net::{UnixDatagram, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stream socket filename inside the runtime directory.
pub const STREAM_SOCKET_NAME: &str = "multiproc_log_device_stream.sock";
/// Datagram socket filename inside the runtime directory.
pub const DGRAM_SOCKET_NAME: &str = "multiproc_log_device_dgram.sock";

/// How long the drain phase may wait for connected stream clients after
/// the child exits.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals relayed to the child by default. `SIGCHLD` and the
/// untrappables are filtered at installation no matter what this holds.
pub const DEFAULT_TRAP_SIGNALS: &[i32] = &[
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGQUIT,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

pub struct Config {
    /// The subcommand to supervise; must not be empty.
    pub argv: Vec<OsString>,
    /// Forward signals to `-pid` (the child's process group) instead of
    /// `pid`.
    pub kill_pgroup: bool,
    /// Replace the child's stderr with a stream device as well as stdout.
    pub capture_stderr: bool,
    /// Bytes buffered per stream line before a forced split; 0 means
    /// unbounded.
    pub max_line_length: usize,
    pub shutdown_timeout: Duration,
    /// Directory for the socket files. A fresh temporary directory is
    /// created (and removed) when unset.
    pub runtime_dir: Option<PathBuf>,
    pub trap_signals: Vec<i32>,
}

impl Config {
    pub fn new(argv: Vec<OsString>) -> Self {
        Config {
            argv,
            kill_pgroup: false,
            capture_stderr: true,
            max_line_length: 0,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            runtime_dir: None,
            trap_signals: DEFAULT_TRAP_SIGNALS.to_vec(),
        }
    }
}

/// What a post-start hook learns once the child is running.
#[derive(Debug, Clone)]
pub struct StartedChild {
    pub pid: i32,
    pub stream_socket: PathBuf,
    pub dgram_socket: PathBuf,
}

/// Caller-supplied hook, run after the child-ready future resolves. An
/// error here kills the child with SIGKILL, reaps it, and propagates.
pub type StartHook = Box<dyn FnOnce(StartedChild) -> anyhow::Result<()> + Send>;

/// Supervise `config.argv` to completion and return its exit status.
pub async fn run(config: Config, sink: Box<dyn FramingSink>) -> anyhow::Result<ExitStatus> {
    run_with_hook(config, sink, None).await
}

pub async fn run_with_hook(
    config: Config,
    sink: Box<dyn FramingSink>,
    on_start: Option<StartHook>,
) -> anyhow::Result<ExitStatus> {
    let (dir_guard, dir) = match &config.runtime_dir {
        Some(path) => {
            fs::create_dir_all(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            (None, path.clone())
        }
        None => {
            let guard = tempfile::Builder::new()
                .prefix("multiproc_log_device-")
                .tempdir()
                .context("failed to create runtime directory")?;
            let path = guard.path().to_path_buf();
            (Some(guard), path)
        }
    };
    let stream_socket = dir.join(STREAM_SOCKET_NAME);
    let dgram_socket = dir.join(DGRAM_SOCKET_NAME);

    let accept_cancel = CancellationToken::new();
    let dgram_cancel = CancellationToken::new();
    let relay_cancel = CancellationToken::new();

    let result = serve(
        &config,
        sink,
        on_start,
        &stream_socket,
        &dgram_socket,
        &accept_cancel,
        &dgram_cancel,
        &relay_cancel,
    )
    .await;

    // On the normal path these are already cancelled; on an error path
    // this winds the ingest tasks down before the sockets are unlinked.
    accept_cancel.cancel();
    dgram_cancel.cancel();
    relay_cancel.cancel();
    let _ = fs::remove_file(&stream_socket);
    let _ = fs::remove_file(&dgram_socket);
    match dir_guard {
        Some(guard) => drop(guard),
        None => {
            let _ = fs::remove_dir(&dir);
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    config: &Config,
    sink: Box<dyn FramingSink>,
    on_start: Option<StartHook>,
    stream_socket: &Path,
    dgram_socket: &Path,
    accept_cancel: &CancellationToken,
    dgram_cancel: &CancellationToken,
    relay_cancel: &CancellationToken,
) -> anyhow::Result<ExitStatus> {
    let _ = fs::remove_file(stream_socket);
    let _ = fs::remove_file(dgram_socket);
    let listener = UnixListener::bind(stream_socket)
        .with_context(|| format!("failed to bind {}", stream_socket.display()))?;
    let dgram = UnixDatagram::bind(dgram_socket)
        .with_context(|| format!("failed to bind {}", dgram_socket.display()))?;

    let sink: SharedSink = Arc::new(Mutex::new(sink));

    let relay = signal_relay::SignalRelay::new()?;
    for &signum in &config.trap_signals {
        relay.handle_trap(signum);
    }

    let acceptor = tokio::spawn(stream_server::accept_loop(
        listener,
        sink.clone(),
        config.max_line_length,
        accept_cancel.clone(),
    ));
    let receiver = tokio::spawn(dgram_server::receive_loop(
        dgram,
        sink.clone(),
        dgram_cancel.clone(),
    ));

    let mut child = supervisor::spawn_child(&ChildSpec {
        argv: config.argv.clone(),
        stream_socket: stream_socket.to_path_buf(),
        dgram_socket: dgram_socket.to_path_buf(),
        capture_stderr: config.capture_stderr,
    })?;
    let pid = child.id().context("child pid unavailable")? as i32;
    debug!(pid, "child spawned");

    let relay_task = tokio::spawn(relay.forward_loop(
        pid,
        config.kill_pgroup,
        relay_cancel.clone(),
    ));

    // Resolve the child-ready future; the post-start hook, if any, runs
    // off the back of it.
    let (ready, ready_tx) = ManualFuture::new();
    let hook_task = on_start.map(|hook| tokio::spawn(async move { hook(ready.await) }));
    ready_tx
        .complete(StartedChild {
            pid,
            stream_socket: stream_socket.to_path_buf(),
            dgram_socket: dgram_socket.to_path_buf(),
        })
        .await;
    if let Some(task) = hook_task {
        let hook_result = match task.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::Error::new(join_err).context("post-start hook panicked")),
        };
        if let Err(e) = hook_result {
            supervisor::kill_and_reap(&mut child).await;
            return Err(e.context("post-start hook failed"));
        }
    }

    let status = child.wait().await.context("failed to wait for child")?;
    debug!(%status, "child exited; draining stream connections");

    // Phase one: stop accepting, close the stream listener, drain the
    // connections that are still open.
    accept_cancel.cancel();
    let mut connections = acceptor.await.context("stream acceptor failed")?;
    let drained = tokio::time::timeout(config.shutdown_timeout, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "drain timeout expired; aborting remaining stream connections"
        );
        connections.shutdown().await;
    }

    // Phase two: only with every stream gone can the datagram side stop —
    // inherited stream sockets are the best signal that the whole process
    // tree has exited, and grandchildren may send datagrams until then.
    dgram_cancel.cancel();
    receiver.await.context("datagram receiver failed")?;

    relay_cancel.cancel();
    let _ = relay_task.await;

    Ok(status)
}
