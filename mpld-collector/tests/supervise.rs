// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end runs of the server loop against real `/bin/sh` subcommands.

#![cfg(unix)]

use mpld_collector::{make_sink, run, run_with_hook, Config, FramingRegistry, StartHook};
use mpld_device::StructuredDevice;
use mpld_protocol::{AttrMap, MAX_DATAGRAM_SIZE};
use std::ffi::OsString;
use std::io::Write;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

/// A `Write` handle into a shared buffer standing in for stdout.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn sh(script: &str) -> Vec<OsString> {
    ["/bin/sh", "-c", script].map(OsString::from).to_vec()
}

async fn supervise(
    script: &str,
    framing: &str,
    tweak: impl FnOnce(&mut Config),
    hook: Option<StartHook>,
) -> (Vec<u8>, ExitStatus) {
    let out = SharedBuf::default();
    let sink = make_sink(framing, &FramingRegistry::default(), Box::new(out.clone())).unwrap();
    let mut config = Config::new(sh(script));
    tweak(&mut config);
    let status = run_with_hook(config, sink, hook).await.unwrap();
    (out.contents(), status)
}

#[tokio::test]
async fn exit_status_propagates_and_silence_stays_silent() {
    let (out, status) = supervise("exit 34", "none", |_| {}, None).await;
    assert!(out.is_empty());
    assert_eq!(status.code(), Some(34));
}

#[tokio::test]
async fn stdout_lines_become_json_records() {
    let (out, status) = supervise("echo hello", "json", |_| {}, None).await;
    assert_eq!(status.code(), Some(0));

    let record: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(record["message"], "hello\n");
    assert_eq!(record["_mpld"]["stream_type"], "stdout");
    assert!(record["_mpld"]["pid"].is_i64());
}

#[tokio::test]
async fn stderr_is_captured_with_its_own_stream_type() {
    let (out, _) = supervise("echo oops >&2", "json", |_| {}, None).await;
    let record: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(record["_mpld"]["stream_type"], "stderr");
    assert_eq!(record["message"], "oops\n");
}

#[tokio::test]
async fn stderr_capture_can_be_disabled() {
    let (out, status) = supervise(
        "echo only-on-stderr >&2",
        "none",
        |config| config.capture_stderr = false,
        None,
    )
    .await;
    assert_eq!(status.code(), Some(0));
    assert!(out.is_empty());
}

#[tokio::test]
async fn long_lines_split_at_the_limit() {
    let (out, _) = supervise(
        "printf 'short\\na_very_long_line\\nalso_short\\n'",
        "line",
        |config| config.max_line_length = 10,
        None,
    )
    .await;
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "short\na_very_lon\ng_line\nalso_short\n\n"
    );
}

#[tokio::test]
async fn the_child_has_no_controlling_terminal() {
    let script = "if (exec 3</dev/tty) 2>/dev/null; then echo attached; else echo detached; fi";
    let (out, _) = supervise(script, "line", |_| {}, None).await;
    assert_eq!(out, b"detached\n");
}

#[tokio::test]
async fn grandchild_writes_survive_the_parent_by_way_of_the_drain() {
    let script = "echo m1; ( sleep 0.3; echo m2 ) & exit 0";
    let (out, status) = supervise(script, "line", |_| {}, None).await;
    assert_eq!(status.code(), Some(0));
    assert_eq!(out, b"m1\nm2\n");
}

#[tokio::test]
async fn structured_messages_arrive_with_fields_intact() {
    let hook: StartHook = Box::new(|started| {
        let device = StructuredDevice::connect(&started.dgram_socket)?;
        let mut attributes = AttrMap::new();
        attributes.insert("foo", "baz");
        device.log("m2", attributes)?;
        Ok(())
    });
    let (out, _) = supervise("sleep 0.3", "json", |_| {}, Some(hook)).await;

    let record: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(record["message"], "m2");
    assert_eq!(record["foo"], "baz");
    assert_eq!(record["_mpld"]["stream_type"], "structured");
    assert_eq!(record["_mpld"]["pid"], i64::from(std::process::id() as i32));
}

#[tokio::test]
async fn oversize_structured_payloads_arrive_byte_identical() {
    let payload = vec![b'x'; MAX_DATAGRAM_SIZE + 2];
    let expected = payload.clone();
    let hook: StartHook = Box::new(move |started| {
        let device = StructuredDevice::connect(&started.dgram_socket)?;
        device.log(payload, AttrMap::new())?;
        Ok(())
    });
    let (out, _) = supervise("sleep 0.3", "line", |_| {}, Some(hook)).await;

    let mut want = expected;
    want.push(b'\n');
    assert_eq!(out, want);
}

#[tokio::test]
async fn bad_peers_do_not_disturb_the_stream() {
    let hook: StartHook = Box::new(|started| {
        // A stream client that never sends a valid handshake.
        let mut garbage = std::os::unix::net::UnixStream::connect(&started.stream_socket)?;
        garbage.write_all(b"\xc0 not a handshake")?;
        // A datagram that decodes to nothing.
        let socket = std::os::unix::net::UnixDatagram::unbound()?;
        socket.send_to(b"junk", &started.dgram_socket)?;
        Ok(())
    });
    let (out, status) = supervise("sleep 0.2; echo still-works", "line", |_| {}, Some(hook)).await;
    assert_eq!(status.code(), Some(0));
    assert_eq!(out, b"still-works\n");
}

#[tokio::test]
async fn exec_failure_surfaces_as_the_child_status() {
    let out = SharedBuf::default();
    let sink = make_sink("none", &FramingRegistry::default(), Box::new(out.clone())).unwrap();
    let config = Config::new(vec![OsString::from("/no/such/binary/anywhere")]);
    let status = run(config, sink).await.unwrap();
    assert_eq!(status.code(), Some(127));
    assert!(out.contents().is_empty());
}

#[tokio::test]
async fn non_executable_subcommand_exits_126() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-executable");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();

    let out = SharedBuf::default();
    let sink = make_sink("none", &FramingRegistry::default(), Box::new(out.clone())).unwrap();
    let status = run(Config::new(vec![path.into_os_string()]), sink)
        .await
        .unwrap();
    assert_eq!(status.code(), Some(126));
}

#[tokio::test]
async fn failing_start_hook_kills_the_child() {
    let out = SharedBuf::default();
    let sink = make_sink("none", &FramingRegistry::default(), Box::new(out.clone())).unwrap();
    let hook: StartHook = Box::new(|_| anyhow::bail!("startup hook exploded"));
    let err = run_with_hook(Config::new(sh("sleep 30")), sink, Some(hook))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("post-start hook"));
}

#[tokio::test]
async fn runtime_artifacts_are_removed_on_shutdown() {
    let parent = tempfile::tempdir().unwrap();
    let dir = parent.path().join("rt");
    let out = SharedBuf::default();
    let sink = make_sink("none", &FramingRegistry::default(), Box::new(out.clone())).unwrap();
    let mut config = Config::new(sh("exit 0"));
    config.runtime_dir = Some(dir.clone());
    run(config, sink).await.unwrap();
    assert!(!dir.exists());
}
