// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `multiproc-log-device [options] -- <subcommand> [args...]`
//!
//! Supervises the subcommand and frames everything its process tree emits
//! onto stdout. Diagnostics go to stderr, filtered by the
//! `MULTIPROC_LOG_DEVICE_LOG` environment variable.

use anyhow::{bail, Context};
use clap::error::ErrorKind;
use clap::Parser;
use mpld_collector::{make_sink, Config, FramingRegistry};
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "MULTIPROC_LOG_DEVICE_LOG";

/// Exported symbol a framing plugin must provide.
const PLUGIN_REGISTER_SYMBOL: &str = "multiproc_log_device_register";

#[derive(Parser, Debug)]
#[command(
    name = "multiproc-log-device",
    about = "Collect a subcommand's process-tree output into one framed stream",
    disable_version_flag = true
)]
struct Cli {
    /// Load a framing plugin (a shared library) before the server starts.
    #[arg(short = 'r', long = "require", value_name = "FILE")]
    require: Vec<PathBuf>,

    /// Framing applied to every record: none, line, json, logfmt, or a
    /// plugin-registered name.
    #[arg(short = 'f', long = "framing", value_name = "NAME", default_value = "none")]
    framing: String,

    /// Forward signals to the child's whole process group.
    #[arg(long = "kill-pgroup")]
    kill_pgroup: bool,

    /// Max bytes buffered per stream line; accepts k/M/G suffixes
    /// (1024-based). 0 means unlimited.
    #[arg(
        short = 'l',
        long = "max-line-length",
        value_name = "N",
        default_value = "0",
        value_parser = parse_byte_size
    )]
    max_line_length: usize,

    /// The subcommand to supervise, after `--`.
    #[arg(last = true, required = true, value_name = "SUBCOMMAND", num_args = 1..)]
    subcommand: Vec<OsString>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp) => {
            eprint!("{e}");
            std::process::exit(0);
        }
        Err(e) => {
            eprint!("{e}");
            std::process::exit(1);
        }
    };

    init_logging();

    match supervise(cli) {
        Ok(status) => std::process::exit(exit_code(&status)),
        Err(e) => {
            eprintln!("multiproc-log-device: {e:#}");
            std::process::exit(1);
        }
    }
}

fn supervise(cli: Cli) -> anyhow::Result<ExitStatus> {
    let mut registry = FramingRegistry::default();
    for path in &cli.require {
        load_framing_plugin(path, &mut registry)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    let sink = make_sink(&cli.framing, &registry, Box::new(io::stdout()))?;

    let mut config = Config::new(cli.subcommand);
    config.kill_pgroup = cli.kill_pgroup;
    config.max_line_length = cli.max_line_length;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(mpld_collector::run(config, sink))
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// The subcommand's own exit code when it exited; the conventional
/// `128 + N` when a signal ended it.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        1
    }
}

fn parse_byte_size(input: &str) -> Result<usize, String> {
    let input = input.trim();
    let (digits, multiplier) = match input.char_indices().last() {
        Some((last, 'k' | 'K')) => (&input[..last], 1024usize),
        Some((last, 'm' | 'M')) => (&input[..last], 1024 * 1024),
        Some((last, 'g' | 'G')) => (&input[..last], 1024 * 1024 * 1024),
        _ => (input, 1),
    };
    let value: usize = digits
        .parse()
        .map_err(|_| format!("invalid byte size {input:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size {input:?} overflows"))
}

/// `dlopen` the plugin and hand it the registry through its exported
/// registration function.
fn load_framing_plugin(path: &Path, registry: &mut FramingRegistry) -> anyhow::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).context("path contains a NUL byte")?;
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
    if handle.is_null() {
        bail!("dlopen failed: {}", last_dl_error());
    }

    #[allow(clippy::expect_used)]
    let symbol = CString::new(PLUGIN_REGISTER_SYMBOL).expect("infallible: no NUL in symbol name");
    let func_ptr = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
    if func_ptr.is_null() {
        bail!("plugin does not export {PLUGIN_REGISTER_SYMBOL}");
    }

    let register: unsafe extern "C" fn(*mut FramingRegistry) =
        unsafe { std::mem::transmute(func_ptr) };
    unsafe { register(registry as *mut FramingRegistry) };
    Ok(())
}

fn last_dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown error".to_owned()
    } else {
        unsafe { std::ffi::CStr::from_ptr(err) }
            .to_string_lossy()
            .into_owned()
    }
}
