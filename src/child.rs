//! Child side of the bootstrap
//!
//! A child starts as `tether --first-stage`, which only speaks the
//! handshake, moves the channel to its fixed descriptors and replaces
//! itself with `tether --runtime`. The runtime builds a router attached
//! to its parent and serves calls until the parent goes away.

use crate::bootstrap::{
    inflate, BootConfig, BOOT_ENV, CHANNEL_READ_FD, CHANNEL_WRITE_FD, EC0, EC1, MAX_PREAMBLE_SIZE,
};
use crate::builtins;
use crate::codec::Codec;
use crate::error::{ContextError, Result};
use crate::invoke::{Dispatcher, Registry};
use crate::logging;
use crate::router::Router;
use crate::side::{adopt_fd, set_cloexec, Side};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread;

pub const FIRST_STAGE_FLAG: &str = "--first-stage";
pub const RUNTIME_FLAG: &str = "--runtime";

/// Run the child side if this process was started as one
///
/// Binaries that serve their own functions call this first thing in
/// `main`, passing their registry; the builtins are added to it.
pub fn run_if_child(registry: Registry) -> Option<Result<()>> {
    match env::args().nth(1).as_deref() {
        Some(FIRST_STAGE_FLAG) => Some(first_stage().map_err(ContextError::from)),
        Some(RUNTIME_FLAG) => Some(runtime(registry)),
        _ => None,
    }
}

/// Borrow an inherited standard descriptor without closing it on drop
fn borrow_fd(fd: RawFd) -> ManuallyDrop<File> {
    // SAFETY: 0 and 1 are open for the life of the process; ManuallyDrop
    // keeps them from being closed here.
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd) })
}

fn dup2(from: RawFd, to: RawFd) -> io::Result<()> {
    // SAFETY: dup2 only manipulates the descriptor table.
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Read the decimal length line of the preamble
fn read_length(input: &mut impl Read) -> io::Result<usize> {
    let mut digits = String::new();
    let mut byte = [0u8; 1];
    loop {
        input.read_exact(&mut byte)?;
        match byte[0] {
            b'\n' => break,
            b @ b'0'..=b'9' if digits.len() < 10 => digits.push(b as char),
            other => return Err(invalid(format!("bad preamble length byte {:#04x}", other))),
        }
    }
    let len: usize = digits
        .parse()
        .map_err(|_| invalid("empty preamble length"))?;
    if len > MAX_PREAMBLE_SIZE {
        return Err(invalid(format!("preamble too large: {} bytes", len)));
    }
    Ok(len)
}

/// `--first-stage`: receive the boot config and exec the runtime
///
/// Only returns on failure.
pub fn first_stage() -> io::Result<()> {
    let mut stdin = borrow_fd(0);
    let mut stdout = borrow_fd(1);

    stdout.write_all(EC0)?;
    stdout.flush()?;

    let len = read_length(&mut *stdin)?;
    let mut body = vec![0u8; len];
    stdin.read_exact(&mut body)?;
    let json = inflate(&body)?;
    let boot = BootConfig::from_json(&json).map_err(|e| invalid(e.to_string()))?;

    dup2(0, CHANNEL_READ_FD)?;
    dup2(1, CHANNEL_WRITE_FD)?;
    stdout.write_all(EC1)?;
    stdout.flush()?;

    let exe = env::current_exe()?;
    Err(Command::new(exe)
        .arg0(format!("tether:{}", boot.name))
        .arg(RUNTIME_FLAG)
        .env(BOOT_ENV, json)
        .exec())
}

/// Keep stray reads and prints away from the channel
fn isolate_stdio() -> io::Result<()> {
    let null = OpenOptions::new().read(true).open("/dev/null")?;
    dup2(null.as_raw_fd(), 0)?;
    dup2(2, 1)?;
    set_cloexec(CHANNEL_READ_FD)?;
    set_cloexec(CHANNEL_WRITE_FD)?;
    Ok(())
}

/// `--runtime`: serve the parent until it disconnects or asks us to stop
pub fn runtime(mut registry: Registry) -> Result<()> {
    let json = env::var(BOOT_ENV)
        .map_err(|_| ContextError::BootstrapFailed(format!("{} is not set", BOOT_ENV)))?;
    env::remove_var(BOOT_ENV);
    let boot = BootConfig::from_json(&json)?;
    isolate_stdio()?;

    // SAFETY: the first stage placed the channel on these descriptors and
    // nothing else in this process refers to them.
    let receive = Side::new("receive", unsafe { adopt_fd(CHANNEL_READ_FD) })?;
    let transmit = Side::new("transmit", unsafe { adopt_fd(CHANNEL_WRITE_FD) })?;
    let codec = Codec::new(boot.auth_key()?).with_max_frame_size(boot.max_frame_size);

    let config = boot.router_config();
    let log_level = config.log_level;
    let router = Router::for_child(boot.context_id, boot.name.clone(), boot.parent_id, config)?;
    logging::init_child(&router, boot.parent_id, log_level);

    builtins::register(&mut registry);
    let dispatcher = Dispatcher::new(&router, registry);
    router.attach_upstream(codec, receive, transmit)?;
    if let Err(err) = watch_signals(&router) {
        tracing::warn!(error = %err, "signal handling unavailable");
    }

    tracing::debug!(context = %boot.name, id = boot.context_id, pid = std::process::id(), "runtime ready");
    dispatcher.run();

    router.shutdown();
    router.join();
    Ok(())
}

/// Shut the router down on SIGTERM or SIGINT
fn watch_signals(router: &Router) -> io::Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let router = router.clone();
    thread::Builder::new()
        .name("tether-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                tracing::info!(signal, "terminating on signal");
                router.shutdown();
            }
        })?;
    Ok(())
}
