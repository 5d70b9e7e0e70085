//! Parent side of starting a child context
//!
//! The sequence every transport shares:
//!
//! 1. Spawn `[program, --first-stage]`, wrapped by the transport's argv.
//! 2. Wait for `EC0\n` on the channel, answering password prompts seen
//!    on stderr (or on the channel) along the way.
//! 3. Write the preamble: `{decimal length}\n{zlib(JSON BootConfig)}`.
//! 4. Wait for `EC1\n`. Anything after it is already framed traffic.
//!
//! A missing or mismatched token, an early end of file or an expired
//! deadline fails the connect with [`ContextError::BootstrapFailed`] and
//! kills the spawned process.

use crate::codec::{AuthKey, Codec};
use crate::config::{ConnectOptions, LogLevel, RouterConfig};
use crate::error::{ContextError, Result};
use crate::protocol::ContextId;
use crate::router::Router;
use crate::side::{set_blocking, set_nonblocking, Side};
use crate::stream::Stream;
use crate::transport::Transport;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// First stage is running and waiting for its preamble
pub const EC0: &[u8] = b"EC0\n";

/// Preamble received; the runtime is about to start
pub const EC1: &[u8] = b"EC1\n";

/// Descriptor the child runtime reads frames from
pub const CHANNEL_READ_FD: i32 = 100;

/// Descriptor the child runtime writes frames to
pub const CHANNEL_WRITE_FD: i32 = 101;

/// Environment variable carrying the boot config into the runtime
pub const BOOT_ENV: &str = "TETHER_BOOT";

/// Largest preamble a first stage accepts
pub const MAX_PREAMBLE_SIZE: usize = 1024 * 1024;

/// Target for lines a child writes to stderr
pub const STDERR_TARGET: &str = "tether::stderr";

const DATA: Token = Token(0);
const STDERR: Token = Token(1);

/// Back-off while the channel refuses a handshake write
const WRITE_RETRY: Duration = Duration::from_millis(5);

/// Longest handshake wait honoured; larger connect timeouts are clamped
const MAX_HANDSHAKE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything a child needs to become a context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootConfig {
    pub context_id: ContextId,
    pub parent_id: ContextId,
    pub name: String,
    /// Hex-encoded stream key
    pub key: String,
    pub log_level: u8,
    pub max_frame_size: u32,
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: Option<u64>,
}

impl BootConfig {
    fn new(router: &Router, id: ContextId, name: &str, key: &AuthKey) -> Self {
        let config = router.config();
        Self {
            context_id: id,
            parent_id: router.id(),
            name: name.to_string(),
            key: key.to_hex(),
            log_level: config.log_level.as_u8(),
            max_frame_size: config.max_frame_size,
            connect_timeout_ms: saturating_millis(config.connect_timeout),
            call_timeout_ms: config.call_timeout.map(saturating_millis),
        }
    }

    /// Settings for the child's own router
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            log_level: LogLevel::from_u8(self.log_level),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
            max_frame_size: self.max_frame_size,
        }
    }

    pub fn auth_key(&self) -> Result<AuthKey> {
        AuthKey::from_hex(&self.key)
            .ok_or_else(|| ContextError::BootstrapFailed("malformed stream key".to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ContextError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ContextError::BootstrapFailed(format!("malformed boot config: {}", e)))
    }

    /// Length line plus compressed JSON, as written to the first stage
    pub fn preamble(&self) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(self.to_json()?.as_bytes())?;
        let body = encoder.finish()?;

        let mut preamble = format!("{}\n", body.len()).into_bytes();
        preamble.extend_from_slice(&body);
        Ok(preamble)
    }
}

/// Inflate a preamble body back into JSON text
pub fn inflate(body: &[u8]) -> io::Result<String> {
    let mut json = String::new();
    ZlibDecoder::new(body)
        .take(MAX_PREAMBLE_SIZE as u64 * 16)
        .read_to_string(&mut json)?;
    Ok(json)
}

/// A spawned transport process and its descriptors
#[derive(Debug)]
pub struct Spawned {
    pub pid: Option<u32>,
    /// Child's stdout, our receive side
    pub read: OwnedFd,
    /// Child's stdin, our transmit side
    pub write: OwnedFd,
    pub stderr: Option<OwnedFd>,
}

/// Starts the process at the far end of a new stream
pub trait Spawner {
    fn spawn(&self, argv: &[String]) -> io::Result<Spawned>;
}

/// Runs argv as a child of this process over a socket pair
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSpawner;

impl Spawner for ProcessSpawner {
    fn spawn(&self, argv: &[String]) -> io::Result<Spawned> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

        let (ours, theirs) = UnixStream::pair()?;
        let theirs = OwnedFd::from(theirs);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::from(theirs.try_clone()?))
            .stdout(Stdio::from(theirs))
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        // The router reaps by pid; dropping Child neither waits nor kills
        let stderr = child.stderr.take().map(OwnedFd::from);
        let ours = OwnedFd::from(ours);
        Ok(Spawned {
            pid: Some(child.id()),
            read: ours.try_clone()?,
            write: ours,
            stderr,
        })
    }
}

/// A child that completed the handshake
#[derive(Debug)]
pub(crate) struct Bootstrapped {
    pub stream: Arc<Stream>,
    pub pid: Option<u32>,
}

/// Spawn and bootstrap the child that will become context `id`
pub(crate) fn connect(
    router: &Router,
    id: ContextId,
    options: &ConnectOptions,
    spawner: &dyn Spawner,
) -> Result<Bootstrapped> {
    let transport = options.method.transport();
    let inner = vec![runtime_program(options, transport)?, "--first-stage".to_string()];
    let argv = transport.build_argv(&inner);
    let timeout = options
        .connect_timeout
        .unwrap_or(router.config().connect_timeout);
    let key = options.key.clone().unwrap_or_else(AuthKey::generate);
    let preamble = BootConfig::new(router, id, &options.name, &key).preamble()?;

    tracing::debug!(context = %options.name, id, ?argv, "spawning");
    let spawned = spawner.spawn(&argv).map_err(|e| {
        ContextError::BootstrapFailed(format!("could not start {}: {}", argv[0], e))
    })?;
    let pid = spawned.pid;

    let exchanged = exchange(spawned, transport, options.password.as_deref(), &preamble, timeout);
    let Exchanged {
        receive,
        transmit,
        leftover,
        stderr,
    } = match exchanged {
        Ok(exchanged) => exchanged,
        Err(err) => {
            tracing::warn!(context = %options.name, error = %err, "bootstrap failed");
            kill_quietly(pid);
            return Err(err);
        }
    };

    if let Some((file, pending)) = stderr {
        pump_stderr(options.name.clone(), file, pending);
    }

    let codec = Codec::new(key).with_max_frame_size(router.config().max_frame_size);
    let stream = Stream::new(
        options.name.clone(),
        router.id(),
        id,
        codec,
        receive,
        transmit,
        router.broker_handle(),
        leftover,
    );
    Ok(Bootstrapped { stream, pid })
}

/// Channel state after a successful handshake
struct Exchanged {
    receive: Side,
    transmit: Side,
    /// Frames that arrived with `EC1`
    leftover: Vec<u8>,
    stderr: Option<(File, Vec<u8>)>,
}

fn exchange(
    spawned: Spawned,
    transport: &dyn Transport,
    password: Option<&str>,
    preamble: &[u8],
    timeout: Duration,
) -> Result<Exchanged> {
    let receive = Side::new("receive", spawned.read)?;
    let transmit = Side::new("transmit", spawned.write)?;
    let mut handshake = Handshake::new(transport, password, spawned.stderr)?;
    let leftover = handshake.run(&receive, &transmit, preamble, timeout)?;
    Ok(Exchanged {
        receive,
        transmit,
        leftover,
        stderr: handshake.into_stderr(),
    })
}

/// Path of the binary to run on the far side
fn runtime_program(options: &ConnectOptions, transport: &dyn Transport) -> Result<String> {
    if let Some(program) = &options.program {
        return Ok(program.display().to_string());
    }
    if transport.is_remote() {
        return Ok("tether".to_string());
    }
    Ok(std::env::current_exe()?.display().to_string())
}

fn kill_quietly(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    let pid = Pid::from_raw(pid as i32);
    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

/// Log a child's stderr line by line until it closes
fn pump_stderr(context: String, file: File, pending: Vec<u8>) {
    if let Err(err) = set_blocking(file.as_raw_fd()) {
        tracing::debug!(context = %context, error = %err, "stderr stays non-blocking");
    }
    let name = format!("tether-stderr-{}", context);
    let spawned = thread::Builder::new().name(name).spawn(move || {
        let mut reader = BufReader::new(io::Cursor::new(pending).chain(file));
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if !text.is_empty() {
                        tracing::info!(target: STDERR_TARGET, context = %context, "{}", text);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "could not start stderr pump");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitReady,
    AwaitBooted,
}

impl Phase {
    fn token(self) -> &'static [u8] {
        match self {
            Phase::AwaitReady => EC0,
            Phase::AwaitBooted => EC1,
        }
    }
}

/// State of one bootstrap handshake
struct Handshake<'a> {
    transport: &'a dyn Transport,
    password: Option<&'a str>,
    password_sent: bool,
    data: Vec<u8>,
    data_eof: bool,
    stderr: Option<File>,
    stderr_buf: Vec<u8>,
    last_stderr: String,
}

impl<'a> Handshake<'a> {
    fn new(
        transport: &'a dyn Transport,
        password: Option<&'a str>,
        stderr: Option<OwnedFd>,
    ) -> Result<Self> {
        let stderr = stderr.map(File::from);
        if let Some(file) = &stderr {
            set_nonblocking(file.as_raw_fd())?;
        }
        Ok(Self {
            transport,
            password,
            password_sent: false,
            data: Vec::new(),
            data_eof: false,
            stderr,
            stderr_buf: Vec::new(),
            last_stderr: String::new(),
        })
    }

    /// Stderr and any partial line, for the pump
    fn into_stderr(self) -> Option<(File, Vec<u8>)> {
        let pending = self.stderr_buf;
        self.stderr.map(|file| (file, pending))
    }

    /// Drive the exchange; returns bytes received after `EC1`
    fn run(
        &mut self,
        receive: &Side,
        transmit: &Side,
        preamble: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let timeout = timeout.min(MAX_HANDSHAKE_WAIT);
        let deadline = Instant::now() + timeout;
        let mut poll = Poll::new()?;
        let data_fd = receive
            .raw_fd()
            .ok_or_else(|| ContextError::BootstrapFailed("channel closed".to_string()))?;
        poll.registry()
            .register(&mut SourceFd(&data_fd), DATA, Interest::READABLE)?;
        if let Some(file) = &self.stderr {
            poll.registry()
                .register(&mut SourceFd(&file.as_raw_fd()), STDERR, Interest::READABLE)?;
        }

        let mut events = Events::with_capacity(8);
        let mut phase = Phase::AwaitReady;
        loop {
            while let Some(rest) = self.check(phase.token(), transmit, deadline)? {
                match phase {
                    Phase::AwaitReady => {
                        tracing::trace!("first stage ready; sending preamble");
                        write_all(transmit, preamble, deadline)?;
                        self.data = rest;
                        phase = Phase::AwaitBooted;
                    }
                    Phase::AwaitBooted => return Ok(rest),
                }
            }
            if self.data_eof {
                return Err(self.failure("child closed the channel during bootstrap"));
            }

            let now = Instant::now();
            if now >= deadline {
                let waiting = String::from_utf8_lossy(phase.token()).trim().to_string();
                return Err(self.failure(&format!("no {} within {:?}", waiting, timeout)));
            }
            match poll.poll(&mut events, Some(deadline - now)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for event in events.iter() {
                match event.token() {
                    DATA => self.drain_data(receive)?,
                    STDERR => self.drain_stderr(transmit, deadline)?,
                    _ => {}
                }
            }
        }
    }

    /// Match buffered channel output against `token`
    ///
    /// Returns the bytes following the token once it is complete.
    fn check(&mut self, token: &[u8], transmit: &Side, deadline: Instant) -> Result<Option<Vec<u8>>> {
        if self.data.len() >= token.len() && self.data.starts_with(token) {
            return Ok(Some(self.data.split_off(token.len())));
        }
        if token.starts_with(&self.data) {
            return Ok(None);
        }
        if self.transport.is_password_prompt(&self.data) {
            self.data.clear();
            self.answer_prompt(transmit, deadline)?;
            return Ok(None);
        }
        Err(ContextError::BootstrapFailed(format!(
            "expected {:?}, got {:?}",
            String::from_utf8_lossy(token),
            String::from_utf8_lossy(&self.data)
        )))
    }

    fn answer_prompt(&mut self, transmit: &Side, deadline: Instant) -> Result<()> {
        if self.password_sent {
            return Err(ContextError::PasswordIncorrect);
        }
        let password = self.password.ok_or(ContextError::PasswordRequired)?;
        tracing::debug!("answering password prompt");
        write_all(transmit, format!("{}\n", password).as_bytes(), deadline)?;
        self.password_sent = true;
        Ok(())
    }

    fn drain_data(&mut self, receive: &Side) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match receive.read(&mut chunk) {
                Ok(0) => {
                    self.data_eof = true;
                    return Ok(());
                }
                Ok(n) => self.data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn drain_stderr(&mut self, transmit: &Side, deadline: Instant) -> Result<()> {
        let Some(mut file) = self.stderr.as_ref() else {
            return Ok(());
        };
        let mut chunk = [0u8; 4096];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.stderr_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if self.transport.is_password_prompt(&self.stderr_buf) {
            self.stderr_buf.clear();
            return self.answer_prompt(transmit, deadline);
        }
        while let Some(end) = self.stderr_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.stderr_buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            if !line.is_empty() {
                tracing::debug!(target: STDERR_TARGET, "{}", line);
                self.last_stderr = line;
            }
        }
        Ok(())
    }

    fn failure(&self, reason: &str) -> ContextError {
        if self.last_stderr.is_empty() {
            ContextError::BootstrapFailed(reason.to_string())
        } else {
            ContextError::BootstrapFailed(format!("{} ({})", reason, self.last_stderr))
        }
    }
}

pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Write everything, waiting out a full socket buffer
fn write_all(side: &Side, mut bytes: &[u8], deadline: Instant) -> Result<()> {
    while !bytes.is_empty() {
        match side.write(bytes) {
            Ok(0) => {
                return Err(ContextError::BootstrapFailed(
                    "channel accepted no bytes".to_string(),
                ))
            }
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(ContextError::BootstrapFailed(
                        "timed out writing to child".to_string(),
                    ));
                }
                thread::sleep(WRITE_RETRY);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(ContextError::BootstrapFailed(format!(
                    "write to child failed: {}",
                    e
                )))
            }
        }
    }
    Ok(())
}
