//! Router configuration from defaults, .tetherrc and the environment
//!
//! Recognised settings, later sources overriding earlier ones:
//! - TETHER_LOG_LEVEL (0=error .. 4=trace, or a level name)
//! - TETHER_CONNECT_TIMEOUT=seconds
//! - TETHER_CALL_TIMEOUT=seconds (0 disables the default deadline)
//! - TETHER_MAX_FRAME_SIZE=bytes
//!
//! The rc file uses shell assignment syntax: `KEY=value`, optionally
//! prefixed by `export` and with single or double quotes.

use crate::codec::{AuthKey, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::Method;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time allowed for a child to complete the bootstrap handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Smallest frame limit accepted from configuration
const MIN_FRAME_SIZE: u32 = 4096;

/// Log verbosity carried across the bootstrap preamble
///
/// Stored as the integer the wire uses: 0=error, 1=warn, 2=info,
/// 3=debug, 4=trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LogLevel(u8);

impl LogLevel {
    pub const ERROR: LogLevel = LogLevel(0);
    pub const WARN: LogLevel = LogLevel(1);
    pub const INFO: LogLevel = LogLevel(2);
    pub const DEBUG: LogLevel = LogLevel(3);
    pub const TRACE: LogLevel = LogLevel(4);

    /// Clamp an arbitrary integer into range
    pub fn from_u8(level: u8) -> Self {
        LogLevel(level.min(4))
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Parse either a number or a level name
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(n) = s.parse::<u8>() {
            return Some(Self::from_u8(n));
        }
        match s.to_lowercase().as_str() {
            "error" => Some(Self::ERROR),
            "warn" | "warning" => Some(Self::WARN),
            "info" => Some(Self::INFO),
            "debug" => Some(Self::DEBUG),
            "trace" => Some(Self::TRACE),
            _ => None,
        }
    }

    pub fn to_tracing(self) -> tracing::Level {
        match self.0 {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::WARN,
            2 => tracing::Level::INFO,
            3 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }

    pub fn from_tracing(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Self::ERROR,
            tracing::Level::WARN => Self::WARN,
            tracing::Level::INFO => Self::INFO,
            tracing::Level::DEBUG => Self::DEBUG,
            _ => Self::TRACE,
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(self) -> &'static str {
        match self.0 {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }
}

/// Process-wide router settings
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    pub log_level: LogLevel,
    /// Bootstrap deadline used when a connection does not set its own
    pub connect_timeout: Duration,
    /// Deadline applied by `Context::call` when none is given
    pub call_timeout: Option<Duration>,
    /// Largest frame any stream will accept or produce
    pub max_frame_size: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::WARN,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl RouterConfig {
    /// Defaults, then ~/.tetherrc, then the environment
    pub fn load() -> Self {
        let mut config = Self::from_file(&Self::rc_path()).unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Get the path to .tetherrc
    pub fn rc_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tetherrc")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = RouterConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = parse_assignment(line) {
                config.set(&key, &unquote(&value));
            }
        }

        config
    }

    /// Override settings from environment variables
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in [
            "TETHER_LOG_LEVEL",
            "TETHER_CONNECT_TIMEOUT",
            "TETHER_CALL_TIMEOUT",
            "TETHER_MAX_FRAME_SIZE",
        ] {
            if let Some(value) = lookup(key) {
                self.set(key, value.trim());
            }
        }
    }

    /// Apply one setting; malformed values are ignored with a warning
    fn set(&mut self, key: &str, value: &str) {
        let applied = match key {
            "TETHER_LOG_LEVEL" => LogLevel::parse(value).map(|level| self.log_level = level),
            "TETHER_CONNECT_TIMEOUT" => parse_seconds(value)
                .filter(|d| !d.is_zero())
                .map(|d| self.connect_timeout = d),
            "TETHER_CALL_TIMEOUT" => {
                parse_seconds(value).map(|d| self.call_timeout = (!d.is_zero()).then_some(d))
            }
            "TETHER_MAX_FRAME_SIZE" => value
                .parse::<u32>()
                .ok()
                .map(|n| self.max_frame_size = n.max(MIN_FRAME_SIZE)),
            _ => return,
        };
        if applied.is_none() {
            tracing::warn!(key, value, "ignoring malformed setting");
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Name of the new context, used in logs and as its process title
    pub name: String,
    pub method: Method,
    /// Runtime binary to run on the far side; defaults to this executable
    pub program: Option<PathBuf>,
    /// Overrides [`RouterConfig::connect_timeout`]
    pub connect_timeout: Option<Duration>,
    /// Overrides the freshly generated stream key
    pub key: Option<AuthKey>,
    /// Sent when the transport asks for a password
    pub password: Option<String>,
}

impl ConnectOptions {
    pub fn new(name: impl Into<String>, method: Method) -> Self {
        Self {
            name: name.into(),
            method,
            program: None,
            connect_timeout: None,
            key: None,
            password: None,
        }
    }

    /// A child on this machine, running as the current user
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, Method::Local)
    }

    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn key(mut self, key: AuthKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Seconds, possibly fractional; `None` if negative or unrepresentable
fn parse_seconds(s: &str) -> Option<Duration> {
    Duration::try_from_secs_f64(s.parse::<f64>().ok()?).ok()
}
