//! Functions every runtime serves under the `core.` prefix

use crate::bootstrap::ProcessSpawner;
use crate::channel::Sender;
use crate::codec::AuthKey;
use crate::config::ConnectOptions;
use crate::error::{CallError, ContextError};
use crate::invoke::{Invocation, Registry};
use crate::latch::deadline_after;
use crate::router::{ProxyConnect, Router};
use crate::value::Value;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of `core.sleep_ms`, so shutdown is not held up
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Delay before `core.shutdown` acts, letting its reply go out
const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

/// Value returned by `core.ping`
pub const PING_REPLY: i64 = 123;

fn context_error(err: ContextError) -> CallError {
    CallError::new("context_error", err.to_string())
}

pub fn register(registry: &mut Registry) {
    registry.register("core.ping", |_| Ok(Value::Int(PING_REPLY)));
    registry.register("core.getpid", |_| Ok(Value::Int(i64::from(std::process::id()))));
    registry.register("core.echo", echo);
    registry.register("core.add", add);
    registry.register("core.sleep_ms", sleep_ms);
    registry.register("core.fail", |inv| {
        let message = inv.args.first().and_then(Value::as_str).unwrap_or("failure requested");
        Err(CallError::new("requested", message))
    });
    registry.register("core.getenv", |inv| {
        Ok(std::env::var(inv.str_arg(0)?).map_or(Value::Nil, Value::Str))
    });
    registry.register("core.count", count);
    registry.register("core.allocate_id", |inv| {
        let id = inv.router.allocate_id().map_err(context_error)?;
        Ok(Value::Int(i64::from(id)))
    });
    registry.register("core.connect", connect);
    registry.register("core.shutdown", shutdown);
}

/// A single argument comes back as is, several as a list
fn echo(inv: &Invocation<'_>) -> Result<Value, CallError> {
    match inv.args {
        [] => Ok(Value::Nil),
        [single] => Ok(single.clone()),
        many => Ok(Value::List(many.to_vec())),
    }
}

fn add(inv: &Invocation<'_>) -> Result<Value, CallError> {
    let mut int_sum: i64 = 0;
    let mut float_sum: Option<f64> = None;
    for (index, value) in inv.args.iter().enumerate() {
        match value {
            Value::Int(n) => {
                int_sum = int_sum.checked_add(*n).ok_or_else(|| {
                    CallError::new("overflow", "core.add: integer overflow")
                })?;
            }
            Value::Float(f) => *float_sum.get_or_insert(0.0) += f,
            other => {
                return Err(CallError::bad_argument(format!(
                    "core.add: argument {} must be a number, got {}",
                    index,
                    other.type_name()
                )))
            }
        }
    }
    Ok(match float_sum {
        Some(f) => Value::Float(f + int_sum as f64),
        None => Value::Int(int_sum),
    })
}

fn sleep_ms(inv: &Invocation<'_>) -> Result<Value, CallError> {
    let ms = inv.int_arg(0)?;
    let ms = u64::try_from(ms)
        .map_err(|_| CallError::bad_argument("core.sleep_ms: negative duration"))?;
    let deadline = deadline_after(Duration::from_millis(ms));
    while inv.router.is_alive() {
        let now = Instant::now();
        let left = deadline.map_or(SLEEP_SLICE, |deadline| deadline.saturating_duration_since(now));
        if left.is_zero() {
            break;
        }
        thread::sleep(SLEEP_SLICE.min(left));
    }
    Ok(Value::Nil)
}

/// `core.count(handle, n)`: send 0..n to the caller's channel, then close it
fn count(inv: &Invocation<'_>) -> Result<Value, CallError> {
    let handle = u64::try_from(inv.int_arg(0)?)
        .map_err(|_| CallError::bad_argument("core.count: bad channel handle"))?;
    let n = inv.int_arg(1)?;
    let sender = Sender::new(inv.router.clone(), inv.src_id, handle);
    for i in 0..n {
        sender.send(&Value::Int(i)).map_err(context_error)?;
    }
    sender.close().map_err(context_error)?;
    Ok(Value::Int(n))
}

/// Bootstrap a child on behalf of an ancestor; returns its pid
fn connect(inv: &Invocation<'_>) -> Result<Value, CallError> {
    let request: ProxyConnect = serde_json::from_str(inv.str_arg(0)?)
        .map_err(|e| CallError::bad_argument(format!("core.connect: {}", e)))?;
    let options = proxy_options(request.clone())?;

    let context = inv
        .router
        .connect_as(request.context_id, options, &ProcessSpawner)
        .map_err(context_error)?;
    Ok(context.pid().map_or(Value::Nil, |pid| Value::Int(i64::from(pid))))
}

fn proxy_options(request: ProxyConnect) -> Result<ConnectOptions, CallError> {
    let mut options = ConnectOptions::new(request.name, request.method);
    if let Some(program) = request.program {
        options = options.program(program);
    }
    if let Some(ms) = request.connect_timeout_ms {
        options = options.connect_timeout(Duration::from_millis(ms));
    }
    if let Some(hex) = request.key_hex {
        let key = AuthKey::from_hex(&hex)
            .ok_or_else(|| CallError::bad_argument("core.connect: malformed key"))?;
        options = options.key(key);
    }
    if let Some(password) = request.password {
        options = options.password(password);
    }
    Ok(options)
}

fn shutdown(inv: &Invocation<'_>) -> Result<Value, CallError> {
    let router: Router = inv.router.clone();
    thread::Builder::new()
        .name("tether-shutdown".to_string())
        .spawn(move || {
            thread::sleep(SHUTDOWN_DELAY);
            router.shutdown();
        })
        .map_err(|e| CallError::new("io_error", e.to_string()))?;
    Ok(Value::Nil)
}
