// End-to-end tests against real child processes running the tether binary

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tether::bootstrap::{Spawned, Spawner};
use tether::{Channel, ConnectOptions, ContextError, Kwargs, Router, RouterConfig, Value};

const TETHER: &str = env!("CARGO_BIN_EXE_tether");

fn router() -> Router {
    Router::with_config(RouterConfig::default()).expect("router")
}

fn local(name: &str) -> ConnectOptions {
    ConnectOptions::local(name)
        .program(TETHER)
        .connect_timeout(Duration::from_secs(10))
}

fn call(context: &tether::Context, function: &str, args: Vec<Value>) -> tether::Result<Value> {
    context.call_with(function, args, Kwargs::new(), Some(Duration::from_secs(10)))
}

#[test]
fn test_ping_then_disconnect() {
    let router = router();
    let context = router.connect(local("pinger")).unwrap();

    assert_eq!(call(&context, "core.ping", vec![]).unwrap(), Value::Int(123));

    context.disconnect();
    assert!(matches!(
        call(&context, "core.ping", vec![]),
        Err(ContextError::LostConnection { .. })
    ));

    router.shutdown();
    router.join();
}

#[test]
fn test_child_is_another_process() {
    let router = router();
    let context = router.connect(local("worker")).unwrap();

    let pid = call(&context, "core.getpid", vec![]).unwrap();
    assert_ne!(pid, Value::Int(i64::from(std::process::id())));
    assert_eq!(pid.as_int().map(|p| p as u32), context.pid());

    assert_eq!(
        call(&context, "core.add", vec![Value::Int(40), Value::Int(2)]).unwrap(),
        Value::Int(42)
    );
    assert_eq!(
        call(&context, "core.echo", vec![Value::Str("hi".into())]).unwrap(),
        Value::Str("hi".into())
    );

    router.shutdown();
    router.join();
}

#[test]
fn test_remote_failure_is_an_error_value() {
    let router = router();
    let context = router.connect(local("failing")).unwrap();

    match call(&context, "core.fail", vec![Value::Str("out of widgets".into())]) {
        Err(ContextError::Call(err)) => {
            assert_eq!(err.kind, "requested");
            assert_eq!(err.message, "out of widgets");
        }
        other => panic!("unexpected {:?}", other),
    }
    match call(&context, "no.such.function", vec![]) {
        Err(ContextError::Call(err)) => assert_eq!(err.kind, "not_found"),
        other => panic!("unexpected {:?}", other),
    }
    // The stream survives remote failures
    assert_eq!(call(&context, "core.ping", vec![]).unwrap(), Value::Int(123));

    router.shutdown();
    router.join();
}

#[test]
fn test_deadline_disconnects() {
    let router = router();
    let context = router.connect(local("sleepy")).unwrap();

    let start = Instant::now();
    let result = context.call_with(
        "core.sleep_ms",
        vec![Value::Int(10_000)],
        Kwargs::new(),
        Some(Duration::from_millis(200)),
    );
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(ContextError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5));
    assert!(!context.is_connected());

    router.shutdown();
    router.join();
}

#[test]
fn test_disconnect_fails_every_pending_call() {
    let router = router();
    let context = router.connect(local("busy")).unwrap();

    let callers: Vec<_> = (0..4)
        .map(|_| {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                context.call_with("core.sleep_ms", vec![Value::Int(10_000)], Kwargs::new(), None)
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    context.disconnect();
    for caller in callers {
        assert!(matches!(
            caller.join().unwrap(),
            Err(ContextError::LostConnection { .. })
        ));
    }
    assert!(start.elapsed() < Duration::from_secs(5));

    router.shutdown();
    router.join();
}

#[test]
fn test_channel_receives_stream_of_values() {
    let router = router();
    let context = router.connect(local("counter")).unwrap();

    let channel = Channel::open(&context).unwrap();
    let handle = Value::Int(channel.handle() as i64);
    assert_eq!(
        call(&context, "core.count", vec![handle, Value::Int(5)]).unwrap(),
        Value::Int(5)
    );

    let values: Vec<Value> = channel.collect();
    assert_eq!(values, (0..5).map(Value::Int).collect::<Vec<_>>());

    router.shutdown();
    router.join();
}

#[test]
fn test_grandchild_through_proxy() {
    let router = router();
    let child = router.connect(local("child")).unwrap();
    let grandchild = router.connect_via(&child, local("grandchild")).unwrap();

    assert!(grandchild.is_proxied());
    assert_ne!(grandchild.id(), child.id());
    assert_eq!(call(&grandchild, "core.ping", vec![]).unwrap(), Value::Int(123));

    let child_pid = call(&child, "core.getpid", vec![]).unwrap();
    let grandchild_pid = call(&grandchild, "core.getpid", vec![]).unwrap();
    assert_ne!(child_pid, grandchild_pid);

    router.shutdown();
    router.join();
}

#[test]
fn test_killed_grandchild_fails_pending_calls() {
    let router = router();
    let child = router.connect(local("child")).unwrap();
    let grandchild = router.connect_via(&child, local("grandchild")).unwrap();

    let pid = call(&grandchild, "core.getpid", vec![]).unwrap();
    let pid = Pid::from_raw(pid.as_int().expect("pid") as i32);

    let (done, result) = mpsc::channel();
    let caller = Arc::clone(&grandchild);
    thread::spawn(move || {
        let outcome =
            caller.call_with("core.sleep_ms", vec![Value::Int(60_000)], Kwargs::new(), None);
        let _ = done.send(outcome);
    });
    thread::sleep(Duration::from_millis(200));
    kill(pid, Signal::SIGKILL).unwrap();

    let outcome = result
        .recv_timeout(Duration::from_secs(10))
        .expect("pending call still blocked after the grandchild died");
    assert!(matches!(outcome, Err(ContextError::LostConnection { .. })));

    let deadline = Instant::now() + Duration::from_secs(5);
    while grandchild.is_connected() {
        assert!(Instant::now() < deadline, "grandchild still reported connected");
        thread::sleep(Duration::from_millis(20));
    }
    assert!(matches!(
        call(&grandchild, "core.ping", vec![]),
        Err(ContextError::LostConnection { .. })
    ));

    // The intermediary is unaffected
    assert!(child.is_connected());
    assert_eq!(call(&child, "core.ping", vec![]).unwrap(), Value::Int(123));

    router.shutdown();
    router.join();
}

#[test]
fn test_shutdown_request_ends_child() {
    let router = router();
    let context = router.connect(local("obedient")).unwrap();

    context.shutdown().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while context.is_connected() {
        assert!(Instant::now() < deadline, "child ignored shutdown");
        thread::sleep(Duration::from_millis(20));
    }

    router.shutdown();
    router.join();
}

/// A transport whose far end prints a banner instead of the handshake
struct Chatty;

impl Spawner for Chatty {
    fn spawn(&self, _argv: &[String]) -> io::Result<Spawned> {
        let (ours, mut theirs) = UnixStream::pair()?;
        thread::spawn(move || {
            use std::io::Write;
            let _ = theirs.write_all(b"Last login: Tue Mar  3 09:12:44\n");
            thread::sleep(Duration::from_secs(1));
        });
        let ours = OwnedFd::from(ours);
        Ok(Spawned {
            pid: None,
            read: ours.try_clone()?,
            write: ours,
            stderr: None,
        })
    }
}

#[test]
fn test_unexpected_handshake_fails_fast() {
    let router = router();
    let start = Instant::now();
    let result = router.connect_with_spawner(local("chatty"), &Chatty);

    assert!(matches!(result, Err(ContextError::BootstrapFailed(_))));
    assert!(start.elapsed() < Duration::from_secs(5));

    router.shutdown();
    router.join();
}
