#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, bail, Context as _, Result};
use std::env;
use std::process;
use std::time::Duration;
use tether::{child, logging, ConnectOptions, Kwargs, Method, Registry, Router, RouterConfig, Value};

fn main() {
    if let Some(result) = child::run_if_child(Registry::new()) {
        if let Err(err) = result {
            eprintln!("tether: {}", err);
            process::exit(1);
        }
        return;
    }

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(2);
    }

    let result = match args[1].as_str() {
        "call" => call(&args[2..]),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Error: Unknown command '{}'", other);
            print_usage();
            process::exit(2);
        }
    };

    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}

/// Options for `tether call`
#[derive(Debug)]
struct CallArgs {
    method: Method,
    timeout: Option<Duration>,
    function: String,
    args: Vec<Value>,
}

fn parse_call_args(args: &[String]) -> Result<CallArgs> {
    let mut method = Method::Local;
    let mut timeout = None;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--via" => {
                let spec = args.get(i + 1).ok_or_else(|| anyhow!("--via needs a method"))?;
                method = Method::parse(spec).map_err(|e| anyhow!(e))?;
                i += 2;
            }
            "--timeout" => {
                let secs = args.get(i + 1).ok_or_else(|| anyhow!("--timeout needs seconds"))?;
                let secs: f64 = secs
                    .parse()
                    .with_context(|| format!("invalid timeout '{}'", secs))?;
                if secs.is_nan() || secs <= 0.0 {
                    bail!("timeout must be positive");
                }
                let secs = Duration::try_from_secs_f64(secs)
                    .map_err(|_| anyhow!("timeout '{}' is out of range", secs))?;
                timeout = Some(secs);
                i += 2;
            }
            _ => break,
        }
    }

    let function = args
        .get(i)
        .cloned()
        .ok_or_else(|| anyhow!("missing function name"))?;
    let args = args[i + 1..].iter().map(|a| Value::parse_arg(a)).collect();

    Ok(CallArgs {
        method,
        timeout,
        function,
        args,
    })
}

/// Connect, call one function, print its result as JSON
fn call(args: &[String]) -> Result<()> {
    let call = parse_call_args(args)?;

    let config = RouterConfig::load();
    logging::init(config.log_level);
    let timeout = call.timeout.or(config.call_timeout);
    let router = Router::with_config(config)?;

    let result = (|| -> Result<Value> {
        let context = router.connect(ConnectOptions::new("cli", call.method.clone()))?;
        let value = context.call_with(&call.function, call.args.clone(), Kwargs::new(), timeout)?;
        context.disconnect();
        Ok(value)
    })();

    router.shutdown();
    router.join();

    let value = result.with_context(|| format!("calling {}", call.function))?;
    println!("{}", value.to_json());
    Ok(())
}

fn print_usage() {
    println!("tether v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: tether call [--via METHOD] [--timeout SECS] FUNCTION [ARGS...]");
    println!();
    println!("Methods:");
    println!("  local                  Child process on this machine (default)");
    println!("  ssh:[user@]host[:port] Child on another host");
    println!("  sudo[:user]            Child as another user via sudo");
    println!("  su[:user]              Child as another user via su");
    println!("  doas[:user]            Child as another user via doas");
    println!("  docker:container       Child inside a running container");
    println!("  podman:container       Child inside a running container");
    println!();
    println!("Arguments are parsed as int, float, true/false, nil, else string.");
}
