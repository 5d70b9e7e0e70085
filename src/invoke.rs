//! Serving calls: the function registry and its dispatcher
//!
//! Functions are registered by name with a typed signature; there is no
//! reflection. The [`Dispatcher`] claims the [`CALL_FUNCTION`] handle,
//! runs requests one at a time on its own thread, and always answers:
//! errors and panics become a [`CallError`] in the reply.

use crate::error::CallError;
use crate::latch::Latch;
use crate::protocol::{CallReply, CallRequest, ContextId, Message, CALL_FUNCTION};
use crate::router::Router;
use crate::value::{Kwargs, Value};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};

thread_local! {
    /// Set while this thread runs a registered function
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    /// Stack trace taken at the panic site, before unwinding
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records the trace of panics raised inside
/// functions; other panics go to the previous hook
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let trace = Backtrace::force_capture().to_string();
                PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

/// A callable function
pub type Function = Arc<dyn Fn(&Invocation<'_>) -> Result<Value, CallError> + Send + Sync>;

/// One call being served
pub struct Invocation<'a> {
    pub function: &'a str,
    pub args: &'a [Value],
    pub kwargs: &'a Kwargs,
    /// Context that made the call
    pub src_id: ContextId,
    pub router: &'a Router,
}

impl Invocation<'_> {
    pub fn arg(&self, index: usize) -> Result<&Value, CallError> {
        self.args.get(index).ok_or_else(|| {
            CallError::bad_argument(format!(
                "{}: missing argument {}",
                self.function, index
            ))
        })
    }

    pub fn int_arg(&self, index: usize) -> Result<i64, CallError> {
        let value = self.arg(index)?;
        value.as_int().ok_or_else(|| {
            CallError::bad_argument(format!(
                "{}: argument {} must be int, got {}",
                self.function,
                index,
                value.type_name()
            ))
        })
    }

    pub fn str_arg(&self, index: usize) -> Result<&str, CallError> {
        let value = self.arg(index)?;
        value.as_str().ok_or_else(|| {
            CallError::bad_argument(format!(
                "{}: argument {} must be str, got {}",
                self.function,
                index,
                value.type_name()
            ))
        })
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// Functions callable from other contexts
#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<String, Function>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.names())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(&Invocation<'_>) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run a function, converting panics into errors
    pub fn invoke(&self, invocation: &Invocation<'_>) -> CallReply {
        let function = self
            .functions
            .get(invocation.function)
            .ok_or_else(|| CallError::not_found(invocation.function))?;

        install_panic_hook();
        let outer = CAPTURING.with(|capturing| capturing.replace(true));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| function(invocation)));
        CAPTURING.with(|capturing| capturing.set(outer));

        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::warn!(function = invocation.function, %message, "function panicked");
                let trace = PANIC_TRACE.with(|slot| slot.borrow_mut().take());
                Err(CallError::new("panic", message).with_trace(trace.unwrap_or_default()))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}

/// Serves [`CALL_FUNCTION`] requests for one router
pub struct Dispatcher {
    router: Router,
    registry: Arc<Registry>,
    queue: Arc<Latch<Message>>,
}

impl Dispatcher {
    /// Claim the call handle on `router`
    ///
    /// Requests queue up from this point; they are served once
    /// [`run`](Self::run) is called.
    pub fn new(router: &Router, registry: Registry) -> Self {
        let queue = Arc::new(Latch::new());
        let sink = Arc::clone(&queue);
        router.add_handler(
            CALL_FUNCTION,
            Arc::new(move |msg: Message| {
                if msg.is_dead() {
                    sink.close();
                } else {
                    sink.put(msg);
                }
            }),
        );
        Self {
            router: router.clone(),
            registry: Arc::new(registry),
            queue,
        }
    }

    /// Serve requests on the calling thread until the router shuts down
    pub fn run(&self) {
        tracing::debug!(functions = ?self.registry.names(), "dispatcher running");
        while let Ok(msg) = self.queue.get(None) {
            self.serve(msg);
        }
        tracing::debug!("dispatcher stopped");
    }

    /// Serve requests on a background thread
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tether-dispatch".to_string())
            .spawn(move || self.run())
    }

    fn serve(&self, msg: Message) {
        let reply: CallReply = match msg.decode::<CallRequest>() {
            Ok(request) => {
                tracing::debug!(function = %request.function, src = msg.src_id, "serving call");
                let invocation = Invocation {
                    function: &request.function,
                    args: &request.args,
                    kwargs: &request.kwargs,
                    src_id: msg.src_id,
                    router: &self.router,
                };
                self.registry.invoke(&invocation)
            }
            Err(err) => Err(CallError::new("bad_request", err.to_string())),
        };

        if let Err(err) = &reply {
            tracing::debug!(kind = %err.kind, message = %err.message, "call failed");
        }
        if !msg.wants_reply() {
            return;
        }
        let sent = msg
            .reply(self.router.id(), &reply)
            .and_then(|reply| self.router.route(reply));
        if let Err(err) = sent {
            tracing::warn!(src = msg.src_id, error = %err, "could not deliver reply");
        }
    }
}
