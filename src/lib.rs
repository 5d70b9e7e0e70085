// Library interface for tether
// The binary, benchmarks and integration tests all go through here

pub mod bootstrap;
pub mod broker;
pub mod builtins;
pub mod channel;
pub mod child;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod invoke;
pub mod latch;
pub mod logging;
pub mod modules;
pub mod protocol;
pub mod router;
pub mod side;
pub mod stream;
pub mod transport;
pub mod value;

pub use channel::{Channel, Sender};
pub use config::{ConnectOptions, LogLevel, RouterConfig};
pub use context::{Context, PendingCall};
pub use error::{CallError, ContextError, Result, StreamError};
pub use invoke::{Dispatcher, Invocation, Registry};
pub use router::Router;
pub use transport::Method;
pub use value::{Kwargs, Value};
