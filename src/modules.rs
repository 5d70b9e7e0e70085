//! Serving module source to children on [`GET_MODULE`]
//!
//! Children fetch code they do not have by dotted name through
//! [`Context::get_module`](crate::context::Context::get_module). The
//! answering side plugs in a [`SourceProvider`]; lookups run on the
//! responder's own thread since providers usually touch the filesystem.

use crate::latch::Latch;
use crate::protocol::{Message, ModuleReply, ModuleRequest, ModuleSource, GET_MODULE};
use crate::router::Router;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Finds source for a fully qualified module name
pub trait SourceProvider: Send + Sync {
    /// `Ok(None)` when the module does not exist
    fn find(&self, fullname: &str) -> io::Result<Option<ModuleSource>>;
}

/// Serves `a.b` from `<root>/a/b.<ext>`, or `<root>/a/b/mod.<ext>` for a
/// package
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
    extension: String,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            root: root.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    fn read(path: &Path, is_package: bool) -> io::Result<Option<ModuleSource>> {
        match fs::read(path) {
            Ok(source) => Ok(Some(ModuleSource {
                path: path.display().to_string(),
                source,
                is_package,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl SourceProvider for DirectoryProvider {
    fn find(&self, fullname: &str) -> io::Result<Option<ModuleSource>> {
        let parts: Vec<&str> = fullname.split('.').collect();
        // Empty segments or path tricks never name a module
        if parts
            .iter()
            .any(|p| p.is_empty() || *p == ".." || p.contains('/') || p.contains('\\'))
        {
            return Ok(None);
        }

        let base = parts.iter().fold(self.root.clone(), |dir, part| dir.join(part));
        if let Some(module) = Self::read(&base.with_extension(&self.extension), false)? {
            return Ok(Some(module));
        }
        Self::read(&base.join(format!("mod.{}", self.extension)), true)
    }
}

/// Answers [`GET_MODULE`] requests for one router
pub struct ModuleResponder {
    router: Router,
    provider: Arc<dyn SourceProvider>,
    queue: Arc<Latch<Message>>,
}

impl ModuleResponder {
    pub fn new(router: &Router, provider: Arc<dyn SourceProvider>) -> Self {
        let queue = Arc::new(Latch::new());
        let sink = Arc::clone(&queue);
        router.add_handler(
            GET_MODULE,
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
            provider,
            queue,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("tether-modules".to_string())
            .spawn(move || {
                while let Ok(msg) = self.queue.get(None) {
                    self.answer(msg);
                }
            })
    }

    fn answer(&self, msg: Message) {
        let module = match msg.decode::<ModuleRequest>() {
            Ok(request) => match self.provider.find(&request.fullname) {
                Ok(module) => {
                    tracing::debug!(module = %request.fullname, found = module.is_some(), src = msg.src_id, "module request");
                    module
                }
                Err(err) => {
                    tracing::warn!(module = %request.fullname, error = %err, "module lookup failed");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(src = msg.src_id, error = %err, "malformed module request");
                None
            }
        };
        if !msg.wants_reply() {
            return;
        }
        let sent = msg
            .reply(self.router.id(), &ModuleReply { module })
            .and_then(|reply| self.router.route(reply));
        if let Err(err) = sent {
            tracing::debug!(src = msg.src_id, error = %err, "could not answer module request");
        }
    }
}
