//! Sandboxed hook runtime
//!
//! Hooks are rhai scripts shipped under a bundle's `meta/` directory
//! and run at lifecycle points (pre/post install, update, uninstall).
//! The interpreter exposes a read-only `context` object, a `dirs`
//! module with the relevant directories, and an `os` module with
//! `getenv` and confined file creation. There is no host exec, no
//! network, and no filesystem access outside the hook's directories.

use std::cell::RefCell;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, EvalAltResult, Map, Module, Scope};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from running a hook.
#[derive(Error, Debug)]
pub enum HookError {
    /// The hook script failed to parse, raised an error, or completed
    /// with a non-zero status.
    #[error("hook '{hook}' failed: {message}")]
    Failed {
        /// Hook name (e.g. `pre-install`).
        hook: String,
        /// Underlying interpreter message.
        message: String,
    },

    /// The hook ran past its wall-clock timeout.
    #[error("hook '{hook}' timed out after {seconds}s")]
    Timeout {
        /// Hook name.
        hook: String,
        /// Configured timeout in seconds.
        seconds: u64,
    },

    /// The caller cancelled while the hook was running.
    #[error("hook '{hook}' cancelled")]
    Cancelled {
        /// Hook name.
        hook: String,
    },
}

/// Values exposed to hook scripts as `context`.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Artifact name.
    pub name: String,
    /// Artifact version being installed or removed.
    pub version: String,
    /// Target os token.
    pub os: String,
    /// Target arch token.
    pub arch: String,
    /// Previous version during updates; empty otherwise.
    pub old_version: String,
    /// Where `data/` payloads land.
    pub install_path: PathBuf,
    /// The artifact's final meta directory.
    pub meta_dir: PathBuf,
    /// Staging meta directory of the incoming bundle.
    pub temp_meta_dir: PathBuf,
}

/// A file handle held by a hook script.
#[derive(Debug, Clone)]
struct ScriptFile(Rc<RefCell<Option<std::fs::File>>>);

impl ScriptFile {
    fn write_string(&mut self, text: &str) -> Result<(), Box<EvalAltResult>> {
        let mut slot = self.0.borrow_mut();
        let Some(file) = slot.as_mut() else {
            return Err("file is closed".into());
        };
        file.write_all(text.as_bytes())
            .map_err(|e| e.to_string().into())
    }

    fn close(&mut self) {
        self.0.borrow_mut().take();
    }
}

/// Executes hook scripts with a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct HookRunner {
    timeout: Duration,
}

impl HookRunner {
    /// Create a runner with the given per-hook timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run the script at `script_path` as hook `hook`.
    ///
    /// Side effects of the script are not rolled back on failure; the
    /// caller only learns whether the hook succeeded.
    pub fn run(
        &self,
        hook: &str,
        script_path: &Path,
        ctx: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        let script = std::fs::read_to_string(script_path).map_err(|e| HookError::Failed {
            hook: hook.to_string(),
            message: format!("cannot read script {}: {e}", script_path.display()),
        })?;

        let engine = self.build_engine(ctx, cancel);
        let mut scope = Scope::new();
        scope.push_constant("context", context_map(ctx));

        tracing::debug!(hook, script = %script_path.display(), "running hook");
        let result = engine.eval_with_scope::<Dynamic>(&mut scope, &script);

        match result {
            Ok(value) => {
                if let Some(status) = value.clone().try_cast::<rhai::INT>() {
                    if status != 0 {
                        return Err(HookError::Failed {
                            hook: hook.to_string(),
                            message: format!("completed with status {status}"),
                        });
                    }
                }
                Ok(())
            }
            Err(e) => match *e {
                EvalAltResult::ErrorTerminated(token, _) => {
                    if token.clone().try_cast::<bool>() == Some(true) {
                        Err(HookError::Cancelled {
                            hook: hook.to_string(),
                        })
                    } else {
                        Err(HookError::Timeout {
                            hook: hook.to_string(),
                            seconds: self.timeout.as_secs(),
                        })
                    }
                }
                other => Err(HookError::Failed {
                    hook: hook.to_string(),
                    message: other.to_string(),
                }),
            },
        }
    }

    fn build_engine(&self, ctx: &HookContext, cancel: &CancellationToken) -> Engine {
        let mut engine = Engine::new();

        let started = Instant::now();
        let timeout = self.timeout;
        let cancel = cancel.clone();
        engine.on_progress(move |_| {
            if cancel.is_cancelled() {
                // true token = cancelled, false = timed out
                return Some(Dynamic::from(true));
            }
            if started.elapsed() > timeout {
                return Some(Dynamic::from(false));
            }
            None
        });

        engine.register_type_with_name::<ScriptFile>("File");
        engine.register_fn("write_string", ScriptFile::write_string);
        engine.register_fn("close", ScriptFile::close);

        let roots = vec![
            ctx.install_path.clone(),
            ctx.meta_dir.clone(),
            ctx.temp_meta_dir.clone(),
        ];
        let default_root = ctx.meta_dir.clone();

        let mut os_module = Module::new();
        os_module.set_native_fn("create", move |path: &str| {
            let resolved = confine(path, &default_root, &roots)
                .map_err(|e| -> Box<EvalAltResult> { e.into() })?;
            let file = std::fs::File::create(&resolved)
                .map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })?;
            Ok(ScriptFile(Rc::new(RefCell::new(Some(file)))))
        });
        os_module.set_native_fn("getenv", |name: &str| {
            Ok(std::env::var(name).unwrap_or_default())
        });
        engine.register_static_module("os", os_module.into());

        let mut dirs_module = Module::new();
        dirs_module.set_var("install_dir", ctx.install_path.display().to_string());
        dirs_module.set_var("meta_dir", ctx.meta_dir.display().to_string());
        dirs_module.set_var("temp_meta_dir", ctx.temp_meta_dir.display().to_string());
        engine.register_static_module("dirs", dirs_module.into());

        engine
    }
}

fn context_map(ctx: &HookContext) -> Map {
    let mut map = Map::new();
    map.insert("name".into(), ctx.name.clone().into());
    map.insert("version".into(), ctx.version.clone().into());
    map.insert("os".into(), ctx.os.clone().into());
    map.insert("arch".into(), ctx.arch.clone().into());
    map.insert("old_version".into(), ctx.old_version.clone().into());
    map.insert(
        "install_path".into(),
        ctx.install_path.display().to_string().into(),
    );
    map.insert(
        "meta_dir".into(),
        ctx.meta_dir.display().to_string().into(),
    );
    map.insert(
        "temp_meta_dir".into(),
        ctx.temp_meta_dir.display().to_string().into(),
    );
    map
}

/// Resolve a script-supplied path and require it to stay inside one of
/// the allowed roots. Relative paths resolve against the meta dir (the
/// hook's working directory).
fn confine(raw: &str, default_root: &Path, roots: &[PathBuf]) -> Result<PathBuf, String> {
    let path = Path::new(raw);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        default_root.join(path)
    };

    let mut clean = PathBuf::new();
    for comp in absolute.components() {
        match comp {
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(format!("path '{raw}' escapes the hook sandbox"));
                }
            }
            Component::CurDir => {}
            other => clean.push(other),
        }
    }

    if roots.iter().any(|root| clean.starts_with(root)) {
        Ok(clean)
    } else {
        Err(format!("path '{raw}' is outside the hook sandbox"))
    }
}
