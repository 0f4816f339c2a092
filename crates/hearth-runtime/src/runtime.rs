use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::cancel::{AbortHandlers, CancelToken};
use crate::config::{RuntimeConfig, ScriptLogLevel};
use crate::engine::{self, get_property, run_source, set_property, string};
use crate::error::{report_exception, RunError, ScriptError};
use crate::files::{directory_of, FileSystem, OsFileSystem};
use crate::library::performance::{self, PerformanceClock};
use crate::library::{console, ModuleLoader, ScriptLogger, TimerService};
use crate::promise::{self, BridgeRegistry, HostValue, PromiseHandle, Settlement, Settler};
use crate::rejection::RejectionTracker;
use crate::tasks::{delay_from_secs, TaskQueue};

/// Binds embedder-specific objects into each new execution context
pub trait HostObjectBinder {
    fn bind_into_global_scope<'s>(&self, scope: &mut v8::HandleScope<'s>, global: v8::Local<'s, v8::Object>);
}

impl<F> HostObjectBinder for F
where
    F: for<'s> Fn(&mut v8::HandleScope<'s>, v8::Local<'s, v8::Object>),
{
    fn bind_into_global_scope<'s>(&self, scope: &mut v8::HandleScope<'s>, global: v8::Local<'s, v8::Object>) {
        self(scope, global)
    }
}

type ReceiverProvider<'a> =
    Box<dyn for<'s> FnOnce(&mut v8::HandleScope<'s>) -> Option<v8::Local<'s, v8::Object>> + 'a>;
type ArgsProvider<'a> = Box<dyn for<'s> FnOnce(&mut v8::HandleScope<'s>) -> Vec<v8::Local<'s, v8::Value>> + 'a>;
type ResultCallback<'a> = Box<dyn for<'s> FnOnce(&mut v8::HandleScope<'s>, Option<v8::Local<'s, v8::Value>>) + 'a>;

/// How to call a named guest function: on which object, with which arguments,
/// and who wants the result.
#[derive(Default)]
pub struct Call<'a> {
    require_existing: bool,
    receiver: Option<ReceiverProvider<'a>>,
    args: Option<ArgsProvider<'a>>,
    on_result: Option<ResultCallback<'a>>,
}

impl<'a> Call<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log an error when the function is missing instead of skipping silently
    pub fn require_existing(mut self) -> Self {
        self.require_existing = true;
        self
    }

    /// Object to look the function up on (default: the context global)
    pub fn receiver(
        mut self,
        provider: impl for<'s> FnOnce(&mut v8::HandleScope<'s>) -> Option<v8::Local<'s, v8::Object>> + 'a,
    ) -> Self {
        self.receiver = Some(Box::new(provider));
        self
    }

    pub fn args(
        mut self,
        provider: impl for<'s> FnOnce(&mut v8::HandleScope<'s>) -> Vec<v8::Local<'s, v8::Value>> + 'a,
    ) -> Self {
        self.args = Some(Box::new(provider));
        self
    }

    /// Called with the return value, or `None` when the call did not complete
    pub fn on_result(
        mut self,
        callback: impl for<'s> FnOnce(&mut v8::HandleScope<'s>, Option<v8::Local<'s, v8::Value>>) + 'a,
    ) -> Self {
        self.on_result = Some(Box::new(callback));
        self
    }
}

/// Engine state that exists between `initialize` and `dispose`
struct Engine {
    base_dir: PathBuf,
    context: Option<v8::Global<v8::Context>>,
    tasks: Rc<TaskQueue>,
    timers: Rc<TimerService>,
    modules: Rc<ModuleLoader>,
    bridges: BridgeRegistry,
    aborts: AbortHandlers,
    rejections: Rc<RejectionTracker>,
    settler: Settler,
    settlements: UnboundedReceiver<Settlement>,
    // Declared last so every handle above is released before the isolate goes
    isolate: v8::OwnedIsolate,
}

impl Engine {
    /// Handle scope inside the active context, if one was created
    fn scope(&mut self) -> Option<v8::HandleScope<'_>> {
        let context = self.context.as_ref()?;
        Some(v8::HandleScope::with_context(&mut self.isolate, context))
    }
}

fn checkpoint(scope: &mut v8::HandleScope, rejections: &RejectionTracker) {
    scope.perform_microtask_checkpoint();
    rejections.check_unhandled_rejections(scope);
}

/// The embedded script runtime.
///
/// Everything is a no-op before [`Runtime::initialize`] and after
/// [`Runtime::dispose`]; a disposed runtime can be initialized again.
pub struct Runtime {
    config: RuntimeConfig,
    files: Rc<dyn FileSystem>,
    script_log: Rc<ScriptLogger>,
    engine: Option<Engine>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let script_log = ScriptLogger::new(config.script_log_level, config.script_module_name.clone());
        Self {
            config,
            files: Rc::new(OsFileSystem),
            script_log,
            engine: None,
        }
    }

    /// Replaces the filesystem used for modules and the bootstrap script
    pub fn with_file_system(mut self, files: Rc<dyn FileSystem>) -> Self {
        self.files = files;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ===== Lifecycle =====

    /// Brings up the engine. `location_hint` (a file or directory) is the base
    /// directory unless the config names one.
    pub fn initialize(&mut self, location_hint: &Path) {
        if self.engine.is_some() {
            return;
        }

        let base_dir = self.config.base_dir.clone().unwrap_or_else(|| {
            if location_hint.is_dir() {
                location_hint.to_path_buf()
            } else {
                directory_of(location_hint)
            }
        });

        let mut isolate = engine::new_isolate();
        let tasks = Rc::new(TaskQueue::new());
        let timers = TimerService::new(
            Rc::clone(&tasks),
            self.config.timeout_default_ms,
            self.config.interval_default_ms,
        );
        let modules = ModuleLoader::new(Rc::clone(&self.files), self.config.module_extension.clone());
        let bridges = BridgeRegistry::default();
        let aborts = AbortHandlers::default();
        let rejections = RejectionTracker::new();
        let (settler, settlements) = promise::settlement_channel();

        rejections.install(&mut isolate);
        isolate.set_slot(Rc::clone(&timers));
        isolate.set_slot(Rc::clone(&modules));
        isolate.set_slot(Rc::clone(&bridges));
        isolate.set_slot(Rc::clone(&aborts));
        isolate.set_slot(Rc::clone(&self.script_log));
        isolate.set_slot(PerformanceClock::new(Instant::now()));

        info!(target: "hearth", "Runtime initialized (base dir: {})", base_dir.display());
        self.engine = Some(Engine {
            base_dir,
            context: None,
            tasks,
            timers,
            modules,
            bridges,
            aborts,
            rejections,
            settler,
            settlements,
            isolate,
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Tears down the rejection tracker, then the engine with everything it owns
    pub fn dispose(&mut self) {
        let Some(mut engine) = self.engine.take() else {
            return;
        };

        engine.rejections.uninstall(&mut engine.isolate);
        let bridges = engine.bridges.borrow_mut().clear();
        drop(bridges);
        let aborts = engine.aborts.borrow_mut().clear();
        drop(aborts);
        engine.timers.clear_all();
        engine.tasks.clear();
        engine.modules.clear();
        engine.context = None;
        drop(engine);

        info!(target: "hearth", "Runtime disposed");
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.engine.as_ref().map(|engine| engine.base_dir.as_path())
    }

    /// Handle scope inside the active context, for host code that works with
    /// guest values directly
    pub fn handle_scope(&mut self) -> Option<v8::HandleScope<'_>> {
        self.engine.as_mut()?.scope()
    }

    // ===== Scripts =====

    /// Creates a fresh context with the host library, binds the embedder's
    /// objects, runs the bootstrap script and then calls `on_ready`.
    ///
    /// `path` is exposed to guest code as `modScriptPath`; loading it is the
    /// bootstrap script's job. Modules cached by an earlier context are dropped.
    pub fn run_script_file(
        &mut self,
        path: &Path,
        binder: &dyn HostObjectBinder,
        on_ready: impl FnOnce(&mut Runtime),
    ) -> Result<(), RunError> {
        let engine = self.engine.as_mut().ok_or(RunError::NotInitialized)?;
        let bootstrap = engine.base_dir.join(&self.config.bootstrap_script);
        let base_dir = engine.base_dir.clone();
        let modules = Rc::clone(&engine.modules);

        {
            let scope = &mut v8::HandleScope::new(&mut engine.isolate);
            let context = v8::Context::new(scope, Default::default());
            let scope = &mut v8::ContextScope::new(scope, context);
            let global = context.global(scope);

            console::bind(scope, global);
            TimerService::bind(scope, global);
            performance::bind(scope, global);
            modules.bind(scope, global, &base_dir);

            let description = string(scope, "SIGABORT");
            let sigabort = v8::Symbol::new(scope, Some(description));
            set_property(scope, global, "SIGABORT", sigabort.into());
            let script_path = string(scope, &path.display().to_string());
            set_property(scope, global, "modScriptPath", script_path.into());

            binder.bind_into_global_scope(scope, global);
            engine.context = Some(v8::Global::new(scope, context));

            debug!(target: "hearth", "Loading {}", bootstrap.display());
            let source = match self.files.read_text(&bootstrap) {
                Ok(source) => source,
                Err(e) => {
                    error!(target: "hearth", "Error reading bootstrap script: {:#}", e);
                    return Err(RunError::Bootstrap { path: bootstrap });
                }
            };
            if let Err(e) = run_source(scope, &bootstrap.display().to_string(), &source) {
                report_exception(&e);
                return Err(RunError::Bootstrap { path: bootstrap });
            }
        }

        on_ready(self);
        Ok(())
    }

    /// Runs inline source in the active context. Exceptions are logged.
    pub fn run_script(&mut self, name: &str, source: &str) -> Option<v8::Global<v8::Value>> {
        let scope = &mut self.engine.as_mut()?.scope()?;
        match run_source(scope, name, source) {
            Ok(value) => Some(v8::Global::new(scope, value)),
            Err(e) => {
                report_exception(&e);
                None
            }
        }
    }

    /// Named object on the context global
    pub fn global_object(&mut self, name: &str) -> Option<v8::Global<v8::Object>> {
        let scope = &mut self.engine.as_mut()?.scope()?;
        let global = scope.get_current_context().global(scope);
        let value = get_property(scope, global, name)?;
        let object = v8::Local::<v8::Object>::try_from(value).ok()?;
        Some(v8::Global::new(scope, object))
    }

    // ===== Invocation =====

    /// Calls `name` on the receiver (default: the context global). Exceptions are
    /// logged and never reach the caller.
    pub fn invoke_function(&mut self, name: &str, call: Call<'_>) -> Option<v8::Global<v8::Value>> {
        let scope = &mut self.engine.as_mut()?.scope()?;

        let receiver = match call.receiver {
            Some(provider) => provider(scope),
            None => Some(scope.get_current_context().global(scope)),
        };
        let Some(receiver) = receiver else {
            error!(target: "hearth", "No receiver to look up '{}' on", name);
            return None;
        };

        let function = get_property(scope, receiver, name)
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());
        let result = match function {
            Some(function) => {
                let args = call.args.map(|provider| provider(scope)).unwrap_or_default();
                let tc = &mut v8::TryCatch::new(scope);
                let result = function.call(tc, receiver.into(), &args);
                if result.is_none() {
                    report_exception(&ScriptError::from_try_catch(tc));
                }
                result
            }
            None => {
                if call.require_existing {
                    error!(target: "hearth", "Function '{}' not found or is not callable.", name);
                }
                None
            }
        };

        if let Some(callback) = call.on_result {
            callback(scope, result);
        }
        result.map(|value| v8::Global::new(scope, value))
    }

    /// Calls the configured event handler with `event` prepended to the arguments
    pub fn dispatch_event(&mut self, event: &str, mut call: Call<'_>) {
        let user_args = call.args.take();
        let event = event.to_string();
        let call = call.require_existing().args(move |scope| {
            let mut args: Vec<v8::Local<v8::Value>> = vec![string(scope, &event).into()];
            if let Some(provider) = user_args {
                args.extend(provider(scope));
            }
            args
        });

        let handler = self.config.event_handler.clone();
        self.invoke_function(&handler, call);
    }

    // ===== Frame pump =====

    /// Runs one frame of engine work and returns the number of macro-tasks run.
    ///
    /// Applies cross-thread settlements, drains microtasks and reports unhandled
    /// rejections, then runs up to `max_tasks_per_frame` ready tasks, each
    /// followed by another checkpoint. Leftover tasks wait for the next frame.
    pub fn pump_once(&mut self) -> usize {
        let max_tasks = self.config.max_tasks_per_frame;
        let Some(engine) = self.engine.as_mut() else {
            return 0;
        };

        engine::pump_platform(&mut engine.isolate);
        engine.modules.sweep_released();

        let mut settlements = Vec::new();
        while let Ok(settlement) = engine.settlements.try_recv() {
            settlements.push(settlement);
        }
        let tasks = Rc::clone(&engine.tasks);
        let rejections = Rc::clone(&engine.rejections);
        let Some(mut scope) = engine.scope() else {
            return 0;
        };
        let scope = &mut scope;

        for settlement in settlements {
            let outcome = match &settlement.outcome {
                Ok(value) => Ok(value.to_v8(scope)),
                Err(reason) => Err(reason.to_v8(scope)),
            };
            if !promise::settle(scope, settlement.handle, outcome) {
                debug!(target: "hearth", "Ignoring settlement for {:?}", settlement.handle);
            }
        }
        checkpoint(scope, &rejections);

        let mut ran = 0;
        while ran < max_tasks && tasks.run_one(scope) {
            checkpoint(scope, &rejections);
            ran += 1;
        }
        ran
    }

    pub fn post_task(&self, task: impl FnOnce(&mut v8::HandleScope) + 'static) {
        if let Some(engine) = &self.engine {
            engine.tasks.post(Box::new(task));
        }
    }

    pub fn post_delayed_task(&self, task: impl FnOnce(&mut v8::HandleScope) + 'static, delay_secs: f64) {
        if let Some(engine) = &self.engine {
            engine.tasks.post_delayed(Box::new(task), delay_from_secs(delay_secs));
        }
    }

    /// Forces a full garbage collection and releases host records of collected
    /// guest objects
    pub fn collect_garbage(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.isolate.low_memory_notification();
            engine::pump_platform(&mut engine.isolate);
            engine.modules.sweep_released();
        }
    }

    // ===== Host promises =====

    /// Creates a guest promise settled by the host through the returned handle
    pub fn create_promise(
        &mut self,
        abort_context: Option<Box<dyn CancelToken>>,
    ) -> Option<(v8::Global<v8::Promise>, PromiseHandle)> {
        let scope = &mut self.engine.as_mut()?.scope()?;
        let (promise, handle) = promise::create(scope, abort_context)?;
        Some((v8::Global::new(scope, promise), handle))
    }

    /// Resolves the promise; the guest sees it at the next microtask checkpoint.
    /// Returns false if it was already settled.
    pub fn resolve(&mut self, handle: PromiseHandle, value: impl Into<HostValue>) -> bool {
        let value: HostValue = value.into();
        self.settle(handle, Ok(value))
    }

    pub fn reject(&mut self, handle: PromiseHandle, reason: impl Into<HostValue>) -> bool {
        let reason: HostValue = reason.into();
        self.settle(handle, Err(reason))
    }

    fn settle(&mut self, handle: PromiseHandle, outcome: Result<HostValue, HostValue>) -> bool {
        let Some(mut scope) = self.engine.as_mut().and_then(Engine::scope) else {
            return false;
        };
        let scope = &mut scope;
        let outcome = match outcome {
            Ok(value) => Ok(value.to_v8(scope)),
            Err(reason) => Err(reason.to_v8(scope)),
        };
        promise::settle(scope, handle, outcome)
    }

    /// A `Send` handle for settling promises from other threads
    pub fn settler(&self) -> Option<Settler> {
        self.engine.as_ref().map(|engine| engine.settler.clone())
    }

    // ===== Guest logging =====

    pub fn set_script_log_level(&self, level: ScriptLogLevel) {
        self.script_log.set_level(level);
    }

    /// Tag attached to guest log lines from now on
    pub fn set_script_module_name(&self, name: &str) {
        self.script_log.set_module(name);
    }

    // ===== Introspection =====

    pub fn pending_tasks(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.tasks.len())
    }

    pub fn active_timers(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.timers.active_count())
    }

    pub fn pending_promises(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.bridges.borrow().len())
    }

    /// Rejections waiting for the next checkpoint
    pub fn pending_rejections(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.rejections.pending())
    }

    /// Unhandled rejections reported since `initialize`
    pub fn reported_rejections(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.rejections.reported())
    }

    pub fn cached_modules(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.modules.cached_modules())
    }

    pub fn live_resolvers(&self) -> usize {
        self.engine.as_ref().map_or(0, |engine| engine.modules.live_resolvers())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.dispose();
    }
}
