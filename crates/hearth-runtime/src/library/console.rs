use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::config::ScriptLogLevel;
use crate::engine::{display, set_function, set_property};

/// Threshold and module tag for guest `logger` output. Shared with the
/// isolate, so changes apply to the next logged line.
#[derive(Debug)]
pub struct ScriptLogger {
    level: Cell<ScriptLogLevel>,
    module: RefCell<String>,
}

impl ScriptLogger {
    pub fn new(level: ScriptLogLevel, module: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            level: Cell::new(level),
            module: RefCell::new(module.into()),
        })
    }

    pub fn level(&self) -> ScriptLogLevel {
        self.level.get()
    }

    pub fn set_level(&self, level: ScriptLogLevel) {
        self.level.set(level);
    }

    pub fn module(&self) -> String {
        self.module.borrow().clone()
    }

    pub fn set_module(&self, module: impl Into<String>) {
        *self.module.borrow_mut() = module.into();
    }

    /// Emits under the `script` target, tagged with the module name
    pub fn emit(&self, level: ScriptLogLevel, line: &str) {
        if !self.level.get().allows(level) {
            return;
        }
        let module = self.module.borrow();
        let module = module.as_str();
        match level {
            ScriptLogLevel::Debug => debug!(target: "script", module, "{}", line),
            ScriptLogLevel::Info => info!(target: "script", module, "{}", line),
            ScriptLogLevel::Warn => warn!(target: "script", module, "{}", line),
            ScriptLogLevel::Error => error!(target: "script", module, "{}", line),
            ScriptLogLevel::None => {}
        }
    }
}

/// Installs the `logger` object
pub fn bind<'s>(scope: &mut v8::HandleScope<'s>, global: v8::Local<'s, v8::Object>) {
    let logger = v8::Object::new(scope);
    set_function(scope, logger, "debug", log_debug);
    set_function(scope, logger, "info", log_info);
    set_function(scope, logger, "log", log_info);
    set_function(scope, logger, "warn", log_warn);
    set_function(scope, logger, "error", log_error);
    set_property(scope, global, "logger", logger.into());
}

fn log_debug(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    log(scope, &args, ScriptLogLevel::Debug);
}

fn log_info(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    log(scope, &args, ScriptLogLevel::Info);
}

fn log_warn(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    log(scope, &args, ScriptLogLevel::Warn);
}

fn log_error(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    log(scope, &args, ScriptLogLevel::Error);
}

fn log(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments, level: ScriptLogLevel) {
    let Some(logger) = scope.get_slot::<Rc<ScriptLogger>>().cloned() else {
        return;
    };
    // Skips formatting arguments nobody will see
    if !logger.level().allows(level) {
        return;
    }
    let line = (0..args.length())
        .map(|i| display(scope, args.get(i)))
        .collect::<Vec<_>>()
        .join(" ");
    logger.emit(level, &line);
}
