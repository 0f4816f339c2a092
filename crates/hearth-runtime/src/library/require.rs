use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::engine::{get_property, run_source, set_property, string, throw_error, throw_type_error};
use crate::error::{report_exception, ScriptError};
use crate::files::{append_extension_if_missing, directory_of, to_absolute, FileSystem};

const ROOT_RESOLVER: u64 = 0;

/// Directory a `require` function resolves against. Child resolvers hold a
/// weak handle whose finalizer reports the function as collected.
struct Resolver {
    dir: PathBuf,
    _function: Option<v8::Weak<v8::Function>>,
}

/// `require` for guest modules.
///
/// Every module gets its own `require` resolving against the module's
/// directory. The directory is a host-side resolver record that lives as long
/// as the guest keeps that `require` function reachable. Modules and resolvers
/// belong to one context and are reset when a new one is bound.
pub struct ModuleLoader {
    files: Rc<dyn FileSystem>,
    extension: String,
    /// Absolute module path -> `module` object
    cache: RefCell<HashMap<PathBuf, v8::Global<v8::Object>>>,
    resolvers: RefCell<HashMap<u64, Resolver>>,
    /// Resolver ids whose function was collected, swept outside the GC
    released: Rc<RefCell<Vec<u64>>>,
    next_resolver: Cell<u64>,
}

impl ModuleLoader {
    pub fn new(files: Rc<dyn FileSystem>, extension: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            files,
            extension: extension.into(),
            cache: RefCell::new(HashMap::new()),
            resolvers: RefCell::new(HashMap::new()),
            released: Rc::new(RefCell::new(Vec::new())),
            next_resolver: Cell::new(ROOT_RESOLVER + 1),
        })
    }

    /// Installs the top-level `require`, resolving against `base_dir`.
    /// Forgets the modules and resolvers of any previous context.
    pub fn bind<'s>(&self, scope: &mut v8::HandleScope<'s>, global: v8::Local<'s, v8::Object>, base_dir: &Path) {
        self.clear();
        self.resolvers.borrow_mut().insert(
            ROOT_RESOLVER,
            Resolver {
                dir: base_dir.to_path_buf(),
                _function: None,
            },
        );
        if let Some(require) = require_function(scope, ROOT_RESOLVER) {
            set_property(scope, global, "require", require.into());
        }
    }

    /// Number of modules in the cache
    pub fn cached_modules(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Number of `require` functions the host still tracks, the top-level one included
    pub fn live_resolvers(&self) -> usize {
        self.sweep_released();
        self.resolvers.borrow().len()
    }

    /// Drops resolvers whose `require` function was garbage collected
    pub fn sweep_released(&self) {
        let released = std::mem::take(&mut *self.released.borrow_mut());
        for id in released {
            let removed = self.resolvers.borrow_mut().remove(&id);
            if removed.is_some() {
                trace!(target: "hearth", "Released module resolver {}", id);
            }
        }
    }

    /// Forgets every module and resolver
    pub fn clear(&self) {
        let modules = std::mem::take(&mut *self.cache.borrow_mut());
        drop(modules);
        let resolvers = std::mem::take(&mut *self.resolvers.borrow_mut());
        drop(resolvers);
        self.released.borrow_mut().clear();
    }

    fn child_require<'s>(&self, scope: &mut v8::HandleScope<'s>, dir: PathBuf) -> Option<v8::Local<'s, v8::Function>> {
        let id = self.next_resolver.get();
        self.next_resolver.set(id + 1);

        let require = require_function(scope, id)?;
        let released = Rc::clone(&self.released);
        let weak = v8::Weak::with_finalizer(
            scope,
            require,
            Box::new(move |_: &mut v8::Isolate| released.borrow_mut().push(id)),
        );
        self.resolvers.borrow_mut().insert(
            id,
            Resolver {
                dir,
                _function: Some(weak),
            },
        );
        Some(require)
    }

    fn require<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        resolver: u64,
        request: v8::Local<'s, v8::Value>,
    ) -> Option<v8::Local<'s, v8::Value>> {
        let request = if request.is_string() {
            request.to_rust_string_lossy(scope)
        } else {
            String::new()
        };
        if request.is_empty() {
            throw_type_error(scope, "require expects a string path to script argument");
            return None;
        }

        let request = append_extension_if_missing(&request, &self.extension);
        if !allowed_path_start(&request) {
            throw_error(
                scope,
                "Unexpected characters at the start of module path. Only absolute and relative Unix and \
                 Windows file paths are allowed. Package name resolution is not supported, bundle such \
                 imports before loading them.",
            );
            return None;
        }

        let dir = self.resolvers.borrow().get(&resolver).map(|r| r.dir.clone());
        let Some(dir) = dir else {
            throw_error(scope, "Module resolver is no longer available");
            return None;
        };
        let path = to_absolute(&request, &dir);
        if !self.files.exists(&path) {
            throw_error(scope, &format!("File not found: {}", path.display()));
            return None;
        }

        let cached = self.cache.borrow().get(&path).cloned();
        if let Some(module) = cached {
            let module = v8::Local::new(scope, &module);
            return get_property(scope, module, "exports");
        }

        self.load(scope, &path)
    }

    fn load<'s>(&self, scope: &mut v8::HandleScope<'s>, path: &Path) -> Option<v8::Local<'s, v8::Value>> {
        let source = match self.files.read_text(path) {
            Ok(source) => source,
            Err(e) => {
                throw_error(scope, &format!("{:#}", e));
                return None;
            }
        };

        let wrapped =
            format!("(function(exports, require, module, __filename, __dirname) {{ {source}\n}})");
        let function = match run_source(scope, &path.display().to_string(), &wrapped) {
            Ok(value) => v8::Local::<v8::Function>::try_from(value).ok(),
            Err(e) => {
                report_exception(&e);
                None
            }
        };
        let Some(function) = function else {
            throw_error(scope, &format!("Failed to execute module {}", path.display()));
            return None;
        };

        let exports = v8::Object::new(scope);
        let module = v8::Object::new(scope);
        set_property(scope, module, "exports", exports.into());

        let dir = directory_of(path);
        let require = self.child_require(scope, dir.clone())?;

        // Cached before the body runs, so a require cycle sees the partial exports
        let cached = v8::Global::new(scope, module);
        self.cache.borrow_mut().insert(path.to_path_buf(), cached);
        debug!(target: "hearth", "Loading module {}", path.display());

        let filename = string(scope, &path.display().to_string());
        let dirname = string(scope, &dir.display().to_string());
        let args: [v8::Local<v8::Value>; 5] =
            [exports.into(), require.into(), module.into(), filename.into(), dirname.into()];
        let receiver: v8::Local<v8::Value> = v8::undefined(scope).into();

        let outcome = {
            let tc = &mut v8::TryCatch::new(scope);
            match function.call(tc, receiver, &args) {
                Some(_) => Ok(()),
                None => Err(ScriptError::from_try_catch(tc)),
            }
        };
        if let Err(e) = outcome {
            report_exception(&e);
            let evicted = self.cache.borrow_mut().remove(path);
            drop(evicted);
            throw_error(scope, &format!("Error loading the module: {}", path.display()));
            return None;
        }

        // The body may have replaced module.exports
        get_property(scope, module, "exports")
    }
}

/// A guest `require` bound to one resolver
fn require_function<'s>(scope: &mut v8::HandleScope<'s>, resolver: u64) -> Option<v8::Local<'s, v8::Function>> {
    let data = v8::Number::new(scope, resolver as f64);
    v8::Function::builder(require).data(data.into()).build(scope)
}

fn require<'s>(scope: &mut v8::HandleScope<'s>, args: v8::FunctionCallbackArguments<'s>, mut rv: v8::ReturnValue) {
    let Some(loader) = scope.get_slot::<Rc<ModuleLoader>>().cloned() else {
        return;
    };
    let resolver = args.data().integer_value(scope).unwrap_or(-1);
    let Ok(resolver) = u64::try_from(resolver) else {
        return;
    };
    if let Some(exports) = loader.require(scope, resolver, args.get(0)) {
        rv.set(exports);
    }
}

/// Accepts `./`, `../`, `/` and `X:\` prefixes (either slash for the relative forms)
fn allowed_path_start(path: &str) -> bool {
    let bytes = path.as_bytes();
    match bytes {
        [b'.', b'/' | b'\\', ..] => true,
        [b'.', b'.', b'/' | b'\\', ..] => true,
        [b'/', ..] => true,
        [drive, b':', b'\\', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_path_start() {
        for allowed in ["./a.js", ".\\a.js", "../a.js", "..\\a.js", "/abs/a.js", "C:\\a.js", "z:\\a.js"] {
            assert!(allowed_path_start(allowed), "{allowed} should be allowed");
        }
        for rejected in ["", ".", "..", "a.js", "lodash.js", ".a.js", "...js", "C:/a.js", "1:\\a.js"] {
            assert!(!allowed_path_start(rejected), "{rejected} should be rejected");
        }
    }
}
