#![allow(dead_code)]

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use hearth_runtime::engine::display;
use hearth_runtime::{v8, FileSystem, OsFileSystem, Runtime, RuntimeConfig};

/// Writes `contents` to `dir/relative`, creating parent directories
pub fn write(dir: &Path, relative: &str, contents: &str) -> PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

pub fn no_binder(_: &mut v8::HandleScope, _: v8::Local<v8::Object>) {}

/// Initialized runtime rooted at `dir`, with the bootstrap script already run.
/// An empty `global.js` is written when the test did not provide one.
pub fn runtime_in(dir: &Path) -> Runtime {
    runtime_with(dir, RuntimeConfig::default())
}

pub fn runtime_with(dir: &Path, config: RuntimeConfig) -> Runtime {
    start(dir, Runtime::new(config))
}

/// Like [`runtime_in`], reading every file through `files`
pub fn runtime_on(dir: &Path, files: Rc<dyn FileSystem>) -> Runtime {
    start(dir, Runtime::new(RuntimeConfig::default()).with_file_system(files))
}

fn start(dir: &Path, mut runtime: Runtime) -> Runtime {
    if !dir.join("global.js").exists() {
        write(dir, "global.js", "");
    }
    runtime.initialize(dir);
    runtime
        .run_script_file(&dir.join("main.js"), &no_binder, |_| {})
        .unwrap();
    runtime
}

/// Runs `source` in the active context and returns its completion value as text
pub fn eval(runtime: &mut Runtime, source: &str) -> String {
    let value = runtime.run_script("eval.js", source).expect("script threw");
    let scope = &mut runtime.handle_scope().expect("no active context");
    let value = v8::Local::new(scope, &value);
    display(scope, value)
}

/// Process filesystem that counts how often it is asked
#[derive(Default)]
pub struct CountingFileSystem {
    exists_calls: Cell<usize>,
    reads: Cell<usize>,
}

impl CountingFileSystem {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.get()
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    /// Total filesystem calls of either kind
    pub fn touches(&self) -> usize {
        self.exists_calls() + self.reads()
    }
}

impl FileSystem for CountingFileSystem {
    fn read_text(&self, path: &Path) -> Result<String> {
        self.reads.set(self.reads.get() + 1);
        OsFileSystem.read_text(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.exists_calls.set(self.exists_calls.get() + 1);
        OsFileSystem.exists(path)
    }
}

/// Numeric value of a result handed back by the runtime
pub fn number(runtime: &mut Runtime, value: &v8::Global<v8::Value>) -> Option<f64> {
    let scope = &mut runtime.handle_scope()?;
    let value = v8::Local::new(scope, value);
    value.number_value(scope)
}

/// Runs `source` and returns what it threw as `Name: message`, or `no error`
pub fn error_of(runtime: &mut Runtime, source: &str) -> String {
    eval(
        runtime,
        &format!("(() => {{ try {{ {source}; return 'no error' }} catch (e) {{ return String(e) }} }})()"),
    )
}
