//! Host runtime embedding a single-threaded V8 isolate
//!
//! The runtime owns the engine, drives its task and microtask queues once per
//! host frame, and installs the host library every script context gets:
//! `logger`, timers, `performance` and `require`. Host code settles guest
//! promises through [`Runtime::create_promise`] or, from other threads,
//! through a [`Settler`].
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod files;
pub mod frame_loop;
pub mod library;
pub mod lifetime;
pub mod logging;
pub mod promise;
pub mod rejection;
pub mod runtime;
pub mod tasks;

pub use cancel::{CancelToken, CancellationBridge, GuestAbortContext, ABORT_ERROR};
pub use config::{ConfigError, RuntimeConfig, ScriptLogLevel};
pub use error::{report_exception, RunError, ScriptError};
pub use files::{FileSystem, OsFileSystem};
pub use frame_loop::run_frame_loop;
pub use library::ScriptLogger;
pub use promise::{HostValue, PromiseHandle, Settler};
pub use runtime::{Call, HostObjectBinder, Runtime};

pub use v8;
