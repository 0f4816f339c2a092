//! Host objects installed into every execution context
pub mod console;
pub mod performance;
pub mod require;
pub mod timer;

pub use console::ScriptLogger;
pub use require::ModuleLoader;
pub use timer::TimerService;
