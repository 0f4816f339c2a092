use std::path::PathBuf;

use thiserror::Error;
use tracing::error;

/// Failure of [`crate::Runtime::run_script_file`]. The engine stays alive either way.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Runtime is not initialized")]
    NotInitialized,
    #[error("Failed to run bootstrap script {}", path.display())]
    Bootstrap { path: PathBuf },
}

/// An exception caught from guest code, copied out of the engine
#[derive(Debug, Clone, Default, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    pub script: Option<String>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub stack: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub(crate) fn from_try_catch(tc: &mut v8::TryCatch<v8::HandleScope>) -> Self {
        let message = match tc.exception() {
            Some(exception) => crate::engine::display(tc, exception),
            None => "Execution terminated".to_string(),
        };

        let mut error = Self::new(message);
        if let Some(location) = tc.message() {
            error.script = location
                .get_script_resource_name(tc)
                .map(|name| crate::engine::display(tc, name));
            error.line = location.get_line_number(tc);
            error.column = Some(location.get_start_column());
        }
        error.stack = tc
            .stack_trace()
            .map(|stack| crate::engine::display(tc, stack))
            .filter(|stack| !stack.is_empty() && stack != "undefined");
        error
    }
}

/// Logs an exception that escaped guest code, with its location and stack
pub fn report_exception(exception: &ScriptError) {
    error!(
        target: "hearth",
        "Unhandled exception in {} on line {} column {}",
        exception.script.as_deref().unwrap_or("<unknown>"),
        exception.line.unwrap_or(0),
        exception.column.unwrap_or(0)
    );
    match &exception.stack {
        Some(stack) => error!(target: "hearth", "{}", stack),
        None => error!(target: "hearth", "{}", exception.message),
    }
}
