//! V8 plumbing shared by the runtime and the host library.
//!
//! One platform per process, one isolate per [`crate::Runtime`]. Host state
//! lives in isolate slots so native callbacks can find it from the scope they
//! are handed.
use std::sync::Once;

use crate::error::ScriptError;

static INIT: Once = Once::new();

/// Initializes the process-wide V8 platform. Later calls do nothing.
pub fn init_platform() {
    INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

/// Isolate with microtasks under host control
pub(crate) fn new_isolate() -> v8::OwnedIsolate {
    init_platform();
    let mut isolate = v8::Isolate::new(v8::CreateParams::default());
    isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
    isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);
    isolate
}

/// Runs queued platform work (finalizers, background GC) without blocking
pub(crate) fn pump_platform(isolate: &mut v8::Isolate) {
    while v8::Platform::pump_message_loop(&v8::V8::get_current_platform(), isolate, false) {}
}

pub fn string<'s>(scope: &mut v8::HandleScope<'s, ()>, text: &str) -> v8::Local<'s, v8::String> {
    v8::String::new(scope, text).unwrap_or_else(|| v8::String::empty(scope))
}

pub fn get_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let key = string(scope, name);
    object.get(scope, key.into())
}

pub fn set_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
    value: v8::Local<'s, v8::Value>,
) {
    let key = string(scope, name);
    object.set(scope, key.into(), value);
}

/// Installs a native function as `object[name]`
pub(crate) fn set_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    if let Some(function) = v8::Function::new(scope, callback) {
        let key = string(scope, name);
        function.set_name(key);
        object.set(scope, key.into(), function.into());
    }
}

/// Human-readable form of any value. Symbols print as `Symbol(description)`
/// instead of throwing.
pub fn display(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    if let Ok(symbol) = v8::Local::<v8::Symbol>::try_from(value) {
        let description = symbol.description(scope);
        return format!("Symbol({})", description.to_rust_string_lossy(scope));
    }
    value.to_rust_string_lossy(scope)
}

/// Compiles and runs `source` in the current context. `name` is the script's
/// resource name in stack traces.
pub fn run_source<'s>(
    scope: &mut v8::HandleScope<'s>,
    name: &str,
    source: &str,
) -> Result<v8::Local<'s, v8::Value>, ScriptError> {
    let tc = &mut v8::TryCatch::new(scope);
    let source = string(tc, source);
    let resource_name = string(tc, name);
    let origin = v8::ScriptOrigin::new(
        tc,
        resource_name.into(),
        0,
        0,
        false,
        0,
        None,
        false,
        false,
        false,
        None,
    );

    let result = v8::Script::compile(tc, source, Some(&origin)).and_then(|script| script.run(tc));
    result.ok_or_else(|| ScriptError::from_try_catch(tc))
}

pub(crate) fn throw_error(scope: &mut v8::HandleScope, message: &str) {
    let message = string(scope, message);
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

pub(crate) fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    let message = string(scope, message);
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
}

/// Packs a 64-bit host key into a value native callbacks get back as `args.data()`
pub(crate) fn key_to_value<'s>(scope: &mut v8::HandleScope<'s>, bits: u64) -> v8::Local<'s, v8::Value> {
    v8::BigInt::new_from_u64(scope, bits).into()
}

pub(crate) fn key_from_value(value: v8::Local<v8::Value>) -> Option<u64> {
    let bits = v8::Local::<v8::BigInt>::try_from(value).ok()?;
    match bits.u64_value() {
        (bits, true) => Some(bits),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::with_scope;
    use super::*;

    #[test]
    fn test_run_source_returns_completion_value() {
        with_scope(|scope| {
            let value = run_source(scope, "inline.js", "[1, 2].map(n => n * 2).join()").unwrap();
            assert_eq!(display(scope, value), "2,4");
        });
    }

    #[test]
    fn test_run_source_captures_location() {
        with_scope(|scope| {
            let err = run_source(scope, "broken.js", "\nthrow new RangeError('too far');").unwrap_err();
            assert_eq!(err.message, "RangeError: too far");
            assert_eq!(err.script.as_deref(), Some("broken.js"));
            assert_eq!(err.line, Some(2));
            assert!(err.stack.as_deref().is_some_and(|s| s.contains("broken.js:2")));
        });
    }

    #[test]
    fn test_display_handles_symbols() {
        with_scope(|scope| {
            let value = run_source(scope, "inline.js", "Symbol('SIGABORT')").unwrap();
            assert_eq!(display(scope, value), "Symbol(SIGABORT)");
        });
    }

    #[test]
    fn test_keys_survive_the_trip_through_v8() {
        with_scope(|scope| {
            let value = key_to_value(scope, u64::MAX - 1);
            assert_eq!(key_from_value(value), Some(u64::MAX - 1));
            let number = v8::Number::new(scope, 3.0);
            assert_eq!(key_from_value(number.into()), None);
        });
    }
}
