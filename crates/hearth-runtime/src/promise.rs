use std::cell::RefCell;
use std::rc::Rc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::cancel::{CancelToken, CancellationBridge, ABORT_ERROR};
use crate::engine::{get_property, key_from_value, key_to_value, string};
use crate::lifetime::{LifetimeRegistry, SlotKey};

/// Names a pending host-side promise. Plain data: it can be sent anywhere,
/// but only the runtime that created it can settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseHandle(SlotKey);

/// One-shot settlement of a guest promise by host code
pub(crate) struct PromiseBridge {
    resolver: v8::Global<v8::PromiseResolver>,
    result: Option<Result<v8::Global<v8::Value>, v8::Global<v8::Value>>>,
    cancellation: Option<Rc<CancellationBridge>>,
}

pub(crate) type BridgeRegistry = Rc<RefCell<LifetimeRegistry<PromiseBridge>>>;

/// Creates a pending guest promise whose settlement is driven by the host.
///
/// With an abort context the bridge rejects itself with [`ABORT_ERROR`] once
/// the context is aborted, immediately if it already is.
pub(crate) fn create<'s>(
    scope: &mut v8::HandleScope<'s>,
    abort_context: Option<Box<dyn CancelToken>>,
) -> Option<(v8::Local<'s, v8::Promise>, PromiseHandle)> {
    let registry = scope.get_slot::<BridgeRegistry>().cloned()?;
    let resolver = v8::PromiseResolver::new(scope)?;
    let promise = resolver.get_promise(scope);
    let handle = PromiseHandle(registry.borrow_mut().insert(PromiseBridge {
        resolver: v8::Global::new(scope, resolver),
        result: None,
        cancellation: None,
    }));

    if let Some(token) = abort_context {
        let on_abort = move |scope: &mut v8::HandleScope| {
            let reason = string(scope, ABORT_ERROR);
            settle(scope, handle, Err(reason.into()));
        };
        if let Some(cancellation) = CancellationBridge::new(scope, Some(token), on_abort) {
            let cancellation = Rc::new(cancellation);
            if let Some(bridge) = registry.borrow_mut().get_mut(handle.0) {
                bridge.cancellation = Some(Rc::clone(&cancellation));
            }
            // May abort synchronously, which settles through the registry
            cancellation.subscribe(scope);
        }
    }

    Some((promise, handle))
}

/// Records the outcome and defers its visibility to the next microtask checkpoint.
/// Returns false when the handle is unknown or already settled.
pub fn settle(
    scope: &mut v8::HandleScope,
    handle: PromiseHandle,
    outcome: Result<v8::Local<v8::Value>, v8::Local<v8::Value>>,
) -> bool {
    let Some(registry) = scope.get_slot::<BridgeRegistry>().cloned() else {
        return false;
    };
    let unsettled = registry
        .borrow()
        .get(handle.0)
        .is_some_and(|bridge| bridge.result.is_none());
    if !unsettled {
        return false;
    }

    let data = key_to_value(scope, handle.0.to_bits());
    let Some(completion) = v8::Function::builder(complete_callback).data(data).build(scope) else {
        return false;
    };
    let outcome = match outcome {
        Ok(value) => Ok(v8::Global::new(scope, value)),
        Err(reason) => Err(v8::Global::new(scope, reason)),
    };
    if let Some(bridge) = registry.borrow_mut().get_mut(handle.0) {
        bridge.result = Some(outcome);
    }

    scope.enqueue_microtask(completion);
    true
}

fn complete_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let Some(registry) = scope.get_slot::<BridgeRegistry>().cloned() else {
        return;
    };
    if let Some(key) = key_from_value(args.data()) {
        complete(scope, &registry, PromiseHandle(SlotKey::from_bits(key)));
    }
}

fn complete(scope: &mut v8::HandleScope, registry: &BridgeRegistry, handle: PromiseHandle) {
    let cancellation = registry
        .borrow()
        .get(handle.0)
        .and_then(|bridge| bridge.cancellation.clone());
    if let Some(cancellation) = cancellation {
        cancellation.unsubscribe(scope);
    }

    // Destroyed before the guest sees the outcome, so reactions can never reach it
    let removed = registry.borrow_mut().remove(handle.0);
    let Some(PromiseBridge {
        resolver, result, ..
    }) = removed
    else {
        return;
    };
    trace!(target: "hearth", "Settling host promise {:?}", handle);

    let resolver = v8::Local::new(scope, &resolver);
    match result {
        Some(Ok(value)) => {
            let value = v8::Local::new(scope, &value);
            resolver.resolve(scope, value);
        }
        Some(Err(reason)) => {
            let reason = v8::Local::new(scope, &reason);
            let reason = abort_reason(scope, reason);
            resolver.reject(scope, reason);
        }
        None => {}
    }
}

/// Swaps the abort sentinel for the context's `SIGABORT` symbol when there is one
fn abort_reason<'s>(scope: &mut v8::HandleScope<'s>, reason: v8::Local<'s, v8::Value>) -> v8::Local<'s, v8::Value> {
    if !reason.is_string() || reason.to_rust_string_lossy(scope) != ABORT_ERROR {
        return reason;
    }
    let global = scope.get_current_context().global(scope);
    match get_property(scope, global, "SIGABORT") {
        Some(symbol) if symbol.is_symbol() => symbol,
        _ => reason,
    }
}

/// Engine-independent value that can cross threads
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl HostValue {
    pub fn to_v8<'s>(&self, scope: &mut v8::HandleScope<'s>) -> v8::Local<'s, v8::Value> {
        match self {
            HostValue::Undefined => v8::undefined(scope).into(),
            HostValue::Null => v8::null(scope).into(),
            HostValue::Bool(b) => v8::Boolean::new(scope, *b).into(),
            HostValue::Number(n) => v8::Number::new(scope, *n).into(),
            HostValue::String(s) => string(scope, s).into(),
        }
    }
}

impl From<()> for HostValue {
    fn from(_: ()) -> Self {
        HostValue::Undefined
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Number(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Number(value as f64)
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

#[derive(Debug)]
pub(crate) struct Settlement {
    pub(crate) handle: PromiseHandle,
    pub(crate) outcome: Result<HostValue, HostValue>,
}

/// Settles host promises from any thread. Settlements are applied on the
/// engine thread during the next pump.
#[derive(Debug, Clone)]
pub struct Settler {
    tx: UnboundedSender<Settlement>,
}

impl Settler {
    /// Returns false once the runtime that issued this settler is gone
    pub fn resolve(&self, handle: PromiseHandle, value: impl Into<HostValue>) -> bool {
        self.send(handle, Ok(value.into()))
    }

    pub fn reject(&self, handle: PromiseHandle, reason: impl Into<HostValue>) -> bool {
        self.send(handle, Err(reason.into()))
    }

    fn send(&self, handle: PromiseHandle, outcome: Result<HostValue, HostValue>) -> bool {
        self.tx.send(Settlement { handle, outcome }).is_ok()
    }
}

pub(crate) fn settlement_channel() -> (Settler, UnboundedReceiver<Settlement>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Settler { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::with_scope;
    use crate::engine::run_source;

    #[test]
    fn test_abort_error_kept_without_symbol() {
        with_scope(|scope| {
            let sentinel = string(scope, ABORT_ERROR).into();
            let reason = abort_reason(scope, sentinel);
            assert_eq!(reason.to_rust_string_lossy(scope), ABORT_ERROR);

            let symbol = run_source(scope, "inline.js", "globalThis.SIGABORT = Symbol('SIGABORT')").unwrap();
            let reason = abort_reason(scope, sentinel);
            assert!(reason.strict_equals(symbol));

            let other = string(scope, "Timeout").into();
            assert_eq!(abort_reason(scope, other).to_rust_string_lossy(scope), "Timeout");
        });
    }

    #[test]
    fn test_host_values_convert() {
        with_scope(|scope| {
            let values = [
                HostValue::from(()),
                HostValue::Null,
                HostValue::from(true),
                HostValue::from(2.5),
                HostValue::from("hp"),
            ];
            let shown: Vec<String> = values
                .iter()
                .map(|value| {
                    let value = value.to_v8(scope);
                    value.to_rust_string_lossy(scope)
                })
                .collect();
            assert_eq!(shown, ["undefined", "null", "true", "2.5", "hp"]);
        });
    }
}
