mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{eval, runtime_in, write};
use hearth_runtime::{v8, CancelToken, CancellationBridge, GuestAbortContext, Runtime, ScriptError};
use tempfile::tempdir;

const ABORT_CONTEXT: &str = r#"
globalThis.ctx = {
    isAborted: false,
    listeners: [],
    addOnAbort(fn) { this.listeners.push(fn) },
    removeOnAbort(fn) { this.listeners = this.listeners.filter((f) => f !== fn) },
    abort() {
        this.isAborted = true;
        for (const fn of this.listeners.slice()) fn();
    },
};
"#;

/// A token that is cancelled from the start
struct AlreadyCancelled;

impl CancelToken for AlreadyCancelled {
    fn is_cancelled(&self, _scope: &mut v8::HandleScope) -> bool {
        true
    }

    fn on_cancel(&self, _scope: &mut v8::HandleScope, _callback: v8::Local<v8::Function>) -> Result<(), ScriptError> {
        panic!("a cancelled token is never subscribed to");
    }

    fn off_cancel(&self, _scope: &mut v8::HandleScope, _callback: v8::Local<v8::Function>) -> Result<(), ScriptError> {
        Ok(())
    }
}

fn setup() -> (tempfile::TempDir, Runtime) {
    let dir = tempdir().unwrap();
    write(dir.path(), "global.js", ABORT_CONTEXT);
    let runtime = runtime_in(dir.path());
    (dir, runtime)
}

/// Bridge on the guest `ctx` that counts abort callbacks
fn guest_bridge(runtime: &mut Runtime, object: &str) -> (CancellationBridge, Rc<Cell<u32>>) {
    let context = runtime.global_object(object).unwrap();
    let fired = Rc::new(Cell::new(0));
    let counter = Rc::clone(&fired);

    let scope = &mut runtime.handle_scope().unwrap();
    let bridge = CancellationBridge::new(
        scope,
        Some(Box::new(GuestAbortContext::new(context))),
        move |_: &mut v8::HandleScope| counter.set(counter.get() + 1),
    )
    .unwrap();
    (bridge, fired)
}

fn subscribe(runtime: &mut Runtime, bridge: &CancellationBridge) {
    bridge.subscribe(&mut runtime.handle_scope().unwrap());
}

fn unsubscribe(runtime: &mut Runtime, bridge: &CancellationBridge) {
    bridge.unsubscribe(&mut runtime.handle_scope().unwrap());
}

#[test]
fn test_missing_token_never_subscribes() {
    let (_dir, mut runtime) = setup();
    let scope = &mut runtime.handle_scope().unwrap();
    let bridge = CancellationBridge::new(scope, None, |_: &mut v8::HandleScope| panic!("nothing to abort")).unwrap();

    bridge.subscribe(scope);
    assert!(!bridge.is_subscribed());
    bridge.unsubscribe(scope);
}

#[test]
fn test_cancelled_token_fires_immediately() {
    let (_dir, mut runtime) = setup();
    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);

    let scope = &mut runtime.handle_scope().unwrap();
    let bridge = CancellationBridge::new(scope, Some(Box::new(AlreadyCancelled)), move |_: &mut v8::HandleScope| {
        flag.set(true)
    })
    .unwrap();
    bridge.subscribe(scope);

    assert!(fired.get());
    assert!(!bridge.is_subscribed());
}

#[test]
fn test_guest_abort_reaches_host_callback() {
    let (_dir, mut runtime) = setup();
    let (bridge, fired) = guest_bridge(&mut runtime, "ctx");

    subscribe(&mut runtime, &bridge);
    assert!(bridge.is_subscribed());
    assert_eq!(eval(&mut runtime, "ctx.listeners.length"), "1");

    eval(&mut runtime, "ctx.abort()");
    assert_eq!(fired.get(), 1);
}

#[test]
fn test_unsubscribe_is_idempotent() {
    let (_dir, mut runtime) = setup();
    let (bridge, fired) = guest_bridge(&mut runtime, "ctx");

    subscribe(&mut runtime, &bridge);
    subscribe(&mut runtime, &bridge);
    assert_eq!(eval(&mut runtime, "ctx.listeners.length"), "1", "subscribing twice registers once");

    unsubscribe(&mut runtime, &bridge);
    unsubscribe(&mut runtime, &bridge);
    assert!(!bridge.is_subscribed());
    assert_eq!(eval(&mut runtime, "ctx.listeners.length"), "0");

    eval(&mut runtime, "ctx.abort()");
    assert_eq!(fired.get(), 0);
}

#[test]
fn test_dropped_bridge_no_longer_reacts() {
    let (_dir, mut runtime) = setup();
    let (bridge, fired) = guest_bridge(&mut runtime, "ctx");
    subscribe(&mut runtime, &bridge);
    drop(bridge);

    // The guest still holds the listener, but the host side is gone
    assert_eq!(eval(&mut runtime, "ctx.listeners.length"), "1");
    eval(&mut runtime, "ctx.abort()");
    assert_eq!(fired.get(), 0);
}

#[test]
fn test_context_without_listener_methods_is_not_subscribed() {
    let (_dir, mut runtime) = setup();
    eval(&mut runtime, "globalThis.bare = { isAborted: false }");
    let (bridge, fired) = guest_bridge(&mut runtime, "bare");

    subscribe(&mut runtime, &bridge);
    assert!(!bridge.is_subscribed());
    assert_eq!(fired.get(), 0);
}
